//! Download URL construction and token signing for CDN-style backends.
//!
//! A signed URL looks like
//! `{base}/{prefix}/{blob_id}[/{file_name}]?token={t}&expires={e}[&k=v...]`
//! where `t = base64url_nopad(sha256(secret || resource_path || e || params))`.
//! `resource_path` is the percent-encoded URL path and `params` is the extra
//! query parameters sorted by key then value and joined as `k=v&k=v`.
//! The extra parameters are re-appended to the URL in that same order.

use crate::error::{StorageError, StorageResult};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};

/// Characters left unescaped in a path segment or query component.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const TOKEN_PARAM: &str = "token";
const EXPIRES_PARAM: &str = "expires";

/// Pieces of a download URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlParts {
    pub base: String,
    pub path_prefix: String,
    pub blob_id: String,
    pub file_name: Option<String>,
    pub extra_params: Vec<(String, String)>,
}

/// A download URL taken apart by [`parse_url`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedUrl {
    pub parts: UrlParts,
    pub token: Option<String>,
    pub expires: Option<i64>,
}

fn normalized_prefix(prefix: &str) -> &str {
    prefix.trim_matches('/')
}

fn resource_path(path_prefix: &str, blob_id: &str, file_name: Option<&str>) -> String {
    let mut path = String::new();
    let prefix = normalized_prefix(path_prefix);
    if !prefix.is_empty() {
        for segment in prefix.split('/') {
            path.push('/');
            path.extend(utf8_percent_encode(segment, COMPONENT));
        }
    }
    path.push('/');
    path.extend(utf8_percent_encode(blob_id, COMPONENT));
    if let Some(name) = file_name {
        path.push('/');
        path.extend(utf8_percent_encode(name, COMPONENT));
    }
    path
}

fn sorted_params(params: &[(String, String)]) -> StorageResult<Vec<(String, String)>> {
    for (key, _) in params {
        if key == TOKEN_PARAM || key == EXPIRES_PARAM {
            return Err(StorageError::InvalidUrl(format!(
                "query parameter '{key}' is reserved"
            )));
        }
    }
    let mut sorted = params.to_vec();
    sorted.sort();
    Ok(sorted)
}

fn canonical_params(sorted: &[(String, String)]) -> String {
    sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compute the URL token.
pub fn sign(secret: &str, resource_path: &str, expires: i64, sorted: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(resource_path.as_bytes());
    hasher.update(expires.to_string().as_bytes());
    hasher.update(canonical_params(sorted).as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Build a download URL. Signed when a secret is given.
pub fn build_url(parts: &UrlParts, signing: Option<(&str, i64)>) -> StorageResult<String> {
    let sorted = sorted_params(&parts.extra_params)?;
    let path = resource_path(&parts.path_prefix, &parts.blob_id, parts.file_name.as_deref());

    let mut query: Vec<String> = Vec::with_capacity(sorted.len() + 2);
    if let Some((secret, expires)) = signing {
        query.push(format!("{TOKEN_PARAM}={}", sign(secret, &path, expires, &sorted)));
        query.push(format!("{EXPIRES_PARAM}={expires}"));
    }
    for (k, v) in &sorted {
        query.push(format!(
            "{}={}",
            utf8_percent_encode(k, COMPONENT),
            utf8_percent_encode(v, COMPONENT)
        ));
    }

    let mut url = format!("{}{}", parts.base.trim_end_matches('/'), path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query.join("&"));
    }
    Ok(url)
}

fn decode(component: &str) -> StorageResult<String> {
    percent_decode_str(component)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| StorageError::InvalidUrl(format!("invalid percent-encoding: {e}")))
}

/// Inverse of [`build_url`] for URLs issued under `base` and `path_prefix`.
pub fn parse_url(url: &str, base: &str, path_prefix: &str) -> StorageResult<ParsedUrl> {
    let base = base.trim_end_matches('/');
    let rest = url
        .strip_prefix(base)
        .ok_or_else(|| StorageError::InvalidUrl(format!("url does not start with {base}")))?;
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let mut expected_prefix = String::new();
    let prefix = normalized_prefix(path_prefix);
    if !prefix.is_empty() {
        for segment in prefix.split('/') {
            expected_prefix.push('/');
            expected_prefix.extend(utf8_percent_encode(segment, COMPONENT));
        }
    }
    let tail = path
        .strip_prefix(&expected_prefix)
        .and_then(|t| t.strip_prefix('/'))
        .ok_or_else(|| StorageError::InvalidUrl(format!("url path outside prefix: {path}")))?;

    let (blob_id, file_name) = match tail.split_once('/') {
        Some((id, name)) => (decode(id)?, Some(decode(name)?)),
        None => (decode(tail)?, None),
    };
    if blob_id.is_empty() {
        return Err(StorageError::InvalidUrl("missing blob id".to_string()));
    }

    let mut token = None;
    let mut expires = None;
    let mut extra_params = Vec::new();
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let (k, v) = (decode(k)?, decode(v)?);
        match k.as_str() {
            TOKEN_PARAM => token = Some(v),
            EXPIRES_PARAM => {
                expires = Some(v.parse::<i64>().map_err(|e| {
                    StorageError::InvalidUrl(format!("invalid expires value '{v}': {e}"))
                })?)
            }
            _ => extra_params.push((k, v)),
        }
    }

    Ok(ParsedUrl {
        parts: UrlParts {
            base: base.to_string(),
            path_prefix: prefix.to_string(),
            blob_id,
            file_name,
            extra_params,
        },
        token,
        expires,
    })
}

/// Compare two tokens without exiting at the first differing byte.
fn tokens_match(expected: &str, presented: &str) -> bool {
    let (expected, presented) = (expected.as_bytes(), presented.as_bytes());
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Check the token and expiry of a signed URL against `now` (unix seconds).
pub fn verify_url(
    url: &str,
    base: &str,
    path_prefix: &str,
    secret: &str,
    now: i64,
) -> StorageResult<ParsedUrl> {
    let parsed = parse_url(url, base, path_prefix)?;
    let (Some(token), Some(expires)) = (parsed.token.as_deref(), parsed.expires) else {
        return Err(StorageError::InvalidSignature(
            "url is not signed".to_string(),
        ));
    };
    if expires < now {
        return Err(StorageError::UrlExpired {
            expired_at: expires,
        });
    }
    let sorted = sorted_params(&parsed.parts.extra_params)?;
    let path = resource_path(
        &parsed.parts.path_prefix,
        &parsed.parts.blob_id,
        parsed.parts.file_name.as_deref(),
    );
    if !tokens_match(&sign(secret, &path, expires, &sorted), token) {
        return Err(StorageError::InvalidSignature(
            "token does not match".to_string(),
        ));
    }
    Ok(parsed)
}
