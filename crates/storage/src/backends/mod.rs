//! Blob store backends.

pub mod cdn;
pub mod filesystem;
pub mod s3;

use crate::error::{StorageError, StorageResult};
use std::future::Future;
use std::time::Duration;

/// Bound a backend call. An elapsed deadline surfaces as
/// [`StorageError::Timeout`] so callers treat it as a transport fault.
pub(crate) async fn with_timeout<T, F>(
    after: Duration,
    operation: &'static str,
    fut: F,
) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = after.as_millis() as u64, "backend call timed out");
            Err(StorageError::Timeout { operation, after })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_is_timeout_error() {
        let result: StorageResult<()> = with_timeout(Duration::from_millis(10), "get", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(StorageError::Timeout {
                operation: "get",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn inner_result_passes_through() {
        let result = with_timeout(Duration::from_secs(1), "get", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
