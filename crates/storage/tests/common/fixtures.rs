use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic pseudo-random payload; equal seeds give equal bytes.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut state = seed;
    let data: Vec<u8> = (0..len)
        .map(|i| {
            if i % 8 == 0 {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
            }
            state.to_le_bytes()[i % 8]
        })
        .collect();
    Bytes::from(data)
}
