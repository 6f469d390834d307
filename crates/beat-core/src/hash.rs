// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed cache paths.

use std::path::Path;

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a string.
pub fn hash_string(value: &str) -> String {
    hash_bytes(value.as_bytes())
}

/// SHA-256 hex digest of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 hex digest of a file's content.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash identifying one set of a database protocol.
pub fn hash_dataset(database: &str, protocol: &str, set: &str) -> String {
    hash_string(&format!("{database}/{protocol}/{set}"))
}

/// Split a hash into the 3-level cache layout: `ab/cd/ef/<rest><suffix>`.
///
/// Hashes shorter than 7 characters are returned unchanged (plus suffix).
pub fn to_path(hash: &str, suffix: &str) -> String {
    if hash.len() < 7 || !hash.is_ascii() {
        return format!("{hash}{suffix}");
    }
    format!(
        "{}/{}/{}/{}{}",
        &hash[0..2],
        &hash[2..4],
        &hash[4..6],
        &hash[6..],
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_string_is_sha256() {
        assert_eq!(
            hash_string(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_to_path() {
        assert_eq!(to_path("abcdef0123", ""), "ab/cd/ef/0123");
        assert_eq!(to_path("abcdef0123", ".data"), "ab/cd/ef/0123.data");
        assert_eq!(to_path("abc", ".data"), "abc.data");
    }

    #[test]
    fn test_hash_dataset_distinguishes_sets() {
        let train = hash_dataset("integers/1", "default", "train");
        let test = hash_dataset("integers/1", "default", "test");
        assert_ne!(train, test);
        assert_eq!(train.len(), 64);
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"beat").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"beat"));
    }
}
