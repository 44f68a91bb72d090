//! SHA-256 file checksums.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex digests compare case-insensitively.
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_identical_bytes_identical_digest_and_mutation_changes_it() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&a, &payload).unwrap();
        std::fs::write(&b, &payload).unwrap();
        assert_eq!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());

        for index in [0usize, 65_535, 65_536, payload.len() - 1] {
            let mut mutated = payload.clone();
            mutated[index] ^= 0x01;
            std::fs::write(&b, &mutated).unwrap();
            assert_ne!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());
        }
    }

    #[test]
    fn test_case_insensitive_match() {
        assert!(checksums_match("BA7816BF", "ba7816bf"));
        assert!(!checksums_match("ba7816bf", "ba7816be"));
    }
}
