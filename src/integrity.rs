//! File integrity checks run before a plugin is loaded.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Pre-load check on a plugin file. Returning an error aborts the load
/// before anything is registered.
pub type PluginValidator = Arc<dyn Fn(&Path) -> Result<()> + Send + Sync>;

/// Lowercase hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fail with `SecurityViolation` unless the file hashes to `expected`.
/// The comparison ignores case and surrounding whitespace.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let expected = expected.trim().to_ascii_lowercase();
    if expected.is_empty() {
        return Err(Error::security_violation(format!(
            "no expected hash supplied for {}",
            path.display()
        )));
    }

    let actual = sha256_file(path)?;
    if actual != expected {
        tracing::warn!(path = %path.display(), %expected, %actual, "sha-256 mismatch");
        return Err(Error::security_violation(format!(
            "sha-256 mismatch for {}",
            path.display()
        ))
        .with_details(format!("expected {}, got {}", expected, actual)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_hash_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(sha256_file(&path).unwrap(), HELLO_SHA256);
        assert_eq!(sha256_bytes(b"hello"), HELLO_SHA256);
    }

    #[test]
    fn test_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        std::fs::write(&path, b"hello").unwrap();

        verify_sha256(&path, &HELLO_SHA256.to_uppercase()).unwrap();

        let err = verify_sha256(&path, &"0".repeat(64)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SecurityViolation);
        assert!(err.details.is_some());

        let err = verify_sha256(&path, "").unwrap_err();
        assert_eq!(err.code(), ErrorCode::SecurityViolation);
    }

    #[test]
    fn test_missing_file() {
        let err = sha256_file(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }
}
