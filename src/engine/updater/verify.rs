//! Archive Verification
//!
//! Computes the digest of a downloaded archive and compares it with the
//! value published by the update server.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Digest algorithms a server may publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

/// A digest value together with the algorithm that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedDigest {
    pub algorithm: DigestAlgorithm,
    pub value: String,
}

impl PublishedDigest {
    pub fn md5(value: impl Into<String>) -> Self {
        Self {
            algorithm: DigestAlgorithm::Md5,
            value: value.into(),
        }
    }

    pub fn sha256(value: impl Into<String>) -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha256,
            value: value.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{algorithm} mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: DigestAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("Resource publishes no digest")]
    MissingDigest,
}

/// Verifier for downloaded archives
pub struct ArchiveVerifier;

impl ArchiveVerifier {
    /// Hex digest of a file, read in fixed-size chunks
    pub fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> Result<String, VerifyError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut buffer = [0u8; 8192];

        match algorithm {
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let bytes_read = reader.read(&mut buffer)?;
                    if bytes_read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..bytes_read]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
            DigestAlgorithm::Md5 => {
                let mut context = md5::Context::new();
                loop {
                    let bytes_read = reader.read(&mut buffer)?;
                    if bytes_read == 0 {
                        break;
                    }
                    context.consume(&buffer[..bytes_read]);
                }
                Ok(format!("{:x}", context.compute()))
            }
        }
    }

    /// Hex digest of an in-memory buffer
    pub fn digest_bytes(data: &[u8], algorithm: DigestAlgorithm) -> String {
        match algorithm {
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(data)),
        }
    }

    /// Verify a file against a published digest, ignoring hex case
    pub fn verify_file(path: &Path, expected: &PublishedDigest) -> Result<(), VerifyError> {
        let actual = Self::digest_file(path, expected.algorithm)?;
        if !actual.eq_ignore_ascii_case(expected.value.trim()) {
            return Err(VerifyError::ChecksumMismatch {
                algorithm: expected.algorithm,
                expected: expected.value.clone(),
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    fn hello_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_sha256_calculation() {
        let file = hello_file();
        let checksum = ArchiveVerifier::digest_file(file.path(), DigestAlgorithm::Sha256).unwrap();
        assert_eq!(checksum, HELLO_SHA256);
    }

    #[test]
    fn test_md5_calculation() {
        let file = hello_file();
        let checksum = ArchiveVerifier::digest_file(file.path(), DigestAlgorithm::Md5).unwrap();
        assert_eq!(checksum, HELLO_MD5);
        assert_eq!(ArchiveVerifier::digest_bytes(b"hello world", DigestAlgorithm::Md5), HELLO_MD5);
    }

    #[test]
    fn test_verification_ignores_case() {
        let file = hello_file();
        let expected = PublishedDigest::md5(HELLO_MD5.to_uppercase());
        assert!(ArchiveVerifier::verify_file(file.path(), &expected).is_ok());
    }

    #[test]
    fn test_verification_failure() {
        let file = hello_file();
        let result = ArchiveVerifier::verify_file(file.path(), &PublishedDigest::sha256("wrongchecksum"));
        assert!(matches!(result, Err(VerifyError::ChecksumMismatch { .. })));
    }
}
