//! Error types for strata-core operations

use thiserror::Error;

/// Errors raised while decoding keys, signatures and hashes
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Invalid hash length: expected {expected}, got {actual}")]
    InvalidHashLength { expected: usize, actual: usize },
}

/// Result type for strata-core operations
pub type Result<T> = std::result::Result<T, Error>;
