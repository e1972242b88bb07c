//! Error types for devlink-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// devlink-core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Canonical (postcard) serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Wire message could not be encoded
    #[error("wire encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Wire message could not be decoded
    #[error("wire decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Zero-length input where a message was expected
    #[error("empty message")]
    EmptyMessage,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Device certificate issued by the device itself
    #[error("self-issued device certificate: {0}")]
    SelfIssued(String),
}
