//! Error types for the erasure-coded backend

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the erasure-coded backend
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid erasure-code geometry or codec configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// Encoding into chunks failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// Decoding / reconstruction from chunks failed
    #[error("EC decoding failed: {0}")]
    EcDecodingFailed(String),

    /// Not enough shards are available to reconstruct the data
    #[error("Insufficient shards for decoding: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// A persisted metadata blob could not be decoded
    #[error("Metadata decode failed for {kind}: {reason}")]
    MetadataDecode { kind: &'static str, reason: String },

    /// Object (or one of its shards) does not exist in the local store
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// The object store rejected or failed an operation
    #[error("Object store error: {0}")]
    Store(String),

    /// No combination of live shards can satisfy the read
    #[error("No available read sources: {0}")]
    NoReadSources(String),

    /// Operation is not supported by this backend
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}
