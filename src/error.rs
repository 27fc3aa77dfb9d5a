//! Error types for the try-on cache service

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the try-on cache service
///
/// Cache-tier failures (disk I/O on L2, corrupt records, quota sweeps) are
/// recovered inside the cache and never reach callers through this type.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Cache key cannot be used as a storage path component
    #[error("Invalid cache key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Payload does not carry every member its family requires
    #[error("Incomplete {family} payload, missing members: {missing:?}")]
    IncompletePayload {
        family: String,
        missing: Vec<String>,
    },

    /// Artifact could not be encoded
    #[error("Artifact encoding failed: {0}")]
    ArtifactEncode(String),

    /// Artifact bytes could not be decoded
    #[error("Artifact decoding failed: {0}")]
    ArtifactDecode(String),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Neither the cache tiers nor the origin hold data for the key
    #[error("No cached or origin data for {family} '{key}'")]
    NotCached { family: String, key: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Origin (object storage) failure
    #[error("Origin store error: {0}")]
    Origin(String),

    /// Model inference failure
    #[error("Model stage '{stage}' failed: {reason}")]
    Model { stage: String, reason: String },

    /// Generation gate queue wait expired
    #[error("Generation queue saturated, gave up after {waited_ms}ms")]
    GenerationBusy { waited_ms: u64 },

    // =========================================================================
    // Request / Process Errors
    // =========================================================================
    /// Malformed request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request body over the configured limit
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::GenerationBusy { .. } | Error::Origin(_))
    }

    /// Whether the error was caused by the request itself
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidKey { .. }
                | Error::IncompletePayload { .. }
                | Error::BadRequest(_)
                | Error::PayloadTooLarge { .. }
                | Error::Json(_)
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
