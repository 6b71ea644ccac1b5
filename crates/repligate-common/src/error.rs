//! Error types for Repligate
//!
//! This module defines the common error type used throughout the proxy.

use crate::types::ObjectRefError;
use thiserror::Error;

/// Common result type for Repligate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Repligate
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Routing errors
    #[error("no shard for key: {0}")]
    NoShardForKey(String),

    #[error("no shard named {0}")]
    ShardNotFound(String),

    #[error("no region serves domain: {0}")]
    RegionNotFound(String),

    // Dispatch errors
    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,

    #[error("no backend available for multipart upload")]
    ImpossibleMultipart,

    // Auth errors
    #[error("access denied")]
    AccessDenied,

    #[error("signature mismatch")]
    SignatureDoesNotMatch,

    #[error("unsupported signature version")]
    UnsupportedSignatureVersion,

    // Consistency log errors
    #[error("consistency log error: {0}")]
    ConsistencyLog(String),

    #[error("malformed consistency record: {0}")]
    MalformedRecord(String),

    // Request validation errors
    #[error("invalid object path: {0}")]
    InvalidObjectPath(#[from] ObjectRefError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("entity too large: max {max_size} bytes")]
    EntityTooLarge { max_size: u64 },

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Check if this is a transport-level failure (eligible for regression)
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }

    /// Get HTTP status code for S3 API compatibility
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::InvalidObjectPath(_) | Self::MalformedRecord(_) => 400,
            Self::AccessDenied
            | Self::SignatureDoesNotMatch
            | Self::UnsupportedSignatureVersion => 403,
            Self::RegionNotFound(_) => 404,
            Self::EntityTooLarge { .. } => 413,
            Self::Internal(_) | Self::ConsistencyLog(_) | Self::Configuration(_) => 500,
            Self::NoShardForKey(_)
            | Self::ShardNotFound(_)
            | Self::Transport(_)
            | Self::Timeout
            | Self::ImpossibleMultipart => 503,
        }
    }

    /// Get S3 error code for API compatibility
    #[must_use]
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::AccessDenied => "AccessDenied",
            Self::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            Self::UnsupportedSignatureVersion => "InvalidRequest",
            Self::RegionNotFound(_) => "NoSuchBucket",
            Self::EntityTooLarge { .. } => "EntityTooLarge",
            Self::InvalidRequest(_) | Self::InvalidObjectPath(_) => "InvalidArgument",
            Self::Transport(_) | Self::Timeout | Self::NoShardForKey(_) | Self::ShardNotFound(_) => {
                "ServiceUnavailable"
            }
            _ => "InternalError",
        }
    }
}
