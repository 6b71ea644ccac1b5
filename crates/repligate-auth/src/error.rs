//! Authentication and credential store errors

use thiserror::Error;

/// Signature verification / signing errors
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthHeader,

    #[error("invalid authorization header")]
    InvalidAuthHeader,

    #[error("unsupported signature version")]
    UnsupportedSignatureVersion,

    #[error("signature does not match")]
    SignatureMismatch,

    #[error("request time too skewed")]
    RequestTimeTooSkewed,

    #[error("missing date header")]
    MissingDateHeader,

    #[error("invalid date format: {0}")]
    InvalidDateFormat(String),

    #[error("missing signed header: {0}")]
    MissingSignedHeader(String),

    #[error("header value is not valid ascii")]
    InvalidHeaderValue,

    #[error("streaming upload without a parsable content-length")]
    StreamingContentLength,
}

/// Credential store errors (spec'd error kinds of the fetch contract)
#[derive(Debug, Clone, Error)]
pub enum CredentialsError {
    #[error("no credentials found for access key")]
    NotFound,

    #[error("invalid credentials response format")]
    InvalidFormat,

    #[error("access key missing in credentials response")]
    MissingAccessKey,

    #[error("secret key missing in credentials response")]
    MissingSecretKey,

    #[error("credential store unavailable: {0}")]
    Transient(String),
}
