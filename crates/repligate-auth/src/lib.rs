//! AWS signature handling for Repligate
//!
//! The proxy sits between clients signing with their own keys and
//! backends expecting backend keys, so every authorized request is
//! verified against the client-side secret and re-signed with the
//! backend secret and the backend host. Both SigV2 (legacy) and SigV4
//! are supported, including streaming-chunked SigV4 pass-through.

pub mod credentials;
pub mod error;
pub mod header;
pub mod sigv2;
pub mod sigv4;

pub use credentials::{
    CachingCredentialStore, CredentialStore, MemoryCredentialStore, VaultCredentialStore,
};
pub use error::{AuthError, CredentialsError};
pub use header::{parse_authorization_header, ParsedAuthHeader, SignatureVersion};

use http::HeaderMap;

/// Marker payload hash of a streaming-chunked SigV4 upload
pub const STREAMING_PAYLOAD_SHA256: &str = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD";

/// Whether the request is a streaming-chunked SigV4 upload
#[must_use]
pub fn is_streaming_request(headers: &HeaderMap) -> bool {
    headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == STREAMING_PAYLOAD_SHA256)
        .unwrap_or(false)
}

/// Constant-time string comparison to prevent timing attacks
#[must_use]
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
