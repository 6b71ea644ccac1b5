//! Authorization header parsing
//!
//! Supports both signature versions:
//! `AWS AccessKeyId:Signature` (V2) and
//! `AWS4-HMAC-SHA256 Credential=.../date/region/service/aws4_request,
//!  SignedHeaders=..., Signature=...` (V4).

use crate::error::AuthError;
use regex::Regex;
use std::sync::OnceLock;

const REGEX_V2: &str =
    r"^AWS +(?P<access_key>[a-zA-Z0-9_-]+):(?P<signature>(?:[A-Za-z0-9+/]{4})*(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=)?)$";
const REGEX_V4: &str = r"^AWS4-HMAC-SHA256 +Credential=(?P<access_key>[a-zA-Z0-9_-]+)/[0-9]+/(?P<region>[a-zA-Z0-9-]*)/(?P<service>[a-zA-Z0-9_-]+)/aws4_request,( +)?SignedHeaders=(?P<signed_headers>[a-z0-9-;.]+),( +)?Signature=(?P<signature>[a-f0-9]+)$";

fn re_v2() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(REGEX_V2).unwrap())
}

fn re_v4() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(REGEX_V4).unwrap())
}

/// AWS signature version
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureVersion {
    V2,
    V4,
}

/// Parsed Authorization header content
#[derive(Clone, Debug)]
pub struct ParsedAuthHeader {
    pub version: SignatureVersion,
    pub access_key: String,
    pub signature: String,
    /// V4 only; lowercase, in header order
    pub signed_headers: Vec<String>,
    /// V4 only
    pub region: String,
    /// V4 only, usually "s3"
    pub service: String,
}

/// Parse an Authorization header of either signature version
pub fn parse_authorization_header(header: &str) -> Result<ParsedAuthHeader, AuthError> {
    if let Some(captures) = re_v4().captures(header) {
        return Ok(ParsedAuthHeader {
            version: SignatureVersion::V4,
            access_key: captures["access_key"].to_string(),
            signature: captures["signature"].to_string(),
            signed_headers: captures["signed_headers"]
                .split(';')
                .map(|s| s.to_lowercase())
                .collect(),
            region: captures["region"].to_string(),
            service: captures["service"].to_string(),
        });
    }
    if let Some(captures) = re_v2().captures(header) {
        return Ok(ParsedAuthHeader {
            version: SignatureVersion::V2,
            access_key: captures["access_key"].to_string(),
            signature: captures["signature"].to_string(),
            signed_headers: Vec::new(),
            region: String::new(),
            service: String::new(),
        });
    }
    if header.starts_with("AWS ") || header.starts_with("AWS4-") {
        return Err(AuthError::InvalidAuthHeader);
    }
    Err(AuthError::UnsupportedSignatureVersion)
}

/// Extract only the access key, for admission decisions before full
/// verification
pub fn extract_access_key(header: &str) -> Result<String, AuthError> {
    parse_authorization_header(header).map(|parsed| parsed.access_key)
}
