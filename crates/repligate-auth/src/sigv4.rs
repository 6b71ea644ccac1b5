//! AWS Signature V4 verification and signing
//!
//! Reference: https://docs.aws.amazon.com/AmazonS3/latest/API/sig-v4-authenticating-requests.html
//!
//! Verification recomputes the signature from the incoming request and the
//! stored secret. Signing produces a fresh Authorization header for the
//! backend host; for streaming-chunked uploads only the seed signature is
//! recomputed and the chunk framing passes through untouched.

use crate::error::AuthError;
use crate::header::ParsedAuthHeader;
use crate::{constant_time_eq, is_streaming_request};
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue, Method};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Verify a SigV4-signed request against a secret
pub fn verify_v4(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    parsed: &ParsedAuthHeader,
    secret: &str,
) -> Result<(), AuthError> {
    let date_str = request_date(headers)?;
    let date = parse_date_v4(&date_str)?;

    // Allow 15 minutes of clock skew
    let diff = Utc::now().signed_duration_since(date);
    if diff.num_minutes().abs() > 15 {
        return Err(AuthError::RequestTimeTooSkewed);
    }

    let canonical_request =
        build_canonical_request(method, path, query, headers, &parsed.signed_headers)?;

    let date_stamp = date.format("%Y%m%d").to_string();
    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, parsed.region, parsed.service
    );
    let string_to_sign = build_string_to_sign(&canonical_request, &date_str, &credential_scope);

    let signing_key = derive_signing_key(secret, &date_stamp, &parsed.region, &parsed.service);
    let calculated = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    if !constant_time_eq(&calculated, &parsed.signature) {
        tracing::debug!(
            "SigV4 mismatch:\n  Canonical Request:\n{}\n  String to Sign:\n{}\n  Calculated: {}\n  Provided: {}",
            canonical_request,
            string_to_sign,
            calculated,
            parsed.signature
        );
        return Err(AuthError::SignatureMismatch);
    }
    Ok(())
}

/// Re-sign a request for a new host with the given credentials.
///
/// Sets `host`, refreshes `x-amz-date`, keeps the payload hash already
/// declared by the client (streaming marker included) and writes a new
/// Authorization header.
pub fn sign_v4(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &mut HeaderMap,
    host: &str,
    access: &str,
    secret: &str,
    region: &str,
    service: &str,
) -> Result<(), AuthError> {
    if is_streaming_request(headers) && !headers.contains_key("content-length") {
        return Err(AuthError::StreamingContentLength);
    }

    headers.insert(
        http::header::HOST,
        HeaderValue::from_str(host).map_err(|_| AuthError::InvalidHeaderValue)?,
    );
    let now = Utc::now();
    let date_str = now.format("%Y%m%dT%H%M%SZ").to_string();
    headers.insert(
        "x-amz-date",
        HeaderValue::from_str(&date_str).map_err(|_| AuthError::InvalidHeaderValue)?,
    );
    if !headers.contains_key("x-amz-content-sha256") {
        headers.insert(
            "x-amz-content-sha256",
            HeaderValue::from_static(UNSIGNED_PAYLOAD),
        );
    }

    // Sign host, content headers and every x-amz-* header present
    let mut signed_headers: Vec<String> = headers
        .keys()
        .map(|name| name.as_str().to_lowercase())
        .filter(|name| {
            name == "host"
                || name == "content-type"
                || name == "content-md5"
                || name.starts_with("x-amz-")
        })
        .collect();
    signed_headers.sort_unstable();
    signed_headers.dedup();

    let canonical_request = build_canonical_request(method, path, query, headers, &signed_headers)?;
    let date_stamp = now.format("%Y%m%d").to_string();
    let credential_scope = format!("{date_stamp}/{region}/{service}/aws4_request");
    let string_to_sign = build_string_to_sign(&canonical_request, &date_str, &credential_scope);
    let signing_key = derive_signing_key(secret, &date_stamp, region, service);
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access}/{credential_scope}, SignedHeaders={}, Signature={signature}",
        signed_headers.join(";")
    );
    headers.insert(
        http::header::AUTHORIZATION,
        HeaderValue::from_str(&authorization).map_err(|_| AuthError::InvalidHeaderValue)?,
    );
    Ok(())
}

/// Build the canonical request string
fn build_canonical_request(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    signed_headers: &[String],
) -> Result<String, AuthError> {
    let canonical_uri = if path.is_empty() { "/" } else { path };
    let canonical_query = build_canonical_query_string(query.unwrap_or(""));

    let mut headers_map: BTreeMap<String, String> = BTreeMap::new();
    for header_name in signed_headers {
        let value = headers
            .get(header_name.as_str())
            .ok_or_else(|| AuthError::MissingSignedHeader(header_name.clone()))?
            .to_str()
            .map_err(|_| AuthError::InvalidHeaderValue)?
            .trim()
            .to_string();
        headers_map.insert(header_name.clone(), value);
    }

    let canonical_headers: String = headers_map
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();

    let mut sorted_signed = signed_headers.to_vec();
    sorted_signed.sort_unstable();

    let payload_hash = headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(UNSIGNED_PAYLOAD);

    Ok(format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.as_str(),
        canonical_uri,
        canonical_query,
        canonical_headers,
        sorted_signed.join(";"),
        payload_hash
    ))
}

/// Build canonical query string (decoded, re-encoded AWS style, sorted)
fn build_canonical_query_string(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }

    let mut params: Vec<(String, String)> = query
        .split('&')
        .filter(|param| !param.is_empty())
        .map(|param| {
            let mut parts = param.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            (url_encode(&url_decode(key)), url_encode(&url_decode(value)))
        })
        .collect();

    params.sort();

    params
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the string to sign
fn build_string_to_sign(canonical_request: &str, date_str: &str, credential_scope: &str) -> String {
    let hash = hex_sha256(canonical_request.as_bytes());
    format!("AWS4-HMAC-SHA256\n{date_str}\n{credential_scope}\n{hash}")
}

/// Derive the signing key
fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{secret}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Get the request date from x-amz-date or Date
pub(crate) fn request_date(headers: &HeaderMap) -> Result<String, AuthError> {
    for name in ["x-amz-date", "date"] {
        if let Some(date) = headers.get(name) {
            return date
                .to_str()
                .map(|s| s.to_string())
                .map_err(|_| AuthError::InvalidHeaderValue);
        }
    }
    Err(AuthError::MissingDateHeader)
}

/// Parse ISO8601 basic format for SigV4
fn parse_date_v4(date_str: &str) -> Result<DateTime<Utc>, AuthError> {
    NaiveDateTime::parse_from_str(date_str, "%Y%m%dT%H%M%SZ")
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
        .map_err(|_| AuthError::InvalidDateFormat(date_str.to_string()))
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// URL encode a string (AWS style)
fn url_encode(s: &str) -> String {
    let mut result = String::new();
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => result.push(c),
            _ => {
                for byte in c.to_string().as_bytes() {
                    result.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    result
}

/// URL decode a string
fn url_decode(s: &str) -> String {
    let mut result = Vec::new();
    let mut bytes = s.bytes().peekable();

    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next();
            let lo = bytes.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                let hex = [hi, lo];
                if let Ok(byte) =
                    u8::from_str_radix(std::str::from_utf8(&hex).unwrap_or(""), 16)
                {
                    result.push(byte);
                    continue;
                }
                result.push(b'%');
                result.push(hi);
                result.push(lo);
            } else {
                result.push(b'%');
            }
        } else if b == b'+' {
            result.push(b' ');
        } else {
            result.push(b);
        }
    }
    String::from_utf8_lossy(&result).into_owned()
}
