//! AWS Signature V2 verification and signing (legacy clients)

use crate::constant_time_eq;
use crate::error::AuthError;
use crate::sigv4::request_date;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue, Method};
use sha1::Sha1;
use std::collections::BTreeMap;

type HmacSha1 = Hmac<Sha1>;

/// Sub-resources included in the canonical resource for SigV2
const SIGV2_SUB_RESOURCES: &[&str] = &[
    "acl",
    "cors",
    "delete",
    "lifecycle",
    "location",
    "logging",
    "notification",
    "partNumber",
    "policy",
    "requestPayment",
    "response-cache-control",
    "response-content-disposition",
    "response-content-encoding",
    "response-content-language",
    "response-content-type",
    "response-expires",
    "restore",
    "tagging",
    "torrent",
    "uploadId",
    "uploads",
    "versionId",
    "versioning",
    "versions",
    "website",
];

/// Verify a SigV2-signed request against a secret
pub fn verify_v2(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    signature: &str,
    secret: &str,
) -> Result<(), AuthError> {
    let date_str = request_date(headers)?;
    if let Ok(date) = parse_date_v2(&date_str) {
        let diff = Utc::now().signed_duration_since(date);
        if diff.num_minutes().abs() > 15 {
            return Err(AuthError::RequestTimeTooSkewed);
        }
    }

    let string_to_sign = build_string_to_sign_v2(method, path, query, headers, &date_str);
    let calculated = calculate_signature_v2(secret, &string_to_sign);

    if !constant_time_eq(&calculated, signature) {
        tracing::debug!(
            "SigV2 mismatch:\n  String to Sign:\n{}\n  Calculated: {}\n  Provided: {}",
            string_to_sign,
            calculated,
            signature
        );
        return Err(AuthError::SignatureMismatch);
    }
    Ok(())
}

/// Re-sign a request for a new host with the given credentials
pub fn sign_v2(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &mut HeaderMap,
    host: &str,
    access: &str,
    secret: &str,
) -> Result<(), AuthError> {
    headers.insert(
        http::header::HOST,
        HeaderValue::from_str(host).map_err(|_| AuthError::InvalidHeaderValue)?,
    );
    let date_str = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    headers.insert(
        http::header::DATE,
        HeaderValue::from_str(&date_str).map_err(|_| AuthError::InvalidHeaderValue)?,
    );
    // A stale x-amz-date would shadow the fresh Date header in the
    // canonicalization on the receiving side
    headers.remove("x-amz-date");

    let string_to_sign = build_string_to_sign_v2(method, path, query, headers, &date_str);
    let signature = calculate_signature_v2(secret, &string_to_sign);
    let authorization = format!("AWS {access}:{signature}");
    headers.insert(
        http::header::AUTHORIZATION,
        HeaderValue::from_str(&authorization).map_err(|_| AuthError::InvalidHeaderValue)?,
    );
    Ok(())
}

/// Build the SigV2 string to sign
fn build_string_to_sign_v2(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    date_str: &str,
) -> String {
    let content_md5 = header_or_empty(headers, "content-md5");
    let content_type = header_or_empty(headers, "content-type");

    // x-amz-date, when present, replaces the date line (it is carried in
    // the canonicalized amz headers instead)
    let date_field = if headers.contains_key("x-amz-date") {
        ""
    } else {
        date_str
    };

    let canonicalized_amz_headers = build_canonicalized_amz_headers(headers);
    let canonicalized_resource = build_canonicalized_resource_v2(path, query);

    format!(
        "{}\n{}\n{}\n{}\n{}{}",
        method.as_str(),
        content_md5,
        content_type,
        date_field,
        canonicalized_amz_headers,
        canonicalized_resource
    )
}

fn header_or_empty<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Build canonicalized x-amz-* headers
fn build_canonicalized_amz_headers(headers: &HeaderMap) -> String {
    let mut amz_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, value) in headers.iter() {
        let name_lower = name.as_str().to_lowercase();
        if name_lower.starts_with("x-amz-") {
            if let Ok(value_str) = value.to_str() {
                let trimmed = value_str.split_whitespace().collect::<Vec<_>>().join(" ");
                amz_headers.entry(name_lower).or_default().push(trimmed);
            }
        }
    }

    let mut result = String::new();
    for (name, values) in amz_headers {
        result.push_str(&format!("{}:{}\n", name, values.join(",")));
    }
    result
}

/// Build canonicalized resource (path + recognized sub-resources)
fn build_canonicalized_resource_v2(path: &str, query: Option<&str>) -> String {
    let mut resource = if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    };

    if let Some(query) = query {
        let mut sub_resources: Vec<(String, Option<String>)> = Vec::new();

        for param in query.split('&') {
            let mut parts = param.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next();

            if SIGV2_SUB_RESOURCES.contains(&key) {
                sub_resources.push((key.to_string(), value.map(|s| s.to_string())));
            }
        }

        if !sub_resources.is_empty() {
            sub_resources.sort_by(|a, b| a.0.cmp(&b.0));

            let joined: Vec<String> = sub_resources
                .into_iter()
                .map(|(k, v)| match v {
                    Some(val) => format!("{k}={val}"),
                    None => k,
                })
                .collect();

            resource.push('?');
            resource.push_str(&joined.join("&"));
        }
    }

    resource
}

/// Calculate the SigV2 signature (base64 HMAC-SHA1)
fn calculate_signature_v2(secret: &str, string_to_sign: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(string_to_sign.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Parse a SigV2 date (several formats in the wild)
fn parse_date_v2(date_str: &str) -> Result<DateTime<Utc>, AuthError> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(date_str, "%Y%m%dT%H%M%SZ") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(date_str, "%a, %d %b %Y %H:%M:%S GMT") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    Err(AuthError::InvalidDateFormat(date_str.to_string()))
}
