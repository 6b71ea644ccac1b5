//! Core type definitions for Repligate
//!
//! This module defines the fundamental types shared between the request
//! path and the reconciler: object references, write methods and
//! consistency levels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A bucket/key pair identifying one object.
///
/// The canonical string form is `bucket/key`, which is also the form
/// persisted in consistency records.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    bucket: String,
    key: String,
}

impl ObjectRef {
    /// Create from bucket and key parts
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self, ObjectRefError> {
        let bucket = bucket.into();
        let key = key.into();
        if bucket.is_empty() {
            return Err(ObjectRefError::EmptyBucket);
        }
        if key.is_empty() {
            return Err(ObjectRefError::EmptyKey);
        }
        Ok(Self { bucket, key })
    }

    /// Parse from a request path (`/bucket/key/with/slashes`)
    pub fn from_path(path: &str) -> Result<Self, ObjectRefError> {
        let trimmed = path.trim_matches('/');
        match trimmed.split_once('/') {
            Some((bucket, key)) => Self::new(bucket, key),
            None => Err(ObjectRefError::NotAnObjectPath(path.to_string())),
        }
    }

    /// Parse from the persisted `bucket/key` form
    pub fn from_object_id(object_id: &str) -> Result<Self, ObjectRefError> {
        Self::from_path(object_id)
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The persisted `bucket/key` identifier
    #[must_use]
    pub fn object_id(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({}/{})", self.bucket, self.key)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Errors from constructing an object reference
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectRefError {
    #[error("bucket part is empty")]
    EmptyBucket,
    #[error("key part is empty")]
    EmptyKey,
    #[error("path is not object-scoped: {0}")]
    NotAnObjectPath(String),
}

/// Whether a request path addresses a bucket (exactly one non-empty segment)
#[must_use]
pub fn is_bucket_path(path: &str) -> bool {
    let trimmed = path.trim_matches('/');
    !trimmed.is_empty() && !trimmed.contains('/')
}

/// Write method recorded in the consistency log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Consistency level configured per region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    /// No consistency records are written
    None,
    /// Records are written; insert failures are logged and ignored
    #[default]
    Weak,
    /// Records are written; insert failures fail the request
    Strong,
}

/// An access/secret key pair
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keys {
    pub access: String,
    pub secret: String,
}

impl fmt::Debug for Keys {
    // Secrets stay out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keys({}, ***)", self.access)
    }
}

/// Parse a human-readable size string ("100MB", "512kb", "1073741824")
pub fn parse_body_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let base: u64 = num
        .parse()
        .map_err(|_| format!("unparsable size: {s:?}"))?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit: {other:?}")),
    };
    base.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows u64: {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_from_path() {
        let obj = ObjectRef::from_path("/photos/2024/cat.jpg").unwrap();
        assert_eq!(obj.bucket(), "photos");
        assert_eq!(obj.key(), "2024/cat.jpg");
        assert_eq!(obj.object_id(), "photos/2024/cat.jpg");
    }

    #[test]
    fn test_object_ref_rejects_bucket_paths() {
        assert!(ObjectRef::from_path("/photos").is_err());
        assert!(ObjectRef::from_path("/").is_err());
        assert!(ObjectRef::from_path("//key").is_err());
    }

    #[test]
    fn test_bucket_path_detection() {
        assert!(is_bucket_path("/photos"));
        assert!(is_bucket_path("/photos/"));
        assert!(!is_bucket_path("/photos/cat.jpg"));
        assert!(!is_bucket_path("/"));
    }

    #[test]
    fn test_parse_body_size() {
        assert_eq!(parse_body_size("100").unwrap(), 100);
        assert_eq!(parse_body_size("10kb").unwrap(), 10 * 1024);
        assert_eq!(parse_body_size("100MB").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_body_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_body_size("ten").is_err());
        assert!(parse_body_size("10TB").is_err());
    }
}
