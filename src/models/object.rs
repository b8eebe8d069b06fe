//! Represents one immutable version of a stored object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single committed version of an object.
///
/// Every successful upload inserts one of these; versions are never mutated
/// in place. The latest version for a key is the one with the highest
/// `version_no`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectVersion {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Bucket the object belongs to.
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Per-key version number, assigned monotonically starting at 1.
    pub version_no: i64,

    /// Payload size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the payload for integrity verification.
    pub etag: String,

    /// Content type (MIME type) as supplied by the uploader.
    pub content_type: Option<String>,

    /// When this version was committed.
    pub created_at: DateTime<Utc>,
}

impl ObjectVersion {
    /// Public version identifier, rendered as `v1`, `v2`, ...
    pub fn version_id(&self) -> String {
        format!("v{}", self.version_no)
    }
}

/// Parse a public version identifier (`v3`) back into a version number.
pub fn parse_version_id(version_id: &str) -> Option<i64> {
    let digits = version_id.strip_prefix('v')?;
    let n: i64 = digits.parse().ok()?;
    (n >= 1).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_id_round_trip() {
        assert_eq!(parse_version_id("v1"), Some(1));
        assert_eq!(parse_version_id("v42"), Some(42));
        assert_eq!(parse_version_id("v0"), None);
        assert_eq!(parse_version_id("1"), None);
        assert_eq!(parse_version_id("vx"), None);
        assert_eq!(parse_version_id(""), None);
    }
}
