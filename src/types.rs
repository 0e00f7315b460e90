//! Shared value types and helpers used by every layer of the engine:
//! timestamps, ETags, upload identifiers, name validation, and byte
//! ranges.

use std::future::Future;
use std::pin::Pin;

use chrono::{SecondsFormat, Utc};
use md5::{Digest, Md5};

use crate::errors::{StoreError, StoreResult};

/// Boxed future alias shared by the [`crate::metadata::store::MetadataStore`]
/// and [`crate::storage::backend::StorageBackend`] traits.
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Minimum size of every non-terminal multipart part (5 MiB).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part number accepted by PutPart.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Default and maximum page size for list operations.
pub const MAX_LIST_KEYS: u32 = 1000;

/// Default content type applied when a caller supplies none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default storage class applied when a caller supplies none.
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

// ── Time ───────────────────────────────────────────────────────────

/// Current UTC time as ISO-8601 with millisecond precision,
/// e.g. `2026-02-23T12:00:00.000Z`.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 timestamp back to epoch seconds. Unparseable
/// strings map to 0 so that malformed rows are treated as ancient
/// (and therefore reapable) rather than immortal.
pub fn iso8601_to_epoch_secs(ts: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

// ── ETags ──────────────────────────────────────────────────────────

/// Quoted MD5 ETag of a byte slice, e.g. `"5d41402abc4b2a76b9719d911017c592"`.
pub fn quoted_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Raw 16-byte MD5 digest of a byte slice.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Composite multipart ETag: MD5 over the concatenated binary part
/// digests, suffixed with the part count, e.g. `"9b2cf535f27731c974343645a3985328-3"`.
pub fn composite_etag(part_digests: &[[u8; 16]]) -> String {
    let mut hasher = Md5::new();
    for digest in part_digests {
        hasher.update(digest);
    }
    format!(
        "\"{}-{}\"",
        hex::encode(hasher.finalize()),
        part_digests.len()
    )
}

/// Strip surrounding quotes from an ETag for comparison.
pub fn unquote_etag(etag: &str) -> &str {
    etag.trim_matches('"')
}

// ── Identifiers ────────────────────────────────────────────────────

/// Fresh multipart upload id: 128 bits from the OS CSPRNG, lowercase
/// hex, 32 characters.
pub fn new_upload_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

// ── Validation ─────────────────────────────────────────────────────

/// Validate an S3 bucket name: 3-63 characters, lowercase letters,
/// digits, hyphens and dots, starting and ending alphanumeric, no
/// consecutive dots, and not formatted like an IPv4 address.
pub fn validate_bucket_name(name: &str) -> StoreResult<()> {
    let invalid = || StoreError::InvalidBucketName {
        name: name.to_string(),
    };

    if name.len() < 3 || name.len() > 63 {
        return Err(invalid());
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_lowercase() && !bytes[0].is_ascii_digit() {
        return Err(invalid());
    }
    let last = bytes[bytes.len() - 1];
    if !last.is_ascii_lowercase() && !last.is_ascii_digit() {
        return Err(invalid());
    }
    let mut prev_dot = false;
    for &b in bytes {
        match b {
            b'a'..=b'z' | b'0'..=b'9' | b'-' => prev_dot = false,
            b'.' => {
                if prev_dot {
                    return Err(invalid());
                }
                prev_dot = true;
            }
            _ => return Err(invalid()),
        }
    }
    if looks_like_ipv4(name) {
        return Err(invalid());
    }
    Ok(())
}

fn looks_like_ipv4(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Validate an object key: 1-1024 bytes.
pub fn validate_object_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::invalid("Object key must not be empty"));
    }
    if key.len() > 1024 {
        return Err(StoreError::KeyTooLong { length: key.len() });
    }
    Ok(())
}

/// Validate a multipart part number: 1-10000.
pub fn validate_part_number(part_number: u32) -> StoreResult<()> {
    if part_number == 0 || part_number > MAX_PART_NUMBER {
        return Err(StoreError::invalid(format!(
            "Part number must be an integer between 1 and {MAX_PART_NUMBER}, inclusive"
        )));
    }
    Ok(())
}

// ── Byte ranges ────────────────────────────────────────────────────

/// A half-open byte range request, before resolution against an
/// object's size.  Mirrors the three HTTP forms:
/// `bytes=a-b` (both set), `bytes=a-` (start only), `bytes=-n` (end only,
/// meaning the final `n` bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Parse a `bytes=...` header value. Returns `None` for values this
    /// engine does not recognize (multi-range requests included); the
    /// caller then serves the full object, matching S3.
    pub fn parse(header: &str) -> Option<ByteRange> {
        let spec = header.strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (start_s, end_s) = spec.split_once('-')?;
        let start = if start_s.is_empty() {
            None
        } else {
            Some(start_s.parse::<u64>().ok()?)
        };
        let end = if end_s.is_empty() {
            None
        } else {
            Some(end_s.parse::<u64>().ok()?)
        };
        if start.is_none() && end.is_none() {
            return None;
        }
        Some(ByteRange { start, end })
    }

    /// Resolve against an object of `size` bytes into an inclusive
    /// `(first, last)` pair, or `InvalidRange` when unsatisfiable.
    pub fn resolve(&self, size: u64) -> StoreResult<(u64, u64)> {
        match (self.start, self.end) {
            // bytes=-n : final n bytes.
            (None, Some(suffix)) => {
                if suffix == 0 || size == 0 {
                    return Err(StoreError::InvalidRange);
                }
                let first = size.saturating_sub(suffix);
                Ok((first, size - 1))
            }
            // bytes=a- : from a to the end.
            (Some(first), None) => {
                if first >= size {
                    return Err(StoreError::InvalidRange);
                }
                Ok((first, size - 1))
            }
            // bytes=a-b : clamp b to the last byte.
            (Some(first), Some(last)) => {
                if first > last || first >= size {
                    return Err(StoreError::InvalidRange);
                }
                Ok((first, last.min(size - 1)))
            }
            (None, None) => Err(StoreError::InvalidRange),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso8601_shape() {
        let ts = now_iso8601();
        // 2026-02-23T12:00:00.000Z
        assert_eq!(ts.len(), 24);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn test_quoted_md5_known_value() {
        assert_eq!(quoted_md5(b"hello"), "\"5d41402abc4b2a76b9719d911017c592\"");
        assert_eq!(quoted_md5(b""), "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }

    #[test]
    fn test_composite_etag_suffix() {
        let d1 = md5_digest(b"part one");
        let d2 = md5_digest(b"part two");
        let etag = composite_etag(&[d1, d2]);
        assert!(etag.starts_with('"'));
        assert!(etag.ends_with("-2\""));
        assert_eq!(unquote_etag(&etag).len(), 32 + 2);
    }

    #[test]
    fn test_upload_id_format() {
        let id = new_upload_id();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        assert_ne!(id, new_upload_id());
    }

    #[test]
    fn test_bucket_name_validation() {
        assert!(validate_bucket_name("my-bucket").is_ok());
        assert!(validate_bucket_name("a.b.c").is_ok());
        assert!(validate_bucket_name("abc123").is_ok());

        assert!(validate_bucket_name("ab").is_err()); // too short
        assert!(validate_bucket_name(&"a".repeat(64)).is_err()); // too long
        assert!(validate_bucket_name("MyBucket").is_err()); // uppercase
        assert!(validate_bucket_name("-leading").is_err());
        assert!(validate_bucket_name("trailing-").is_err());
        assert!(validate_bucket_name("double..dot").is_err());
        assert!(validate_bucket_name("192.168.0.1").is_err()); // IP-like
        assert!(validate_bucket_name("under_score").is_err());
    }

    #[test]
    fn test_object_key_validation() {
        assert!(validate_object_key("a").is_ok());
        assert!(validate_object_key(&"k".repeat(1024)).is_ok());
        assert!(validate_object_key("").is_err());
        assert!(matches!(
            validate_object_key(&"k".repeat(1025)),
            Err(StoreError::KeyTooLong { length: 1025 })
        ));
    }

    #[test]
    fn test_part_number_validation() {
        assert!(validate_part_number(1).is_ok());
        assert!(validate_part_number(10_000).is_ok());
        assert!(validate_part_number(0).is_err());
        assert!(validate_part_number(10_001).is_err());
    }

    #[test]
    fn test_range_parse() {
        assert_eq!(
            ByteRange::parse("bytes=0-99"),
            Some(ByteRange {
                start: Some(0),
                end: Some(99)
            })
        );
        assert_eq!(
            ByteRange::parse("bytes=100-"),
            Some(ByteRange {
                start: Some(100),
                end: None
            })
        );
        assert_eq!(
            ByteRange::parse("bytes=-5"),
            Some(ByteRange {
                start: None,
                end: Some(5)
            })
        );
        assert_eq!(ByteRange::parse("bytes=-"), None);
        assert_eq!(ByteRange::parse("bytes=0-1,5-9"), None);
        assert_eq!(ByteRange::parse("items=0-1"), None);
    }

    #[test]
    fn test_range_resolve() {
        let r = ByteRange {
            start: Some(2),
            end: Some(100),
        };
        // End clamps to the object size.
        assert_eq!(r.resolve(10).unwrap(), (2, 9));

        let r = ByteRange {
            start: None,
            end: Some(4),
        };
        assert_eq!(r.resolve(10).unwrap(), (6, 9));
        // Suffix longer than the object returns the whole object.
        assert_eq!(r.resolve(3).unwrap(), (0, 2));

        let r = ByteRange {
            start: Some(10),
            end: None,
        };
        assert!(matches!(r.resolve(10), Err(StoreError::InvalidRange)));

        let r = ByteRange {
            start: Some(5),
            end: Some(2),
        };
        assert!(matches!(r.resolve(10), Err(StoreError::InvalidRange)));
    }
}
