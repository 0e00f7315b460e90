//! Abstract metadata store contract.
//!
//! Every metadata backend implements [`MetadataStore`].  The trait uses
//! manually desugared async methods (pinned boxed futures) so that it
//! stays object-safe across SQLite, file-based, in-memory, and remote
//! document stores.
//!
//! Ownership follows the rule "the store owns the record; callers
//! receive value copies": every getter clones out of the substrate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{BoxFut, DEFAULT_CONTENT_TYPE, DEFAULT_STORAGE_CLASS, MAX_LIST_KEYS};

// ── ACL types ──────────────────────────────────────────────────────

/// An S3 Access Control List. Stored as an opaque JSON blob in the
/// record structs; this typed form exists for constructing defaults and
/// for the serializer's expanded output.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Acl {
    /// Owner of the resource.
    #[serde(default)]
    pub owner: AclOwner,
    /// List of access grants.
    #[serde(default)]
    pub grants: Vec<AclGrant>,
}

/// Owner portion of an ACL.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AclOwner {
    /// Canonical user ID.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
}

/// A single ACL grant entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclGrant {
    /// The grantee receiving the permission.
    pub grantee: AclGrantee,
    /// The permission being granted.
    pub permission: String,
}

/// A grantee in an ACL grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AclGrantee {
    /// A canonical user grantee.
    CanonicalUser {
        id: String,
        #[serde(default)]
        display_name: String,
    },
    /// A group grantee.
    Group { uri: String },
}

impl Acl {
    /// Default FULL_CONTROL ACL for the given owner.
    pub fn full_control(owner_id: &str, display_name: &str) -> Self {
        Acl {
            owner: AclOwner {
                id: owner_id.to_string(),
                display_name: display_name.to_string(),
            },
            grants: vec![AclGrant {
                grantee: AclGrantee::CanonicalUser {
                    id: owner_id.to_string(),
                    display_name: display_name.to_string(),
                },
                permission: "FULL_CONTROL".to_string(),
            }],
        }
    }

    /// Serialize to the JSON blob form carried in records.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ── Record types ───────────────────────────────────────────────────

/// Metadata record for a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Bucket name (unique).
    pub name: String,
    /// Region the bucket is placed in.
    pub region: String,
    /// Canonical owner ID.
    pub owner_id: String,
    /// Owner display name.
    pub owner_display: String,
    /// Access control list (JSON blob).
    pub acl: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
}

/// Metadata record for an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Bucket the object belongs to.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Quoted ETag string (MD5 hex, or `"hex-N"` for multipart).
    pub etag: String,
    /// MIME content type.
    pub content_type: String,
    /// Content-Encoding header value, if any.
    pub content_encoding: Option<String>,
    /// Content-Language header value, if any.
    pub content_language: Option<String>,
    /// Content-Disposition header value, if any.
    pub content_disposition: Option<String>,
    /// Cache-Control header value, if any.
    pub cache_control: Option<String>,
    /// Expires header value, if any.
    pub expires: Option<String>,
    /// Storage class (default STANDARD).
    pub storage_class: String,
    /// Access control list (JSON blob).
    pub acl: String,
    /// User-defined metadata headers.
    pub user_metadata: HashMap<String, String>,
    /// ISO-8601 last-modified timestamp.
    pub last_modified: String,
    /// Whether this is a delete marker (versioning placeholder).
    pub delete_marker: bool,
}

impl ObjectRecord {
    /// Fill in the upsert defaults the contract guarantees: content
    /// type, storage class, and ACL are never stored empty.
    pub fn normalized(mut self) -> Self {
        if self.content_type.is_empty() {
            self.content_type = DEFAULT_CONTENT_TYPE.to_string();
        }
        if self.storage_class.is_empty() {
            self.storage_class = DEFAULT_STORAGE_CLASS.to_string();
        }
        if self.acl.is_empty() {
            self.acl = "{}".to_string();
        }
        self
    }
}

/// Metadata record for an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipartUploadRecord {
    /// Unique upload identifier (32-char lowercase hex).
    pub upload_id: String,
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// MIME content type.
    pub content_type: String,
    /// Content-Encoding, if any.
    pub content_encoding: Option<String>,
    /// Content-Language, if any.
    pub content_language: Option<String>,
    /// Content-Disposition, if any.
    pub content_disposition: Option<String>,
    /// Cache-Control, if any.
    pub cache_control: Option<String>,
    /// Expires, if any.
    pub expires: Option<String>,
    /// Storage class.
    pub storage_class: String,
    /// ACL (JSON blob).
    pub acl: String,
    /// User-defined metadata.
    pub user_metadata: HashMap<String, String>,
    /// Owner ID.
    pub owner_id: String,
    /// Owner display name.
    pub owner_display: String,
    /// ISO-8601 initiation timestamp.
    pub initiated_at: String,
}

/// Metadata record for a single uploaded part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartRecord {
    /// Part number (1-10000).
    pub part_number: u32,
    /// Size in bytes.
    pub size: u64,
    /// Quoted ETag string.
    pub etag: String,
    /// ISO-8601 last-modified timestamp.
    pub last_modified: String,
}

/// Stored credential record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Access key ID.
    pub access_key_id: String,
    /// Secret key (plaintext; redacted on export unless opted in).
    pub secret_key: String,
    /// Canonical owner ID associated with this credential.
    pub owner_id: String,
    /// Display name for the owner.
    pub display_name: String,
    /// Whether this credential is active. Inactive credentials behave
    /// as absent on lookup.
    pub active: bool,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
}

/// An upload removed by [`MetadataStore::reap_expired_uploads`],
/// returned so the caller can also clean up part storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiredUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
}

// ── Query and result types ─────────────────────────────────────────

/// Parameters for [`MetadataStore::list_objects`].
///
/// Cursor priority: `continuation_token` > `marker` > `start_after`
/// (first non-empty wins).
#[derive(Debug, Clone)]
pub struct ListObjectsQuery {
    pub prefix: String,
    pub delimiter: String,
    pub max_keys: u32,
    /// V1 marker.
    pub marker: String,
    /// V2 StartAfter.
    pub start_after: String,
    /// V2 continuation token.
    pub continuation_token: Option<String>,
}

impl Default for ListObjectsQuery {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            delimiter: String::new(),
            max_keys: MAX_LIST_KEYS,
            marker: String::new(),
            start_after: String::new(),
            continuation_token: None,
        }
    }
}

impl ListObjectsQuery {
    /// The effective exclusive start key per the cursor priority rule.
    pub fn start_key(&self) -> &str {
        match self.continuation_token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ if !self.marker.is_empty() => &self.marker,
            _ => &self.start_after,
        }
    }
}

/// Result of a ListObjects operation.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsResult {
    /// The objects on this page, ascending by key.
    pub objects: Vec<ObjectRecord>,
    /// Deduplicated common prefixes, ascending.
    pub common_prefixes: Vec<String>,
    /// Whether the result set was truncated.
    pub is_truncated: bool,
    /// V1 cursor: the last kept entry (object key or common prefix).
    pub next_marker: Option<String>,
    /// V2 cursor; same value as `next_marker`.
    pub next_continuation_token: Option<String>,
}

/// Parameters for [`MetadataStore::list_multipart_uploads`].
#[derive(Debug, Clone)]
pub struct ListUploadsQuery {
    pub prefix: String,
    pub delimiter: String,
    pub max_uploads: u32,
    pub key_marker: String,
    pub upload_id_marker: String,
}

impl Default for ListUploadsQuery {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            delimiter: String::new(),
            max_uploads: MAX_LIST_KEYS,
            key_marker: String::new(),
            upload_id_marker: String::new(),
        }
    }
}

/// Result of a ListMultipartUploads operation.
#[derive(Debug, Clone, Default)]
pub struct ListUploadsResult {
    /// In-progress uploads, ascending by `(key, upload_id)`.
    pub uploads: Vec<MultipartUploadRecord>,
    /// Deduplicated common prefixes, ascending.
    pub common_prefixes: Vec<String>,
    /// Whether the result set was truncated.
    pub is_truncated: bool,
    /// Key of the last kept entry.
    pub next_key_marker: Option<String>,
    /// Upload id of the last kept upload (empty when the last entry was
    /// a common prefix).
    pub next_upload_id_marker: Option<String>,
}

/// Parameters for [`MetadataStore::list_parts`].
#[derive(Debug, Clone)]
pub struct ListPartsQuery {
    pub max_parts: u32,
    pub part_number_marker: u32,
}

impl Default for ListPartsQuery {
    fn default() -> Self {
        Self {
            max_parts: MAX_LIST_KEYS,
            part_number_marker: 0,
        }
    }
}

/// Result of a ListParts operation.
#[derive(Debug, Clone, Default)]
pub struct ListPartsResult {
    /// Parts ascending by part number.
    pub parts: Vec<PartRecord>,
    /// Whether the result set was truncated.
    pub is_truncated: bool,
    /// Part number of the last kept part, when truncated.
    pub next_part_number_marker: Option<u32>,
}

/// Per-key outcome of a batch metadata delete; order matches the
/// request's key order.
#[derive(Debug, Clone, Default)]
pub struct BatchDeleteOutcome {
    /// Keys whose records were removed (or were already absent --
    /// deletes are idempotent).
    pub deleted: Vec<String>,
    /// Keys whose delete failed, with the S3 error code and message.
    pub errors: Vec<BatchDeleteError>,
}

/// One failed key in a batch delete.
#[derive(Debug, Clone)]
pub struct BatchDeleteError {
    pub key: String,
    pub code: String,
    pub message: String,
}

// ── Trait ──────────────────────────────────────────────────────────

/// Async metadata store contract.
///
/// Absent rows are `Ok(None)`, never errors. Operational failures map
/// to `StoreError::Internal`; domain failures use their specific
/// variants. Implementations must be safe for concurrent callers.
pub trait MetadataStore: Send + Sync + 'static {
    // ── Buckets ────────────────────────────────────────────────────

    /// Create a bucket record. Fails with `BucketAlreadyExists` if the
    /// name is taken.
    fn create_bucket(&self, record: BucketRecord) -> BoxFut<'_, ()>;

    /// Fetch a bucket by name.
    fn get_bucket(&self, name: &str) -> BoxFut<'_, Option<BucketRecord>>;

    /// Delete a bucket. Fails with `NoSuchBucket` when absent and
    /// `BucketNotEmpty` while any object or in-progress upload still
    /// references it.
    fn delete_bucket(&self, name: &str) -> BoxFut<'_, ()>;

    /// List buckets ascending by name, optionally filtered by owner.
    fn list_buckets(&self, owner: Option<&str>) -> BoxFut<'_, Vec<BucketRecord>>;

    /// Replace the ACL on a bucket.
    fn update_bucket_acl(&self, name: &str, acl: &str) -> BoxFut<'_, ()>;

    // ── Objects ────────────────────────────────────────────────────

    /// Insert or replace an object record (upsert).
    fn put_object(&self, record: ObjectRecord) -> BoxFut<'_, ()>;

    /// Fetch a single object record.
    fn get_object(&self, bucket: &str, key: &str) -> BoxFut<'_, Option<ObjectRecord>>;

    /// Delete an object record. Idempotent: a missing row is not an
    /// error.
    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()>;

    /// Delete multiple object records. The outcome preserves the
    /// request's key order.
    fn delete_objects_meta(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> BoxFut<'_, BatchDeleteOutcome>;

    /// Replace the ACL on an object. Fails with `NoSuchKey` when the
    /// object is absent.
    fn update_object_acl(&self, bucket: &str, key: &str, acl: &str) -> BoxFut<'_, ()>;

    /// List objects with prefix/delimiter/pagination semantics.
    fn list_objects(&self, bucket: &str, query: ListObjectsQuery)
        -> BoxFut<'_, ListObjectsResult>;

    /// Number of objects in a bucket (BucketNotEmpty checks).
    fn count_objects(&self, bucket: &str) -> BoxFut<'_, u64>;

    // ── Multipart uploads ──────────────────────────────────────────

    /// Create a multipart upload record, generating a fresh upload id
    /// when `record.upload_id` is empty. Returns the effective id.
    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> BoxFut<'_, String>;

    /// Fetch an upload by id. Returns `None` when the upload does not
    /// exist or its bucket/key do not match (this doubles as the access
    /// check).
    fn get_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BoxFut<'_, Option<MultipartUploadRecord>>;

    /// Record an uploaded part (upsert). Fails with `NoSuchUpload` when
    /// the parent upload is absent.
    fn put_part(&self, upload_id: &str, part: PartRecord) -> BoxFut<'_, ()>;

    /// List parts ascending by part number.
    fn list_parts(&self, upload_id: &str, query: ListPartsQuery) -> BoxFut<'_, ListPartsResult>;

    /// Fetch parts for completion validation, ascending by part number.
    /// An empty `part_numbers` slice selects all parts.
    fn get_parts_for_completion(
        &self,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> BoxFut<'_, Vec<PartRecord>>;

    /// Atomically write the final object record and remove the upload
    /// and its part records.
    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        final_object: ObjectRecord,
    ) -> BoxFut<'_, ()>;

    /// Remove the upload and its part records. Fails with
    /// `NoSuchUpload` when the upload (with matching bucket/key) is
    /// absent.
    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BoxFut<'_, ()>;

    /// List in-progress uploads ascending by `(key, upload_id)`.
    fn list_multipart_uploads(
        &self,
        bucket: &str,
        query: ListUploadsQuery,
    ) -> BoxFut<'_, ListUploadsResult>;

    /// Number of in-progress uploads in a bucket (BucketNotEmpty
    /// checks).
    fn count_uploads(&self, bucket: &str) -> BoxFut<'_, u64>;

    /// Remove uploads initiated more than `ttl_seconds` ago, returning
    /// what was removed so part storage can be swept too.
    fn reap_expired_uploads(&self, ttl_seconds: i64) -> BoxFut<'_, Vec<ExpiredUpload>>;

    // ── Credentials ────────────────────────────────────────────────

    /// Look up a credential. Inactive credentials are returned as
    /// `None`.
    fn get_credential(&self, access_key_id: &str) -> BoxFut<'_, Option<CredentialRecord>>;

    /// Insert or replace a credential record.
    fn put_credential(&self, record: CredentialRecord) -> BoxFut<'_, ()>;

    // ── Full-table dumps ───────────────────────────────────────────
    //
    // Used by the serializer (export must be byte-identical across
    // backends, so rows stream in primary-key order) and by startup
    // recovery (live upload ids for the orphan sweep).

    /// All buckets ascending by name.
    fn dump_buckets(&self) -> BoxFut<'_, Vec<BucketRecord>>;

    /// All objects ascending by `(bucket, key)`.
    fn dump_objects(&self) -> BoxFut<'_, Vec<ObjectRecord>>;

    /// All uploads ascending by upload id.
    fn dump_uploads(&self) -> BoxFut<'_, Vec<MultipartUploadRecord>>;

    /// All parts ascending by `(upload_id, part_number)`.
    fn dump_parts(&self) -> BoxFut<'_, Vec<(String, PartRecord)>>;

    /// All credentials ascending by access key id.
    fn dump_credentials(&self) -> BoxFut<'_, Vec<CredentialRecord>>;

    // ── Health ─────────────────────────────────────────────────────

    /// Cheap substrate probe for readiness checks.
    fn health_check(&self) -> BoxFut<'_, ()>;
}

/// Build the credential record seeded from configuration. Idempotent
/// startup paths call `put_credential` only when the key is not already
/// present so a restart never clobbers a rotated secret.
pub fn seed_credential_record(access_key: &str, secret_key: &str) -> CredentialRecord {
    CredentialRecord {
        access_key_id: access_key.to_string(),
        secret_key: secret_key.to_string(),
        owner_id: access_key.to_string(),
        display_name: access_key.to_string(),
        active: true,
        created_at: crate::types::now_iso8601(),
    }
}
