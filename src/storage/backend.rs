//! Abstract storage backend contract.
//!
//! A storage backend is the raw byte plane: it never sees metadata
//! records, only `(bucket, key)`-addressed payloads and multipart part
//! staging areas.  Every write is durable before the method returns --
//! the engine acks callers only after both the byte write and the
//! metadata commit succeed.

use bytes::Bytes;

use crate::types::{BoxFut, ByteRange};

/// What `head_object` reports about a stored payload.
#[derive(Debug, Clone)]
pub struct ObjectStat {
    /// Size in bytes.
    pub size: u64,
    /// Quoted ETag as computed at write time.
    pub etag: String,
    /// ISO-8601 last-modified timestamp.
    pub last_modified: String,
}

/// One part reference handed to [`StorageBackend::assemble_parts`],
/// in the caller-requested order.
#[derive(Debug, Clone)]
pub struct PartSource {
    pub part_number: u32,
    /// Quoted ETag the caller claims for this part; backends may use it
    /// for staging-object names but must not trust it for hashing.
    pub etag: String,
}

/// Result of stitching parts into a final object.
#[derive(Debug, Clone)]
pub struct AssembledObject {
    /// Composite ETag: `"{md5(concat(part_md5s))}-{N}"`.
    pub etag: String,
    /// Total size of the assembled object in bytes.
    pub total_size: u64,
}

/// Async object storage contract.
///
/// Deletes and sweeps are idempotent.  Domain errors use their
/// `StoreError` variants (`NoSuchKey` for absent payloads, `InvalidRange`
/// for unsatisfiable ranges); substrate failures arrive wrapped.
pub trait StorageBackend: Send + Sync + 'static {
    /// Write an object's bytes, returning the quoted MD5 ETag. Durable
    /// before return.
    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BoxFut<'_, String>;

    /// Read an object, optionally restricted to a byte range.
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BoxFut<'_, Bytes>;

    /// Size/ETag/mtime of a stored object without reading its body.
    fn head_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ObjectStat>;

    /// Delete an object's bytes. Missing objects are success.
    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()>;

    /// Copy an object, server-side where the substrate allows,
    /// returning the new ETag.
    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BoxFut<'_, String>;

    /// Stage one part of a multipart upload, returning its quoted MD5
    /// ETag.
    fn put_part(
        &self,
        bucket: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BoxFut<'_, String>;

    /// Stitch staged parts into the final object, in the given order,
    /// computing the composite ETag and total size.
    fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartSource],
    ) -> BoxFut<'_, AssembledObject>;

    /// Remove all staged part data for an upload. Idempotent.
    fn delete_parts(&self, bucket: &str, upload_id: &str) -> BoxFut<'_, ()>;

    /// Create the substrate-side bucket namespace. A logical no-op for
    /// gateway backends that map buckets to key prefixes.
    fn create_bucket(&self, bucket: &str) -> BoxFut<'_, ()>;

    /// Remove the substrate-side bucket namespace.
    fn delete_bucket(&self, bucket: &str) -> BoxFut<'_, ()>;

    /// Startup/reaper sweep: remove scratch space and any part staging
    /// area whose upload id is not in `live_upload_ids`.
    fn sweep_expired_parts(&self, live_upload_ids: &[String]) -> BoxFut<'_, ()>;

    /// Cheap substrate probe for readiness checks.
    fn health_check(&self) -> BoxFut<'_, ()>;
}
