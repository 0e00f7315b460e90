//! The engine: a thin coordinator over one metadata store and one
//! storage backend.
//!
//! The engine owns validation (names, keys, part numbers), the write
//! path ordering that makes crashes safe, and the multipart state
//! machine.  It is a passive library: the request pipeline calls it,
//! and the only background work it owns is the optional reaper task.
//!
//! Write ordering rules:
//! - PutObject: bytes first (durable), then the metadata commit. A
//!   crash in between leaves an orphan data file, which is tolerated
//!   and swept; metadata without bytes would be a hard error.
//! - DeleteObject: metadata first, then bytes, for the same reason.
//! - Complete: assemble durable bytes, commit object metadata and
//!   remove upload/part rows atomically, then drop part bytes.

pub mod reaper;
pub mod recovery;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{StoreError, StoreResult};
use crate::metadata::store::{
    Acl, BatchDeleteOutcome, BucketRecord, CredentialRecord, ListObjectsQuery, ListObjectsResult,
    ListPartsQuery, ListPartsResult, ListUploadsQuery, ListUploadsResult, MetadataStore,
    MultipartUploadRecord, ObjectRecord, PartRecord,
};
use crate::storage::backend::{PartSource, StorageBackend};
use crate::types::{
    now_iso8601, unquote_etag, validate_bucket_name, validate_object_key, validate_part_number,
    ByteRange, DEFAULT_CONTENT_TYPE, DEFAULT_STORAGE_CLASS, MAX_LIST_KEYS, MIN_PART_SIZE,
};

/// The identity attached to buckets, uploads, and default ACLs.
/// Resolved by the authentication layer; the engine only carries it.
#[derive(Debug, Clone)]
pub struct Owner {
    pub id: String,
    pub display_name: String,
}

/// Caller-supplied attributes for PutObject / CreateMultipartUpload.
#[derive(Debug, Clone, Default)]
pub struct ObjectWriteOptions {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
    pub storage_class: Option<String>,
    /// ACL JSON blob; defaults to FULL_CONTROL for the owner.
    pub acl: Option<String>,
    pub user_metadata: HashMap<String, String>,
}

/// One `(part_number, etag)` pair from a CompleteMultipartUpload
/// request body, in request order.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Coordinator over the two backend planes.
pub struct Engine {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
    region: String,
    default_owner: Owner,
    multipart_ttl_seconds: u64,
    reaper_interval_seconds: u64,
    reconcile_on_startup: bool,
}

impl Engine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
        config: &Config,
    ) -> Self {
        Self {
            metadata,
            storage,
            region: config.region.clone(),
            default_owner: Owner {
                id: config.auth.access_key.clone(),
                display_name: config.auth.access_key.clone(),
            },
            multipart_ttl_seconds: config.engine.multipart_ttl_seconds,
            reaper_interval_seconds: config.engine.reaper_interval_seconds,
            reconcile_on_startup: config.engine.reconcile_on_startup,
        }
    }

    /// Start the background upload reaper, if the configured interval
    /// is non-zero. The caller owns the returned handle's lifetime.
    pub fn spawn_reaper(&self) -> Option<reaper::ReaperHandle> {
        if self.reaper_interval_seconds == 0 {
            return None;
        }
        Some(reaper::spawn(
            self.metadata.clone(),
            self.storage.clone(),
            self.multipart_ttl_seconds,
            Duration::from_secs(self.reaper_interval_seconds),
        ))
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn default_owner(&self) -> &Owner {
        &self.default_owner
    }

    pub fn multipart_ttl_seconds(&self) -> u64 {
        self.multipart_ttl_seconds
    }

    async fn require_bucket(&self, bucket: &str) -> StoreResult<BucketRecord> {
        self.metadata
            .get_bucket(bucket)
            .await?
            .ok_or(StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            })
    }

    // ── Buckets ────────────────────────────────────────────────────

    /// CreateBucket. Callers that already own the name get the
    /// distinct `BucketAlreadyOwnedByYou` so the boundary can decide
    /// between 200 and 409 by region convention.
    pub async fn create_bucket(
        &self,
        name: &str,
        region: Option<&str>,
        owner: &Owner,
    ) -> StoreResult<BucketRecord> {
        validate_bucket_name(name)?;
        if let Some(existing) = self.metadata.get_bucket(name).await? {
            if existing.owner_id == owner.id {
                return Err(StoreError::BucketAlreadyOwnedByYou {
                    bucket: name.to_string(),
                });
            }
            return Err(StoreError::BucketAlreadyExists {
                bucket: name.to_string(),
            });
        }

        let record = BucketRecord {
            name: name.to_string(),
            region: region.unwrap_or(&self.region).to_string(),
            owner_id: owner.id.clone(),
            owner_display: owner.display_name.clone(),
            acl: Acl::full_control(&owner.id, &owner.display_name).to_json(),
            created_at: now_iso8601(),
        };

        self.storage.create_bucket(name).await?;
        self.metadata.create_bucket(record.clone()).await?;
        info!(bucket = name, region = %record.region, "bucket created");
        Ok(record)
    }

    pub async fn get_bucket(&self, name: &str) -> StoreResult<Option<BucketRecord>> {
        self.metadata.get_bucket(name).await
    }

    /// DeleteBucket. Fails while objects or in-progress uploads still
    /// reference the bucket.
    pub async fn delete_bucket(&self, name: &str) -> StoreResult<()> {
        self.metadata.delete_bucket(name).await?;
        self.storage.delete_bucket(name).await?;
        info!(bucket = name, "bucket deleted");
        Ok(())
    }

    pub async fn list_buckets(&self, owner: Option<&str>) -> StoreResult<Vec<BucketRecord>> {
        self.metadata.list_buckets(owner).await
    }

    pub async fn get_bucket_acl(&self, name: &str) -> StoreResult<String> {
        Ok(self.require_bucket(name).await?.acl)
    }

    pub async fn put_bucket_acl(&self, name: &str, acl: &str) -> StoreResult<()> {
        self.metadata.update_bucket_acl(name, acl).await
    }

    // ── Objects ────────────────────────────────────────────────────

    /// PutObject: durable bytes, then the metadata upsert, then the
    /// ack.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: ObjectWriteOptions,
        owner: &Owner,
    ) -> StoreResult<ObjectRecord> {
        validate_object_key(key)?;
        self.require_bucket(bucket).await?;

        let size = data.len() as u64;
        let etag = self.storage.put_object(bucket, key, data).await?;

        let record = self
            .build_object_record(bucket, key, size, etag, &options, owner)
            .normalized();
        self.metadata.put_object(record.clone()).await?;
        debug!(bucket, key, size, etag = %record.etag, "object stored");
        Ok(record)
    }

    fn build_object_record(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        etag: String,
        options: &ObjectWriteOptions,
        owner: &Owner,
    ) -> ObjectRecord {
        ObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            etag,
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_encoding: options.content_encoding.clone(),
            content_language: options.content_language.clone(),
            content_disposition: options.content_disposition.clone(),
            cache_control: options.cache_control.clone(),
            expires: options.expires.clone(),
            storage_class: options
                .storage_class
                .clone()
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
            acl: options
                .acl
                .clone()
                .unwrap_or_else(|| Acl::full_control(&owner.id, &owner.display_name).to_json()),
            user_metadata: options.user_metadata.clone(),
            last_modified: now_iso8601(),
            delete_marker: false,
        }
    }

    /// GetObject: the metadata record plus the (optionally ranged)
    /// body. A record whose bytes are missing is invariant breakage
    /// and surfaces as an internal error, never as NoSuchKey.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> StoreResult<(ObjectRecord, Bytes)> {
        let record = self.head_object(bucket, key).await?;
        let data = match self.storage.get_object(bucket, key, range).await {
            Ok(data) => data,
            Err(StoreError::NoSuchKey { .. }) => {
                return Err(StoreError::Internal(anyhow::anyhow!(
                    "object {bucket}/{key} has metadata but no stored bytes"
                )));
            }
            Err(err) => return Err(err),
        };
        Ok((record, data))
    }

    /// HeadObject: metadata only.
    pub async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectRecord> {
        match self.metadata.get_object(bucket, key).await? {
            Some(record) => Ok(record),
            None => {
                // Distinguish NoSuchBucket from NoSuchKey.
                self.require_bucket(bucket).await?;
                Err(StoreError::NoSuchKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
        }
    }

    /// DeleteObject: idempotent; metadata row goes first so readers
    /// never observe bytes for a deleted object.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.require_bucket(bucket).await?;
        self.metadata.delete_object(bucket, key).await?;
        self.storage.delete_object(bucket, key).await?;
        Ok(())
    }

    /// DeleteObjects: per-key results in request order.
    pub async fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> StoreResult<BatchDeleteOutcome> {
        self.require_bucket(bucket).await?;
        let outcome = self.metadata.delete_objects_meta(bucket, keys).await?;
        for key in &outcome.deleted {
            self.storage.delete_object(bucket, key).await?;
        }
        Ok(outcome)
    }

    /// CopyObject: server-side where the substrate allows. Metadata is
    /// cloned from the source unless the options override it.
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StoreResult<ObjectRecord> {
        validate_object_key(dst_key)?;
        let source = self.head_object(src_bucket, src_key).await?;
        self.require_bucket(dst_bucket).await?;

        let etag = self
            .storage
            .copy_object(src_bucket, src_key, dst_bucket, dst_key)
            .await?;

        let record = ObjectRecord {
            bucket: dst_bucket.to_string(),
            key: dst_key.to_string(),
            etag,
            last_modified: now_iso8601(),
            ..source
        }
        .normalized();
        self.metadata.put_object(record.clone()).await?;
        Ok(record)
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        mut query: ListObjectsQuery,
    ) -> StoreResult<ListObjectsResult> {
        self.require_bucket(bucket).await?;
        if query.max_keys == 0 {
            return Ok(ListObjectsResult::default());
        }
        query.max_keys = query.max_keys.min(MAX_LIST_KEYS);
        self.metadata.list_objects(bucket, query).await
    }

    pub async fn get_object_acl(&self, bucket: &str, key: &str) -> StoreResult<String> {
        Ok(self.head_object(bucket, key).await?.acl)
    }

    pub async fn put_object_acl(&self, bucket: &str, key: &str, acl: &str) -> StoreResult<()> {
        self.require_bucket(bucket).await?;
        self.metadata.update_object_acl(bucket, key, acl).await
    }

    // ── Multipart uploads ──────────────────────────────────────────

    /// CreateMultipartUpload: Initiated state; the id is minted by the
    /// metadata layer.
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: ObjectWriteOptions,
        owner: &Owner,
    ) -> StoreResult<MultipartUploadRecord> {
        validate_object_key(key)?;
        self.require_bucket(bucket).await?;

        let mut record = MultipartUploadRecord {
            upload_id: String::new(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_encoding: options.content_encoding.clone(),
            content_language: options.content_language.clone(),
            content_disposition: options.content_disposition.clone(),
            cache_control: options.cache_control.clone(),
            expires: options.expires.clone(),
            storage_class: options
                .storage_class
                .clone()
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
            acl: options
                .acl
                .clone()
                .unwrap_or_else(|| Acl::full_control(&owner.id, &owner.display_name).to_json()),
            user_metadata: options.user_metadata.clone(),
            owner_id: owner.id.clone(),
            owner_display: owner.display_name.clone(),
            initiated_at: now_iso8601(),
        };
        record.upload_id = self.metadata.create_multipart_upload(record.clone()).await?;
        info!(bucket, key, upload_id = %record.upload_id, "multipart upload initiated");
        Ok(record)
    }

    pub async fn get_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<Option<MultipartUploadRecord>> {
        self.metadata
            .get_multipart_upload(bucket, key, upload_id)
            .await
    }

    /// UploadPart: bytes staged durably, then the part row upserted.
    /// Re-uploading a part number replaces it (last writer wins).
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String> {
        validate_part_number(part_number)?;
        if self
            .metadata
            .get_multipart_upload(bucket, key, upload_id)
            .await?
            .is_none()
        {
            return Err(StoreError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            });
        }

        let size = data.len() as u64;
        let etag = self
            .storage
            .put_part(bucket, upload_id, part_number, data)
            .await?;
        self.metadata
            .put_part(
                upload_id,
                PartRecord {
                    part_number,
                    size,
                    etag: etag.clone(),
                    last_modified: now_iso8601(),
                },
            )
            .await?;
        debug!(bucket, key, upload_id, part_number, size, "part stored");
        Ok(etag)
    }

    /// CompleteMultipartUpload, in the crash-safe order: validate,
    /// assemble durable bytes, commit object metadata while removing
    /// upload and part rows, then drop the staged part bytes.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        requested: &[CompletedPart],
    ) -> StoreResult<ObjectRecord> {
        let upload = self
            .metadata
            .get_multipart_upload(bucket, key, upload_id)
            .await?
            .ok_or(StoreError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?;

        if requested.is_empty() {
            return Err(StoreError::InvalidPart {
                message: "You must specify at least one part".to_string(),
            });
        }
        for pair in requested.windows(2) {
            if pair[1].part_number <= pair[0].part_number {
                return Err(StoreError::InvalidPartOrder);
            }
        }

        let numbers: Vec<u32> = requested.iter().map(|p| p.part_number).collect();
        let stored = self
            .metadata
            .get_parts_for_completion(upload_id, &numbers)
            .await?;

        for (index, wanted) in requested.iter().enumerate() {
            let part = stored
                .iter()
                .find(|p| p.part_number == wanted.part_number)
                .ok_or_else(|| StoreError::InvalidPart {
                    message: format!(
                        "One or more of the specified parts could not be found: part {}",
                        wanted.part_number
                    ),
                })?;
            if unquote_etag(&part.etag) != unquote_etag(&wanted.etag) {
                return Err(StoreError::InvalidPart {
                    message: format!(
                        "Part {}: supplied ETag does not match the uploaded part",
                        wanted.part_number
                    ),
                });
            }
            let is_last = index == requested.len() - 1;
            if !is_last && part.size < MIN_PART_SIZE {
                return Err(StoreError::EntityTooSmall);
            }
        }

        // (i) durable assembly.
        let sources: Vec<PartSource> = requested
            .iter()
            .map(|p| PartSource {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();
        let assembled = self
            .storage
            .assemble_parts(bucket, key, upload_id, &sources)
            .await?;

        // (ii)-(iv) final object in, upload + part rows out.
        let record = ObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: assembled.total_size,
            etag: assembled.etag,
            content_type: upload.content_type.clone(),
            content_encoding: upload.content_encoding.clone(),
            content_language: upload.content_language.clone(),
            content_disposition: upload.content_disposition.clone(),
            cache_control: upload.cache_control.clone(),
            expires: upload.expires.clone(),
            storage_class: upload.storage_class.clone(),
            acl: upload.acl.clone(),
            user_metadata: upload.user_metadata.clone(),
            last_modified: now_iso8601(),
            delete_marker: false,
        }
        .normalized();
        self.metadata
            .complete_multipart_upload(bucket, key, upload_id, record.clone())
            .await?;

        // (v) staged bytes. A crash before this leaves orphans for the
        // sweep; the object is already visible.
        self.storage.delete_parts(bucket, upload_id).await?;

        info!(bucket, key, upload_id, size = record.size, etag = %record.etag,
              "multipart upload completed");
        Ok(record)
    }

    /// AbortMultipartUpload: removes rows then bytes.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        self.metadata
            .abort_multipart_upload(bucket, key, upload_id)
            .await?;
        self.storage.delete_parts(bucket, upload_id).await?;
        info!(bucket, key, upload_id, "multipart upload aborted");
        Ok(())
    }

    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        mut query: ListPartsQuery,
    ) -> StoreResult<ListPartsResult> {
        if self
            .metadata
            .get_multipart_upload(bucket, key, upload_id)
            .await?
            .is_none()
        {
            return Err(StoreError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            });
        }
        query.max_parts = query.max_parts.min(MAX_LIST_KEYS);
        self.metadata.list_parts(upload_id, query).await
    }

    pub async fn list_multipart_uploads(
        &self,
        bucket: &str,
        mut query: ListUploadsQuery,
    ) -> StoreResult<ListUploadsResult> {
        self.require_bucket(bucket).await?;
        query.max_uploads = query.max_uploads.min(MAX_LIST_KEYS);
        self.metadata.list_multipart_uploads(bucket, query).await
    }

    // ── Credentials ────────────────────────────────────────────────

    /// Credential lookup for the authentication layer. Inactive and
    /// unknown keys are both `None`.
    pub async fn get_credential(
        &self,
        access_key_id: &str,
    ) -> StoreResult<Option<CredentialRecord>> {
        self.metadata.get_credential(access_key_id).await
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Probe both planes.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.metadata.health_check().await?;
        self.storage.health_check().await?;
        Ok(())
    }
}
