//! Local filesystem storage backend.
//!
//! On-disk layout under the configured root:
//!
//! ```text
//! {root}/
//!   .tmp/                     scratch; cleared on startup
//!   .multipart/{upload_id}/{part_number}
//!   {bucket}/{key}            key '/' maps to nested directories
//! ```
//!
//! Every write follows the crash-only durability protocol: stream to a
//! temp file under `.tmp/`, fsync the file, create the target's parent
//! directories, fsync the parent, then atomically rename into place.
//! The metadata commit happens after this method returns, so a crash at
//! any step leaves only orphans for the startup sweep.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::backend::{AssembledObject, ObjectStat, PartSource, StorageBackend};
use crate::errors::{StoreError, StoreResult};
use crate::types::{composite_etag, now_iso8601, BoxFut, ByteRange};

const TMP_DIR: &str = ".tmp";
const MULTIPART_DIR: &str = ".multipart";

/// Stores objects as flat files under a root directory.
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    /// Create a backend rooted at `root`, creating the root and the
    /// scratch directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root })
    }

    /// Resolve `bucket/key` to an absolute path, rejecting traversal.
    fn object_path(&self, bucket: &str, key: &str) -> StoreResult<PathBuf> {
        for component in Path::new(key).components() {
            if matches!(component, std::path::Component::ParentDir) {
                return Err(StoreError::invalid(format!(
                    "Object key escapes the storage root: {key}"
                )));
            }
        }
        Ok(self.root.join(bucket).join(key))
    }

    fn part_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        // Plain decimal, no zero-padding.
        self.part_dir(upload_id).join(part_number.to_string())
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(TMP_DIR)
            .join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    /// The temp-fsync-rename commit: write `data` to scratch, fsync it,
    /// make and fsync the final parent, rename into place.
    fn durable_write(&self, final_path: &Path, data: &[u8]) -> StoreResult<()> {
        let tmp_path = self.temp_path();

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        let parent = final_path
            .parent()
            .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("target path has no parent")))?;
        // Intermediate directories must exist before the parent fsync
        // so the rename's directory entry is what gets persisted.
        std::fs::create_dir_all(parent)?;
        fsync_dir(parent)?;

        std::fs::rename(&tmp_path, final_path)?;
        fsync_dir(parent)?;
        Ok(())
    }
}

/// fsync a directory so freshly created entries survive a crash.
fn fsync_dir(dir: &Path) -> StoreResult<()> {
    let handle = std::fs::File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

impl StorageBackend for LocalFsBackend {
    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BoxFut<'_, String> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let final_path = self.object_path(&bucket, &key)?;

            let mut hasher = Md5::new();
            hasher.update(&data);
            let etag = format!("\"{}\"", hex::encode(hasher.finalize()));

            self.durable_write(&final_path, &data)?;
            Ok(etag)
        })
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BoxFut<'_, Bytes> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let path = self.object_path(&bucket, &key)?;
            if !path.is_file() {
                return Err(StoreError::NoSuchKey { bucket, key });
            }
            let data = std::fs::read(&path)?;
            match range {
                Some(range) => {
                    let (first, last) = range.resolve(data.len() as u64)?;
                    Ok(Bytes::copy_from_slice(
                        &data[first as usize..=last as usize],
                    ))
                }
                None => Ok(Bytes::from(data)),
            }
        })
    }

    fn head_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ObjectStat> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let path = self.object_path(&bucket, &key)?;
            if !path.is_file() {
                return Err(StoreError::NoSuchKey { bucket, key });
            }
            let meta = std::fs::metadata(&path)?;
            // ETag is recomputed from content; the metadata layer holds
            // the authoritative copy and skips this path entirely.
            let data = std::fs::read(&path)?;
            let mut hasher = Md5::new();
            hasher.update(&data);
            let etag = format!("\"{}\"", hex::encode(hasher.finalize()));
            let last_modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| {
                    chrono::DateTime::from_timestamp(d.as_secs() as i64, d.subsec_nanos())
                        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
                        .unwrap_or_else(now_iso8601)
                })
                .unwrap_or_else(now_iso8601);
            Ok(ObjectStat {
                size: meta.len(),
                etag,
                last_modified,
            })
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let path = self.object_path(&bucket, &key)?;
            if path.is_file() {
                std::fs::remove_file(&path)?;
            }
            Ok(())
        })
    }

    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BoxFut<'_, String> {
        let src_bucket = src_bucket.to_string();
        let src_key = src_key.to_string();
        let dst_bucket = dst_bucket.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            let src_path = self.object_path(&src_bucket, &src_key)?;
            if !src_path.is_file() {
                return Err(StoreError::NoSuchKey {
                    bucket: src_bucket,
                    key: src_key,
                });
            }
            let data = std::fs::read(&src_path)?;

            let mut hasher = Md5::new();
            hasher.update(&data);
            let etag = format!("\"{}\"", hex::encode(hasher.finalize()));

            let dst_path = self.object_path(&dst_bucket, &dst_key)?;
            self.durable_write(&dst_path, &data)?;
            Ok(etag)
        })
    }

    fn put_part(
        &self,
        _bucket: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BoxFut<'_, String> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut hasher = Md5::new();
            hasher.update(&data);
            let etag = format!("\"{}\"", hex::encode(hasher.finalize()));

            let final_path = self.part_path(&upload_id, part_number);
            self.durable_write(&final_path, &data)?;
            Ok(etag)
        })
    }

    fn assemble_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartSource],
    ) -> BoxFut<'_, AssembledObject> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let final_path = self.object_path(&bucket, &key)?;
            let tmp_path = self.temp_path();

            // Stream concatenation into the temp file, hashing each
            // part's bytes as they go by.
            let mut output = std::fs::File::create(&tmp_path)?;
            let mut part_digests: Vec<[u8; 16]> = Vec::with_capacity(parts.len());
            let mut total_size: u64 = 0;

            for part in &parts {
                let part_path = self.part_path(&upload_id, part.part_number);
                let part_data = std::fs::read(&part_path).map_err(|e| {
                    StoreError::InvalidPart {
                        message: format!(
                            "Part {} of upload {} is not available: {}",
                            part.part_number, upload_id, e
                        ),
                    }
                })?;
                total_size += part_data.len() as u64;

                let mut hasher = Md5::new();
                hasher.update(&part_data);
                part_digests.push(hasher.finalize().into());

                output.write_all(&part_data)?;
            }

            output.sync_all()?;
            drop(output);

            let parent = final_path
                .parent()
                .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("target path has no parent")))?;
            std::fs::create_dir_all(parent)?;
            fsync_dir(parent)?;
            std::fs::rename(&tmp_path, &final_path)?;
            fsync_dir(parent)?;

            Ok(AssembledObject {
                etag: composite_etag(&part_digests),
                total_size,
            })
        })
    }

    fn delete_parts(&self, _bucket: &str, upload_id: &str) -> BoxFut<'_, ()> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let dir = self.part_dir(&upload_id);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
    }

    fn create_bucket(&self, bucket: &str) -> BoxFut<'_, ()> {
        let path = self.root.join(bucket);
        Box::pin(async move {
            std::fs::create_dir_all(&path)?;
            Ok(())
        })
    }

    fn delete_bucket(&self, bucket: &str) -> BoxFut<'_, ()> {
        let path = self.root.join(bucket);
        Box::pin(async move {
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            }
            Ok(())
        })
    }

    fn sweep_expired_parts(&self, live_upload_ids: &[String]) -> BoxFut<'_, ()> {
        let live: Vec<String> = live_upload_ids.to_vec();
        Box::pin(async move {
            // Step one: scratch space holds only uncommitted writes.
            let tmp = self.root.join(TMP_DIR);
            if tmp.is_dir() {
                for entry in std::fs::read_dir(&tmp)? {
                    let entry = entry?;
                    let path = entry.path();
                    let removed = if path.is_dir() {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_file(&path)
                    };
                    if let Err(err) = removed {
                        warn!(path = %path.display(), %err, "failed to clear scratch entry");
                    }
                }
            }
            std::fs::create_dir_all(&tmp)?;

            // Step two: part directories without a live upload row are
            // orphans from a crash or an expired upload.
            let multipart = self.root.join(MULTIPART_DIR);
            if multipart.is_dir() {
                for entry in std::fs::read_dir(&multipart)? {
                    let entry = entry?;
                    let upload_id = entry.file_name().to_string_lossy().to_string();
                    if !live.contains(&upload_id) {
                        debug!(upload_id, "removing orphaned multipart directory");
                        if let Err(err) = std::fs::remove_dir_all(entry.path()) {
                            warn!(upload_id, %err, "failed to remove orphaned part directory");
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            if !self.root.is_dir() {
                return Err(StoreError::Internal(anyhow::anyhow!(
                    "storage root missing: {}",
                    self.root.display()
                )));
            }
            Ok(())
        })
    }
}
