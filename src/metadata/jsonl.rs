//! Local JSONL file metadata store.
//!
//! Entities live in five append-only JSON-Lines files (`buckets.jsonl`,
//! `objects.jsonl`, `uploads.jsonl`, `parts.jsonl`,
//! `credentials.jsonl`).  Each line is an envelope:
//!
//! ```text
//! {"type":"object","data":{...},"_deleted":false,"bucket":"b","key":"k"}
//! ```
//!
//! The append is the commit point; deletions append tombstones
//! (`"_deleted":true` with only the identifying fields).  On load the
//! latest record per primary key wins.  Compaction rewrites each file
//! to `{file}.tmp` and atomically renames it into place; it runs on
//! startup by default.
//!
//! In-memory indices sit behind one read-write lock (readers share,
//! every mutator appends then updates the maps under the write lock).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::list;
use super::store::{
    BatchDeleteOutcome, BucketRecord, CredentialRecord, ExpiredUpload, ListObjectsQuery,
    ListObjectsResult, ListPartsQuery, ListPartsResult, ListUploadsQuery, ListUploadsResult,
    MetadataStore, MultipartUploadRecord, ObjectRecord, PartRecord,
};
use crate::errors::{StoreError, StoreResult};
use crate::types::{iso8601_to_epoch_secs, new_upload_id, now_iso8601, BoxFut};

const BUCKETS_FILE: &str = "buckets.jsonl";
const OBJECTS_FILE: &str = "objects.jsonl";
const UPLOADS_FILE: &str = "uploads.jsonl";
const PARTS_FILE: &str = "parts.jsonl";
const CREDENTIALS_FILE: &str = "credentials.jsonl";

/// One line of a JSONL log file.
#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    /// Entity kind: `bucket`, `object`, `upload`, `part`, `credential`.
    #[serde(rename = "type")]
    kind: String,
    /// Full entity payload; `None` on tombstones.
    #[serde(default)]
    data: Option<serde_json::Value>,
    /// Tombstone marker.
    #[serde(default)]
    _deleted: bool,
    /// Identifying fields, present as applicable for the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    part_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_key_id: Option<String>,
}

impl LogLine {
    fn record<T: Serialize>(kind: &str, data: &T) -> StoreResult<Self> {
        Ok(LogLine {
            kind: kind.to_string(),
            data: Some(serde_json::to_value(data)?),
            _deleted: false,
            name: None,
            bucket: None,
            key: None,
            upload_id: None,
            part_number: None,
            access_key_id: None,
        })
    }

    fn tombstone(kind: &str) -> Self {
        LogLine {
            kind: kind.to_string(),
            data: None,
            _deleted: true,
            name: None,
            bucket: None,
            key: None,
            upload_id: None,
            part_number: None,
            access_key_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, BucketRecord>,
    objects: HashMap<(String, String), ObjectRecord>,
    uploads: HashMap<String, MultipartUploadRecord>,
    parts: HashMap<(String, u32), PartRecord>,
    credentials: HashMap<String, CredentialRecord>,
}

/// Metadata store backed by append-only JSONL files.
pub struct JsonlMetadataStore {
    root_dir: PathBuf,
    inner: RwLock<Inner>,
}

impl JsonlMetadataStore {
    /// Open (or create) the store rooted at `root_dir`, replaying all
    /// five log files. When `compact` is set, every file is rewritten
    /// without tombstones before the store is returned.
    pub fn open(root_dir: impl Into<PathBuf>, compact: bool) -> StoreResult<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;

        let mut inner = Inner::default();
        Self::replay(&root_dir, &mut inner)?;

        let store = Self {
            root_dir,
            inner: RwLock::new(inner),
        };
        if compact {
            store.compact_all()?;
        }
        Ok(store)
    }

    fn replay(root_dir: &Path, inner: &mut Inner) -> StoreResult<()> {
        for file in [
            BUCKETS_FILE,
            OBJECTS_FILE,
            UPLOADS_FILE,
            PARTS_FILE,
            CREDENTIALS_FILE,
        ] {
            let path = root_dir.join(file);
            if !path.exists() {
                continue;
            }
            let reader = BufReader::new(std::fs::File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogLine>(&line) {
                    Ok(entry) => Self::apply(inner, entry),
                    Err(err) => {
                        // A torn final line is expected after a crash
                        // mid-append; anything else is logged and
                        // skipped so one bad line cannot brick startup.
                        warn!(file, line = line_no + 1, %err, "skipping unparseable JSONL line");
                    }
                }
            }
        }

        // Parts replay after uploads, so a part line can outlive its
        // upload's tombstone. No part may exist without an upload row.
        let Inner { parts, uploads, .. } = inner;
        parts.retain(|(uid, _), _| uploads.contains_key(uid));

        Ok(())
    }

    fn apply(inner: &mut Inner, entry: LogLine) {
        match entry.kind.as_str() {
            "bucket" => {
                if entry._deleted {
                    if let Some(name) = entry.name {
                        inner.buckets.remove(&name);
                    }
                } else if let Some(record) = entry
                    .data
                    .and_then(|d| serde_json::from_value::<BucketRecord>(d).ok())
                {
                    inner.buckets.insert(record.name.clone(), record);
                }
            }
            "object" => {
                if entry._deleted {
                    if let (Some(bucket), Some(key)) = (entry.bucket, entry.key) {
                        inner.objects.remove(&(bucket, key));
                    }
                } else if let Some(record) = entry
                    .data
                    .and_then(|d| serde_json::from_value::<ObjectRecord>(d).ok())
                {
                    inner
                        .objects
                        .insert((record.bucket.clone(), record.key.clone()), record);
                }
            }
            "upload" => {
                if entry._deleted {
                    if let Some(upload_id) = entry.upload_id {
                        inner.uploads.remove(&upload_id);
                        inner.parts.retain(|(uid, _), _| *uid != upload_id);
                    }
                } else if let Some(record) = entry
                    .data
                    .and_then(|d| serde_json::from_value::<MultipartUploadRecord>(d).ok())
                {
                    inner.uploads.insert(record.upload_id.clone(), record);
                }
            }
            "part" => {
                if entry._deleted {
                    if let (Some(upload_id), Some(part_number)) =
                        (entry.upload_id, entry.part_number)
                    {
                        inner.parts.remove(&(upload_id, part_number));
                    }
                } else if let (Some(upload_id), Some(record)) = (
                    entry.upload_id,
                    entry
                        .data
                        .and_then(|d| serde_json::from_value::<PartRecord>(d).ok()),
                ) {
                    inner
                        .parts
                        .insert((upload_id, record.part_number), record);
                }
            }
            "credential" => {
                if entry._deleted {
                    if let Some(access_key_id) = entry.access_key_id {
                        inner.credentials.remove(&access_key_id);
                    }
                } else if let Some(record) = entry
                    .data
                    .and_then(|d| serde_json::from_value::<CredentialRecord>(d).ok())
                {
                    inner
                        .credentials
                        .insert(record.access_key_id.clone(), record);
                }
            }
            other => debug!(kind = other, "ignoring unknown JSONL record kind"),
        }
    }

    fn append(&self, filename: &str, entry: &LogLine) -> StoreResult<()> {
        let path = self.root_dir.join(filename);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        // The append is the commit point: make it durable before the
        // caller is acked.
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rewrite every log file from the live indices, dropping
    /// tombstones and superseded lines.
    pub fn compact_all(&self) -> StoreResult<()> {
        let inner = self.inner.read().expect("metadata lock poisoned");

        let buckets: Vec<LogLine> = {
            let mut records: Vec<&BucketRecord> = inner.buckets.values().collect();
            records.sort_by(|a, b| a.name.cmp(&b.name));
            records
                .into_iter()
                .map(|r| LogLine::record("bucket", r))
                .collect::<StoreResult<_>>()?
        };
        self.rewrite(BUCKETS_FILE, &buckets)?;

        let objects: Vec<LogLine> = {
            let mut records: Vec<&ObjectRecord> = inner.objects.values().collect();
            records.sort_by(|a, b| (&a.bucket, &a.key).cmp(&(&b.bucket, &b.key)));
            records
                .into_iter()
                .map(|r| LogLine::record("object", r))
                .collect::<StoreResult<_>>()?
        };
        self.rewrite(OBJECTS_FILE, &objects)?;

        let uploads: Vec<LogLine> = {
            let mut records: Vec<&MultipartUploadRecord> = inner.uploads.values().collect();
            records.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
            records
                .into_iter()
                .map(|r| LogLine::record("upload", r))
                .collect::<StoreResult<_>>()?
        };
        self.rewrite(UPLOADS_FILE, &uploads)?;

        let parts: Vec<LogLine> = {
            let mut entries: Vec<(&(String, u32), &PartRecord)> = inner.parts.iter().collect();
            entries.sort_by_key(|((uid, pn), _)| (uid.clone(), *pn));
            entries
                .into_iter()
                .map(|((uid, _), r)| {
                    let mut line = LogLine::record("part", r)?;
                    line.upload_id = Some(uid.clone());
                    Ok(line)
                })
                .collect::<StoreResult<_>>()?
        };
        self.rewrite(PARTS_FILE, &parts)?;

        let credentials: Vec<LogLine> = {
            let mut records: Vec<&CredentialRecord> = inner.credentials.values().collect();
            records.sort_by(|a, b| a.access_key_id.cmp(&b.access_key_id));
            records
                .into_iter()
                .map(|r| LogLine::record("credential", r))
                .collect::<StoreResult<_>>()?
        };
        self.rewrite(CREDENTIALS_FILE, &credentials)?;

        Ok(())
    }

    fn rewrite(&self, filename: &str, lines: &[LogLine]) -> StoreResult<()> {
        let path = self.root_dir.join(filename);
        let temp = NamedTempFile::new_in(&self.root_dir)?;
        {
            let mut writer = BufWriter::new(&temp);
            for line in lines {
                serde_json::to_writer(&mut writer, line)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path)
            .map_err(|e| StoreError::Internal(e.error.into()))?;
        Ok(())
    }
}

impl MetadataStore for JsonlMetadataStore {
    fn create_bucket(&self, record: BucketRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            if inner.buckets.contains_key(&record.name) {
                return Err(StoreError::BucketAlreadyExists {
                    bucket: record.name,
                });
            }
            self.append(BUCKETS_FILE, &LogLine::record("bucket", &record)?)?;
            inner.buckets.insert(record.name.clone(), record);
            Ok(())
        })
    }

    fn get_bucket(&self, name: &str) -> BoxFut<'_, Option<BucketRecord>> {
        let name = name.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            Ok(inner.buckets.get(&name).cloned())
        })
    }

    fn delete_bucket(&self, name: &str) -> BoxFut<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            if !inner.buckets.contains_key(&name) {
                return Err(StoreError::NoSuchBucket { bucket: name });
            }
            let has_objects = inner.objects.keys().any(|(b, _)| *b == name);
            let has_uploads = inner.uploads.values().any(|u| u.bucket == name);
            if has_objects || has_uploads {
                return Err(StoreError::BucketNotEmpty { bucket: name });
            }
            let mut tombstone = LogLine::tombstone("bucket");
            tombstone.name = Some(name.clone());
            self.append(BUCKETS_FILE, &tombstone)?;
            inner.buckets.remove(&name);
            Ok(())
        })
    }

    fn list_buckets(&self, owner: Option<&str>) -> BoxFut<'_, Vec<BucketRecord>> {
        let owner = owner.map(|s| s.to_string());
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            let mut buckets: Vec<BucketRecord> = inner
                .buckets
                .values()
                .filter(|b| owner.as_deref().map_or(true, |o| b.owner_id == o))
                .cloned()
                .collect();
            buckets.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(buckets)
        })
    }

    fn update_bucket_acl(&self, name: &str, acl: &str) -> BoxFut<'_, ()> {
        let name = name.to_string();
        let acl = acl.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            let bucket = inner
                .buckets
                .get_mut(&name)
                .ok_or(StoreError::NoSuchBucket {
                    bucket: name.clone(),
                })?;
            bucket.acl = acl;
            let line = LogLine::record("bucket", bucket)?;
            self.append(BUCKETS_FILE, &line)?;
            Ok(())
        })
    }

    fn put_object(&self, record: ObjectRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let record = record.normalized();
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            if !inner.buckets.contains_key(&record.bucket) {
                return Err(StoreError::NoSuchBucket {
                    bucket: record.bucket,
                });
            }
            self.append(OBJECTS_FILE, &LogLine::record("object", &record)?)?;
            inner
                .objects
                .insert((record.bucket.clone(), record.key.clone()), record);
            Ok(())
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> BoxFut<'_, Option<ObjectRecord>> {
        let lookup = (bucket.to_string(), key.to_string());
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            Ok(inner.objects.get(&lookup).cloned())
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            if inner.objects.remove(&(bucket.clone(), key.clone())).is_some() {
                let mut tombstone = LogLine::tombstone("object");
                tombstone.bucket = Some(bucket);
                tombstone.key = Some(key);
                self.append(OBJECTS_FILE, &tombstone)?;
            }
            Ok(())
        })
    }

    fn delete_objects_meta(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> BoxFut<'_, BatchDeleteOutcome> {
        let bucket = bucket.to_string();
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            let mut outcome = BatchDeleteOutcome::default();
            for key in keys {
                if inner.objects.remove(&(bucket.clone(), key.clone())).is_some() {
                    let mut tombstone = LogLine::tombstone("object");
                    tombstone.bucket = Some(bucket.clone());
                    tombstone.key = Some(key.clone());
                    self.append(OBJECTS_FILE, &tombstone)?;
                }
                outcome.deleted.push(key);
            }
            Ok(outcome)
        })
    }

    fn update_object_acl(&self, bucket: &str, key: &str, acl: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let acl = acl.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            let obj = inner
                .objects
                .get_mut(&(bucket.clone(), key.clone()))
                .ok_or(StoreError::NoSuchKey { bucket, key })?;
            obj.acl = acl;
            let line = LogLine::record("object", obj)?;
            self.append(OBJECTS_FILE, &line)?;
            Ok(())
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        query: ListObjectsQuery,
    ) -> BoxFut<'_, ListObjectsResult> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let candidates: Vec<ObjectRecord> = {
                let inner = self.inner.read().expect("metadata lock poisoned");
                inner
                    .objects
                    .iter()
                    .filter(|((b, k), _)| {
                        *b == bucket && list::key_matches(k, &query.prefix, query.start_key())
                    })
                    .map(|(_, o)| o.clone())
                    .collect()
            };
            Ok(list::paginate_objects(candidates, &query))
        })
    }

    fn count_objects(&self, bucket: &str) -> BoxFut<'_, u64> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            Ok(inner.objects.keys().filter(|(b, _)| *b == bucket).count() as u64)
        })
    }

    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> BoxFut<'_, String> {
        Box::pin(async move {
            let mut record = record;
            if record.upload_id.is_empty() {
                record.upload_id = new_upload_id();
            }
            let upload_id = record.upload_id.clone();
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            self.append(UPLOADS_FILE, &LogLine::record("upload", &record)?)?;
            inner.uploads.insert(upload_id.clone(), record);
            Ok(upload_id)
        })
    }

    fn get_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BoxFut<'_, Option<MultipartUploadRecord>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            Ok(inner
                .uploads
                .get(&upload_id)
                .filter(|u| u.bucket == bucket && u.key == key)
                .cloned())
        })
    }

    fn put_part(&self, upload_id: &str, part: PartRecord) -> BoxFut<'_, ()> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            if !inner.uploads.contains_key(&upload_id) {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            let mut line = LogLine::record("part", &part)?;
            line.upload_id = Some(upload_id.clone());
            self.append(PARTS_FILE, &line)?;
            inner.parts.insert((upload_id, part.part_number), part);
            Ok(())
        })
    }

    fn list_parts(&self, upload_id: &str, query: ListPartsQuery) -> BoxFut<'_, ListPartsResult> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let candidates: Vec<PartRecord> = {
                let inner = self.inner.read().expect("metadata lock poisoned");
                inner
                    .parts
                    .iter()
                    .filter(|((uid, _), _)| *uid == upload_id)
                    .map(|(_, p)| p.clone())
                    .collect()
            };
            Ok(list::paginate_parts(candidates, &query))
        })
    }

    fn get_parts_for_completion(
        &self,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> BoxFut<'_, Vec<PartRecord>> {
        let upload_id = upload_id.to_string();
        let part_numbers = part_numbers.to_vec();
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            let mut parts: Vec<PartRecord> = inner
                .parts
                .iter()
                .filter(|((uid, pn), _)| {
                    *uid == upload_id && (part_numbers.is_empty() || part_numbers.contains(pn))
                })
                .map(|(_, p)| p.clone())
                .collect();
            parts.sort_by_key(|p| p.part_number);
            Ok(parts)
        })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        final_object: ObjectRecord,
    ) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            let matches = inner
                .uploads
                .get(&upload_id)
                .map_or(false, |u| u.bucket == bucket && u.key == key);
            if !matches {
                return Err(StoreError::NoSuchUpload { upload_id });
            }

            // Object line first, upload tombstone second: replay of a
            // torn log keeps the final object and at worst leaves an
            // upload row for the reaper.
            let final_object = final_object.normalized();
            self.append(OBJECTS_FILE, &LogLine::record("object", &final_object)?)?;
            let mut tombstone = LogLine::tombstone("upload");
            tombstone.upload_id = Some(upload_id.clone());
            self.append(UPLOADS_FILE, &tombstone)?;

            inner.objects.insert(
                (final_object.bucket.clone(), final_object.key.clone()),
                final_object,
            );
            inner.parts.retain(|(uid, _), _| *uid != upload_id);
            inner.uploads.remove(&upload_id);
            Ok(())
        })
    }

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            let matches = inner
                .uploads
                .get(&upload_id)
                .map_or(false, |u| u.bucket == bucket && u.key == key);
            if !matches {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            let mut tombstone = LogLine::tombstone("upload");
            tombstone.upload_id = Some(upload_id.clone());
            self.append(UPLOADS_FILE, &tombstone)?;
            inner.parts.retain(|(uid, _), _| *uid != upload_id);
            inner.uploads.remove(&upload_id);
            Ok(())
        })
    }

    fn list_multipart_uploads(
        &self,
        bucket: &str,
        query: ListUploadsQuery,
    ) -> BoxFut<'_, ListUploadsResult> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let candidates: Vec<MultipartUploadRecord> = {
                let inner = self.inner.read().expect("metadata lock poisoned");
                inner
                    .uploads
                    .values()
                    .filter(|u| {
                        u.bucket == bucket
                            && u.key.starts_with(&query.prefix)
                            && list::upload_after_marker(
                                &u.key,
                                &u.upload_id,
                                &query.key_marker,
                                &query.upload_id_marker,
                            )
                    })
                    .cloned()
                    .collect()
            };
            Ok(list::paginate_uploads(candidates, &query))
        })
    }

    fn count_uploads(&self, bucket: &str) -> BoxFut<'_, u64> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            Ok(inner.uploads.values().filter(|u| u.bucket == bucket).count() as u64)
        })
    }

    fn reap_expired_uploads(&self, ttl_seconds: i64) -> BoxFut<'_, Vec<ExpiredUpload>> {
        Box::pin(async move {
            let cutoff = iso8601_to_epoch_secs(&now_iso8601()) - ttl_seconds;
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            let expired: Vec<ExpiredUpload> = inner
                .uploads
                .values()
                .filter(|u| iso8601_to_epoch_secs(&u.initiated_at) < cutoff)
                .map(|u| ExpiredUpload {
                    upload_id: u.upload_id.clone(),
                    bucket: u.bucket.clone(),
                    key: u.key.clone(),
                })
                .collect();
            for upload in &expired {
                let mut tombstone = LogLine::tombstone("upload");
                tombstone.upload_id = Some(upload.upload_id.clone());
                self.append(UPLOADS_FILE, &tombstone)?;
                inner.parts.retain(|(uid, _), _| *uid != upload.upload_id);
                inner.uploads.remove(&upload.upload_id);
            }
            Ok(expired)
        })
    }

    fn get_credential(&self, access_key_id: &str) -> BoxFut<'_, Option<CredentialRecord>> {
        let access_key_id = access_key_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            Ok(inner
                .credentials
                .get(&access_key_id)
                .filter(|c| c.active)
                .cloned())
        })
    }

    fn put_credential(&self, record: CredentialRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.write().expect("metadata lock poisoned");
            self.append(CREDENTIALS_FILE, &LogLine::record("credential", &record)?)?;
            inner
                .credentials
                .insert(record.access_key_id.clone(), record);
            Ok(())
        })
    }

    fn dump_buckets(&self) -> BoxFut<'_, Vec<BucketRecord>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            let mut buckets: Vec<BucketRecord> = inner.buckets.values().cloned().collect();
            buckets.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(buckets)
        })
    }

    fn dump_objects(&self) -> BoxFut<'_, Vec<ObjectRecord>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            let mut objects: Vec<ObjectRecord> = inner.objects.values().cloned().collect();
            objects.sort_by(|a, b| (&a.bucket, &a.key).cmp(&(&b.bucket, &b.key)));
            Ok(objects)
        })
    }

    fn dump_uploads(&self) -> BoxFut<'_, Vec<MultipartUploadRecord>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            let mut uploads: Vec<MultipartUploadRecord> = inner.uploads.values().cloned().collect();
            uploads.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
            Ok(uploads)
        })
    }

    fn dump_parts(&self) -> BoxFut<'_, Vec<(String, PartRecord)>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            let mut parts: Vec<(String, PartRecord)> = inner
                .parts
                .iter()
                .map(|((uid, _), p)| (uid.clone(), p.clone()))
                .collect();
            parts.sort_by(|a, b| (&a.0, a.1.part_number).cmp(&(&b.0, b.1.part_number)));
            Ok(parts)
        })
    }

    fn dump_credentials(&self) -> BoxFut<'_, Vec<CredentialRecord>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("metadata lock poisoned");
            let mut credentials: Vec<CredentialRecord> =
                inner.credentials.values().cloned().collect();
            credentials.sort_by(|a, b| a.access_key_id.cmp(&b.access_key_id));
            Ok(credentials)
        })
    }

    fn health_check(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            if !self.root_dir.is_dir() {
                return Err(StoreError::Internal(anyhow::anyhow!(
                    "metadata root directory missing: {}",
                    self.root_dir.display()
                )));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::test_fixtures::{make_bucket, make_object, make_upload};
    use tempfile::TempDir;

    fn test_store() -> (JsonlMetadataStore, TempDir) {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = JsonlMetadataStore::open(tmp.path(), false).expect("failed to open store");
        (store, tmp)
    }

    fn reopen(tmp: &TempDir) -> JsonlMetadataStore {
        JsonlMetadataStore::open(tmp.path(), false).expect("failed to reopen store")
    }

    #[tokio::test]
    async fn test_bucket_roundtrip_and_persistence() {
        let (store, tmp) = test_store();
        store.create_bucket(make_bucket("persist")).await.unwrap();
        drop(store);

        let store = reopen(&tmp);
        let bucket = store.get_bucket("persist").await.unwrap().unwrap();
        assert_eq!(bucket.region, "us-east-1");
    }

    #[tokio::test]
    async fn test_envelope_shape_on_disk() {
        let (store, tmp) = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store
            .put_object(make_object("b", "hello.txt", 5))
            .await
            .unwrap();

        let content = std::fs::read_to_string(tmp.path().join("objects.jsonl")).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["type"], "object");
        assert_eq!(line["_deleted"], false);
        assert_eq!(line["data"]["bucket"], "b");
        assert_eq!(line["data"]["key"], "hello.txt");
    }

    #[tokio::test]
    async fn test_tombstone_wins_after_replay() {
        let (store, tmp) = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store.put_object(make_object("b", "gone", 1)).await.unwrap();
        store.delete_object("b", "gone").await.unwrap();
        drop(store);

        // The log still contains both lines; replay must apply the
        // tombstone last.
        let content = std::fs::read_to_string(tmp.path().join("objects.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"_deleted\":true"));

        let store = reopen(&tmp);
        assert!(store.get_object("b", "gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_latest_wins() {
        let (store, tmp) = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store.put_object(make_object("b", "k", 1)).await.unwrap();
        store.put_object(make_object("b", "k", 99)).await.unwrap();
        drop(store);

        let store = reopen(&tmp);
        assert_eq!(store.get_object("b", "k").await.unwrap().unwrap().size, 99);
    }

    #[tokio::test]
    async fn test_compaction_drops_tombstones() {
        let (store, tmp) = test_store();
        store.create_bucket(make_bucket("keep")).await.unwrap();
        store.create_bucket(make_bucket("remove")).await.unwrap();
        store.delete_bucket("remove").await.unwrap();

        store.compact_all().unwrap();

        let content = std::fs::read_to_string(tmp.path().join("buckets.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(!content.contains("\"_deleted\":true"));
        assert!(content.contains("keep"));

        let store = reopen(&tmp);
        assert!(store.get_bucket("keep").await.unwrap().is_some());
        assert!(store.get_bucket("remove").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compact_on_open() {
        let (store, tmp) = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store.put_object(make_object("b", "k", 1)).await.unwrap();
        store.delete_object("b", "k").await.unwrap();
        drop(store);

        let _store = JsonlMetadataStore::open(tmp.path(), true).unwrap();
        let content = std::fs::read_to_string(tmp.path().join("objects.jsonl")).unwrap();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn test_torn_final_line_is_skipped() {
        let (store, tmp) = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store.put_object(make_object("b", "ok", 1)).await.unwrap();
        drop(store);

        // Simulate a crash mid-append: truncated JSON on the last line.
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(tmp.path().join("objects.jsonl"))
            .unwrap();
        file.write_all(b"{\"type\":\"object\",\"data\":{\"buck").unwrap();
        drop(file);

        let store = reopen(&tmp);
        assert!(store.get_object("b", "ok").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_multipart_complete_replays_consistently() {
        let (store, tmp) = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        let upload_id = store
            .create_multipart_upload(make_upload("b", "big.bin", ""))
            .await
            .unwrap();
        store
            .put_part(
                &upload_id,
                PartRecord {
                    part_number: 1,
                    size: 10,
                    etag: "\"p1\"".to_string(),
                    last_modified: now_iso8601(),
                },
            )
            .await
            .unwrap();
        store
            .complete_multipart_upload("b", "big.bin", &upload_id, make_object("b", "big.bin", 10))
            .await
            .unwrap();
        drop(store);

        let store = reopen(&tmp);
        assert!(store.get_object("b", "big.bin").await.unwrap().is_some());
        assert!(store
            .get_multipart_upload("b", "big.bin", &upload_id)
            .await
            .unwrap()
            .is_none());
        // Part rows die with their upload on replay.
        let parts = store
            .list_parts(&upload_id, ListPartsQuery::default())
            .await
            .unwrap();
        assert!(parts.parts.is_empty());
    }

    #[tokio::test]
    async fn test_pagination_against_jsonl() {
        let (store, _tmp) = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        for i in 0..5 {
            store
                .put_object(make_object("b", &format!("key{i}"), 1))
                .await
                .unwrap();
        }

        let mut token: Option<String> = None;
        let mut pages = Vec::new();
        loop {
            let result = store
                .list_objects(
                    "b",
                    ListObjectsQuery {
                        max_keys: 2,
                        continuation_token: token.clone(),
                        ..ListObjectsQuery::default()
                    },
                )
                .await
                .unwrap();
            pages.push(
                result
                    .objects
                    .iter()
                    .map(|o| o.key.clone())
                    .collect::<Vec<_>>(),
            );
            if !result.is_truncated {
                break;
            }
            token = result.next_continuation_token;
        }
        assert_eq!(
            pages,
            vec![
                vec!["key0".to_string(), "key1".to_string()],
                vec!["key2".to_string(), "key3".to_string()],
                vec!["key4".to_string()],
            ]
        );
    }
}
