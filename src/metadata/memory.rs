//! In-memory metadata store.
//!
//! All metadata lives in hash maps behind a single read-write lock; no
//! persistence.  Used for tests and ephemeral deployments, and as the
//! simplest reference implementation of the contract.

use std::collections::HashMap;
use std::sync::RwLock;

use super::list;
use super::store::{
    BatchDeleteOutcome, BucketRecord, CredentialRecord, ExpiredUpload, ListObjectsQuery,
    ListObjectsResult, ListPartsQuery, ListPartsResult, ListUploadsQuery, ListUploadsResult,
    MetadataStore, MultipartUploadRecord, ObjectRecord, PartRecord,
};
use crate::errors::StoreError;
use crate::types::{iso8601_to_epoch_secs, new_upload_id, now_iso8601, BoxFut};

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, BucketRecord>,
    objects: HashMap<(String, String), ObjectRecord>,
    uploads: HashMap<String, MultipartUploadRecord>,
    parts: HashMap<(String, u32), PartRecord>,
    credentials: HashMap<String, CredentialRecord>,
}

/// Metadata store holding everything in process memory.
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("metadata lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("metadata lock poisoned")
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn create_bucket(&self, record: BucketRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let mut inner = self.write();
            if inner.buckets.contains_key(&record.name) {
                return Err(StoreError::BucketAlreadyExists {
                    bucket: record.name,
                });
            }
            inner.buckets.insert(record.name.clone(), record);
            Ok(())
        })
    }

    fn get_bucket(&self, name: &str) -> BoxFut<'_, Option<BucketRecord>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.read().buckets.get(&name).cloned()) })
    }

    fn delete_bucket(&self, name: &str) -> BoxFut<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let mut inner = self.write();
            if !inner.buckets.contains_key(&name) {
                return Err(StoreError::NoSuchBucket { bucket: name });
            }
            let has_objects = inner.objects.keys().any(|(b, _)| *b == name);
            let has_uploads = inner.uploads.values().any(|u| u.bucket == name);
            if has_objects || has_uploads {
                return Err(StoreError::BucketNotEmpty { bucket: name });
            }
            inner.buckets.remove(&name);
            Ok(())
        })
    }

    fn list_buckets(&self, owner: Option<&str>) -> BoxFut<'_, Vec<BucketRecord>> {
        let owner = owner.map(|s| s.to_string());
        Box::pin(async move {
            let inner = self.read();
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
            let mut inner = self.write();
            match inner.buckets.get_mut(&name) {
                Some(bucket) => {
                    bucket.acl = acl;
                    Ok(())
                }
                None => Err(StoreError::NoSuchBucket { bucket: name }),
            }
        })
    }

    fn put_object(&self, record: ObjectRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let record = record.normalized();
            let mut inner = self.write();
            if !inner.buckets.contains_key(&record.bucket) {
                return Err(StoreError::NoSuchBucket {
                    bucket: record.bucket,
                });
            }
            let key = (record.bucket.clone(), record.key.clone());
            inner.objects.insert(key, record);
            Ok(())
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> BoxFut<'_, Option<ObjectRecord>> {
        let lookup = (bucket.to_string(), key.to_string());
        Box::pin(async move { Ok(self.read().objects.get(&lookup).cloned()) })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let lookup = (bucket.to_string(), key.to_string());
        Box::pin(async move {
            self.write().objects.remove(&lookup);
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
            let mut inner = self.write();
            let mut outcome = BatchDeleteOutcome::default();
            for key in keys {
                inner.objects.remove(&(bucket.clone(), key.clone()));
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
            let mut inner = self.write();
            match inner.objects.get_mut(&(bucket.clone(), key.clone())) {
                Some(obj) => {
                    obj.acl = acl;
                    Ok(())
                }
                None => Err(StoreError::NoSuchKey { bucket, key }),
            }
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
                let inner = self.read();
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
            Ok(self.read().objects.keys().filter(|(b, _)| *b == bucket).count() as u64)
        })
    }

    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> BoxFut<'_, String> {
        Box::pin(async move {
            let mut record = record;
            if record.upload_id.is_empty() {
                record.upload_id = new_upload_id();
            }
            let upload_id = record.upload_id.clone();
            self.write().uploads.insert(upload_id.clone(), record);
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
            Ok(self
                .read()
                .uploads
                .get(&upload_id)
                .filter(|u| u.bucket == bucket && u.key == key)
                .cloned())
        })
    }

    fn put_part(&self, upload_id: &str, part: PartRecord) -> BoxFut<'_, ()> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut inner = self.write();
            if !inner.uploads.contains_key(&upload_id) {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            inner.parts.insert((upload_id, part.part_number), part);
            Ok(())
        })
    }

    fn list_parts(&self, upload_id: &str, query: ListPartsQuery) -> BoxFut<'_, ListPartsResult> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let candidates: Vec<PartRecord> = {
                let inner = self.read();
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
            let inner = self.read();
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
            let mut inner = self.write();
            let matches = inner
                .uploads
                .get(&upload_id)
                .map_or(false, |u| u.bucket == bucket && u.key == key);
            if !matches {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            let final_object = final_object.normalized();
            let object_key = (final_object.bucket.clone(), final_object.key.clone());
            inner.objects.insert(object_key, final_object);
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
            let mut inner = self.write();
            let matches = inner
                .uploads
                .get(&upload_id)
                .map_or(false, |u| u.bucket == bucket && u.key == key);
            if !matches {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
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
                let inner = self.read();
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
            Ok(self.read().uploads.values().filter(|u| u.bucket == bucket).count() as u64)
        })
    }

    fn reap_expired_uploads(&self, ttl_seconds: i64) -> BoxFut<'_, Vec<ExpiredUpload>> {
        Box::pin(async move {
            let cutoff = iso8601_to_epoch_secs(&now_iso8601()) - ttl_seconds;
            let mut inner = self.write();
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
                inner.parts.retain(|(uid, _), _| *uid != upload.upload_id);
                inner.uploads.remove(&upload.upload_id);
            }
            Ok(expired)
        })
    }

    fn get_credential(&self, access_key_id: &str) -> BoxFut<'_, Option<CredentialRecord>> {
        let access_key_id = access_key_id.to_string();
        Box::pin(async move {
            Ok(self
                .read()
                .credentials
                .get(&access_key_id)
                .filter(|c| c.active)
                .cloned())
        })
    }

    fn put_credential(&self, record: CredentialRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            self.write()
                .credentials
                .insert(record.access_key_id.clone(), record);
            Ok(())
        })
    }

    fn dump_buckets(&self) -> BoxFut<'_, Vec<BucketRecord>> {
        Box::pin(async move {
            let mut buckets: Vec<BucketRecord> = self.read().buckets.values().cloned().collect();
            buckets.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(buckets)
        })
    }

    fn dump_objects(&self) -> BoxFut<'_, Vec<ObjectRecord>> {
        Box::pin(async move {
            let mut objects: Vec<ObjectRecord> = self.read().objects.values().cloned().collect();
            objects.sort_by(|a, b| (&a.bucket, &a.key).cmp(&(&b.bucket, &b.key)));
            Ok(objects)
        })
    }

    fn dump_uploads(&self) -> BoxFut<'_, Vec<MultipartUploadRecord>> {
        Box::pin(async move {
            let mut uploads: Vec<MultipartUploadRecord> =
                self.read().uploads.values().cloned().collect();
            uploads.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
            Ok(uploads)
        })
    }

    fn dump_parts(&self) -> BoxFut<'_, Vec<(String, PartRecord)>> {
        Box::pin(async move {
            let mut parts: Vec<(String, PartRecord)> = self
                .read()
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
            let mut credentials: Vec<CredentialRecord> =
                self.read().credentials.values().cloned().collect();
            credentials.sort_by(|a, b| a.access_key_id.cmp(&b.access_key_id));
            Ok(credentials)
        })
    }

    fn health_check(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            drop(self.read());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::test_fixtures::{make_bucket, make_object, make_upload};

    #[tokio::test]
    async fn test_create_and_get_bucket() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("my-bucket")).await.unwrap();

        let bucket = store.get_bucket("my-bucket").await.unwrap().unwrap();
        assert_eq!(bucket.name, "my-bucket");
        assert_eq!(bucket.region, "us-east-1");
    }

    #[tokio::test]
    async fn test_create_bucket_duplicate() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("dup")).await.unwrap();
        let err = store.create_bucket(make_bucket("dup")).await.unwrap_err();
        assert_eq!(err.code(), "BucketAlreadyExists");
    }

    #[tokio::test]
    async fn test_delete_bucket_not_empty() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("full")).await.unwrap();
        store
            .put_object(make_object("full", "obj.txt", 3))
            .await
            .unwrap();

        let err = store.delete_bucket("full").await.unwrap_err();
        assert_eq!(err.code(), "BucketNotEmpty");

        store.delete_object("full", "obj.txt").await.unwrap();
        store.delete_bucket("full").await.unwrap();
        assert!(store.get_bucket("full").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_bucket_blocked_by_upload() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("busy")).await.unwrap();
        store
            .create_multipart_upload(make_upload("busy", "big.bin", "u-1"))
            .await
            .unwrap();

        let err = store.delete_bucket("busy").await.unwrap_err();
        assert_eq!(err.code(), "BucketNotEmpty");
    }

    #[tokio::test]
    async fn test_list_buckets_owner_filter() {
        let store = MemoryMetadataStore::new();
        let mut b1 = make_bucket("alpha");
        b1.owner_id = "alice".to_string();
        let mut b2 = make_bucket("beta");
        b2.owner_id = "bob".to_string();
        store.create_bucket(b1).await.unwrap();
        store.create_bucket(b2).await.unwrap();

        let all = store.list_buckets(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let alices = store.list_buckets(Some("alice")).await.unwrap();
        assert_eq!(alices.len(), 1);
        assert_eq!(alices[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_put_object_requires_bucket() {
        let store = MemoryMetadataStore::new();
        let err = store
            .put_object(make_object("ghost", "k", 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchBucket");
    }

    #[tokio::test]
    async fn test_put_object_fills_defaults() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("b")).await.unwrap();
        let mut record = make_object("b", "k", 1);
        record.content_type = String::new();
        record.storage_class = String::new();
        record.acl = String::new();
        store.put_object(record).await.unwrap();

        let fetched = store.get_object("b", "k").await.unwrap().unwrap();
        assert_eq!(fetched.content_type, "application/octet-stream");
        assert_eq!(fetched.storage_class, "STANDARD");
        assert_eq!(fetched.acl, "{}");
    }

    #[tokio::test]
    async fn test_delete_object_idempotent() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store.delete_object("b", "never-existed").await.unwrap();
        store.delete_object("b", "never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_delete_preserves_order() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("b")).await.unwrap();
        for key in ["k1", "k2", "k3"] {
            store.put_object(make_object("b", key, 1)).await.unwrap();
        }

        let keys = vec!["k3".to_string(), "missing".to_string(), "k1".to_string()];
        let outcome = store.delete_objects_meta("b", &keys).await.unwrap();
        assert_eq!(outcome.deleted, keys);
        assert!(outcome.errors.is_empty());
        assert!(store.get_object("b", "k3").await.unwrap().is_none());
        assert!(store.get_object("b", "k2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("b")).await.unwrap();

        let mut record = make_upload("b", "big.bin", "");
        record.upload_id = String::new();
        let upload_id = store.create_multipart_upload(record).await.unwrap();
        assert_eq!(upload_id.len(), 32);

        // Wrong key acts as an access check and returns None.
        assert!(store
            .get_multipart_upload("b", "other.bin", &upload_id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_multipart_upload("b", "big.bin", &upload_id)
            .await
            .unwrap()
            .is_some());

        for n in 1..=3u32 {
            store
                .put_part(
                    &upload_id,
                    PartRecord {
                        part_number: n,
                        size: 100,
                        etag: format!("\"etag-{n}\""),
                        last_modified: now_iso8601(),
                    },
                )
                .await
                .unwrap();
        }

        let listed = store
            .list_parts(&upload_id, ListPartsQuery::default())
            .await
            .unwrap();
        assert_eq!(listed.parts.len(), 3);

        let subset = store
            .get_parts_for_completion(&upload_id, &[1, 3])
            .await
            .unwrap();
        assert_eq!(subset.len(), 2);
        assert_eq!(subset[0].part_number, 1);
        assert_eq!(subset[1].part_number, 3);

        store
            .complete_multipart_upload("b", "big.bin", &upload_id, make_object("b", "big.bin", 300))
            .await
            .unwrap();

        assert!(store
            .get_multipart_upload("b", "big.bin", &upload_id)
            .await
            .unwrap()
            .is_none());
        let after = store
            .list_parts(&upload_id, ListPartsQuery::default())
            .await
            .unwrap();
        assert!(after.parts.is_empty());
        assert!(store.get_object("b", "big.bin").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_part_requires_upload() {
        let store = MemoryMetadataStore::new();
        let err = store
            .put_part(
                "missing-upload",
                PartRecord {
                    part_number: 1,
                    size: 1,
                    etag: "\"e\"".to_string(),
                    last_modified: now_iso8601(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchUpload");
    }

    #[tokio::test]
    async fn test_abort_missing_upload() {
        let store = MemoryMetadataStore::new();
        let err = store
            .abort_multipart_upload("b", "k", "nope")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchUpload");
    }

    #[tokio::test]
    async fn test_reap_expired_uploads() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("b")).await.unwrap();

        let mut stale = make_upload("b", "old.bin", "stale-upload");
        stale.initiated_at = "2020-01-01T00:00:00.000Z".to_string();
        store.create_multipart_upload(stale).await.unwrap();
        store
            .create_multipart_upload(make_upload("b", "new.bin", "fresh-upload"))
            .await
            .unwrap();

        let expired = store.reap_expired_uploads(3600).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].upload_id, "stale-upload");
        assert!(store
            .get_multipart_upload("b", "old.bin", "stale-upload")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_multipart_upload("b", "new.bin", "fresh-upload")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_inactive_credential_hidden() {
        let store = MemoryMetadataStore::new();
        store
            .put_credential(CredentialRecord {
                access_key_id: "ak".to_string(),
                secret_key: "sk".to_string(),
                owner_id: "o".to_string(),
                display_name: "o".to_string(),
                active: false,
                created_at: now_iso8601(),
            })
            .await
            .unwrap();
        assert!(store.get_credential("ak").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_objects_delimiter() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("b")).await.unwrap();
        for key in [
            "docs/readme.md",
            "photos/2024/a.jpg",
            "photos/2024/b.jpg",
            "photos/2025/a.jpg",
            "root.txt",
        ] {
            store.put_object(make_object("b", key, 1)).await.unwrap();
        }

        let result = store
            .list_objects(
                "b",
                ListObjectsQuery {
                    delimiter: "/".to_string(),
                    ..ListObjectsQuery::default()
                },
            )
            .await
            .unwrap();
        let keys: Vec<&str> = result.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["root.txt"]);
        assert_eq!(result.common_prefixes, vec!["docs/", "photos/"]);
    }
}
