//! In-memory storage backend.
//!
//! Objects and staged parts live in hash maps behind async read-write
//! locks.  No persistence; a restart loses everything, which is exactly
//! what tests and ephemeral deployments want.  An optional byte cap
//! rejects writes that would exceed the configured budget.

use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::backend::{AssembledObject, ObjectStat, PartSource, StorageBackend};
use crate::errors::{StoreError, StoreResult};
use crate::types::{composite_etag, md5_digest, now_iso8601, quoted_md5, BoxFut, ByteRange};

#[derive(Clone)]
struct StoredBlob {
    data: Bytes,
    etag: String,
    last_modified: String,
}

#[derive(Default)]
struct Inner {
    /// `(bucket, key)` -> blob.
    objects: HashMap<(String, String), StoredBlob>,
    /// `(upload_id, part_number)` -> blob.
    parts: HashMap<(String, u32), StoredBlob>,
    /// Total bytes across both maps.
    current_size: u64,
}

/// Storage backend holding all bytes in process memory.
pub struct MemoryStorageBackend {
    inner: RwLock<Inner>,
    /// Maximum stored bytes; 0 means unlimited.
    max_size_bytes: u64,
}

impl MemoryStorageBackend {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_size_bytes,
        }
    }

    fn check_budget(&self, current: u64, incoming: u64, replacing: u64) -> StoreResult<()> {
        if self.max_size_bytes > 0 && current - replacing + incoming > self.max_size_bytes {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "memory storage budget exceeded ({} bytes)",
                self.max_size_bytes
            )));
        }
        Ok(())
    }
}

impl Default for MemoryStorageBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

impl StorageBackend for MemoryStorageBackend {
    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BoxFut<'_, String> {
        let lookup = (bucket.to_string(), key.to_string());
        Box::pin(async move {
            let etag = quoted_md5(&data);
            let mut inner = self.inner.write().await;
            let replacing = inner
                .objects
                .get(&lookup)
                .map(|b| b.data.len() as u64)
                .unwrap_or(0);
            self.check_budget(inner.current_size, data.len() as u64, replacing)?;
            inner.current_size = inner.current_size - replacing + data.len() as u64;
            inner.objects.insert(
                lookup,
                StoredBlob {
                    data,
                    etag: etag.clone(),
                    last_modified: now_iso8601(),
                },
            );
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
            let inner = self.inner.read().await;
            let blob = inner
                .objects
                .get(&(bucket.clone(), key.clone()))
                .ok_or(StoreError::NoSuchKey { bucket, key })?;
            match range {
                Some(range) => {
                    let (first, last) = range.resolve(blob.data.len() as u64)?;
                    Ok(blob.data.slice(first as usize..=last as usize))
                }
                None => Ok(blob.data.clone()),
            }
        })
    }

    fn head_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ObjectStat> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            let blob = inner
                .objects
                .get(&(bucket.clone(), key.clone()))
                .ok_or(StoreError::NoSuchKey { bucket, key })?;
            Ok(ObjectStat {
                size: blob.data.len() as u64,
                etag: blob.etag.clone(),
                last_modified: blob.last_modified.clone(),
            })
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let lookup = (bucket.to_string(), key.to_string());
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            if let Some(blob) = inner.objects.remove(&lookup) {
                inner.current_size -= blob.data.len() as u64;
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
        let src = (src_bucket.to_string(), src_key.to_string());
        let dst = (dst_bucket.to_string(), dst_key.to_string());
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let blob = inner
                .objects
                .get(&src)
                .cloned()
                .ok_or(StoreError::NoSuchKey {
                    bucket: src.0.clone(),
                    key: src.1.clone(),
                })?;
            let replacing = inner
                .objects
                .get(&dst)
                .map(|b| b.data.len() as u64)
                .unwrap_or(0);
            self.check_budget(inner.current_size, blob.data.len() as u64, replacing)?;
            inner.current_size = inner.current_size - replacing + blob.data.len() as u64;
            let etag = blob.etag.clone();
            inner.objects.insert(
                dst,
                StoredBlob {
                    last_modified: now_iso8601(),
                    ..blob
                },
            );
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
        let lookup = (upload_id.to_string(), part_number);
        Box::pin(async move {
            let etag = quoted_md5(&data);
            let mut inner = self.inner.write().await;
            let replacing = inner
                .parts
                .get(&lookup)
                .map(|b| b.data.len() as u64)
                .unwrap_or(0);
            self.check_budget(inner.current_size, data.len() as u64, replacing)?;
            inner.current_size = inner.current_size - replacing + data.len() as u64;
            inner.parts.insert(
                lookup,
                StoredBlob {
                    data,
                    etag: etag.clone(),
                    last_modified: now_iso8601(),
                },
            );
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
        let lookup = (bucket.to_string(), key.to_string());
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let mut inner = self.inner.write().await;

            let mut assembled: Vec<u8> = Vec::new();
            let mut part_digests: Vec<[u8; 16]> = Vec::with_capacity(parts.len());
            for part in &parts {
                let blob = inner
                    .parts
                    .get(&(upload_id.clone(), part.part_number))
                    .ok_or_else(|| StoreError::InvalidPart {
                        message: format!(
                            "Part {} of upload {} is not available",
                            part.part_number, upload_id
                        ),
                    })?;
                part_digests.push(md5_digest(&blob.data));
                assembled.extend_from_slice(&blob.data);
            }

            let total_size = assembled.len() as u64;
            let etag = composite_etag(&part_digests);

            let replacing = inner
                .objects
                .get(&lookup)
                .map(|b| b.data.len() as u64)
                .unwrap_or(0);
            self.check_budget(inner.current_size, total_size, replacing)?;
            inner.current_size = inner.current_size - replacing + total_size;
            inner.objects.insert(
                lookup,
                StoredBlob {
                    data: Bytes::from(assembled),
                    etag: etag.clone(),
                    last_modified: now_iso8601(),
                },
            );

            Ok(AssembledObject { etag, total_size })
        })
    }

    fn delete_parts(&self, _bucket: &str, upload_id: &str) -> BoxFut<'_, ()> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let freed: u64 = inner
                .parts
                .iter()
                .filter(|((uid, _), _)| *uid == upload_id)
                .map(|(_, b)| b.data.len() as u64)
                .sum();
            inner.parts.retain(|(uid, _), _| *uid != upload_id);
            inner.current_size -= freed;
            Ok(())
        })
    }

    fn create_bucket(&self, _bucket: &str) -> BoxFut<'_, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn delete_bucket(&self, bucket: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let freed: u64 = inner
                .objects
                .iter()
                .filter(|((b, _), _)| *b == bucket)
                .map(|(_, blob)| blob.data.len() as u64)
                .sum();
            inner.objects.retain(|(b, _), _| *b != bucket);
            inner.current_size -= freed;
            Ok(())
        })
    }

    fn sweep_expired_parts(&self, live_upload_ids: &[String]) -> BoxFut<'_, ()> {
        let live = live_upload_ids.to_vec();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let freed: u64 = inner
                .parts
                .iter()
                .filter(|((uid, _), _)| !live.contains(uid))
                .map(|(_, b)| b.data.len() as u64)
                .sum();
            inner.parts.retain(|(uid, _), _| live.contains(uid));
            inner.current_size -= freed;
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let _ = self.inner.read().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_etag() {
        let backend = MemoryStorageBackend::default();
        let etag = backend
            .put_object("b", "hello.txt", Bytes::from("hello"))
            .await
            .unwrap();
        assert_eq!(etag, "\"5d41402abc4b2a76b9719d911017c592\"");
        let data = backend.get_object("b", "hello.txt", None).await.unwrap();
        assert_eq!(data, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_range_read() {
        let backend = MemoryStorageBackend::default();
        backend
            .put_object("b", "k", Bytes::from("0123456789"))
            .await
            .unwrap();
        let slice = backend
            .get_object(
                "b",
                "k",
                Some(ByteRange {
                    start: Some(3),
                    end: Some(5),
                }),
            )
            .await
            .unwrap();
        assert_eq!(slice, Bytes::from("345"));
    }

    #[tokio::test]
    async fn test_size_budget_enforced() {
        let backend = MemoryStorageBackend::new(10);
        backend
            .put_object("b", "small", Bytes::from("12345"))
            .await
            .unwrap();
        let err = backend
            .put_object("b", "big", Bytes::from("1234567890"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InternalError");

        // Replacing an existing blob frees its budget first.
        backend
            .put_object("b", "small", Bytes::from("1234567890"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_assemble_and_sweep() {
        let backend = MemoryStorageBackend::default();
        backend
            .put_part("b", "up", 1, Bytes::from("aa"))
            .await
            .unwrap();
        backend
            .put_part("b", "up", 2, Bytes::from("bb"))
            .await
            .unwrap();

        let assembled = backend
            .assemble_parts(
                "b",
                "k",
                "up",
                &[
                    PartSource {
                        part_number: 1,
                        etag: String::new(),
                    },
                    PartSource {
                        part_number: 2,
                        etag: String::new(),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(assembled.total_size, 4);
        assert!(assembled.etag.ends_with("-2\""));
        assert_eq!(
            backend.get_object("b", "k", None).await.unwrap(),
            Bytes::from("aabb")
        );

        backend.sweep_expired_parts(&[]).await.unwrap();
        let err = backend
            .assemble_parts(
                "b",
                "k2",
                "up",
                &[PartSource {
                    part_number: 1,
                    etag: String::new(),
                }],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidPart");
    }

    #[tokio::test]
    async fn test_delete_bucket_frees_budget() {
        let backend = MemoryStorageBackend::new(6);
        backend
            .put_object("b", "k1", Bytes::from("123"))
            .await
            .unwrap();
        backend
            .put_object("b", "k2", Bytes::from("456"))
            .await
            .unwrap();
        backend.delete_bucket("b").await.unwrap();
        backend
            .put_object("c", "k", Bytes::from("123456"))
            .await
            .unwrap();
    }
}
