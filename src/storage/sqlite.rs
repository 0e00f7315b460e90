//! SQLite blob storage backend.
//!
//! Objects and multipart parts are stored as BLOBs in two tables inside
//! a single database file, for embedded deployments where everything
//! should live in one file:
//!
//! ```sql
//! object_data(bucket, key PRIMARY KEY, data BLOB, etag, last_modified)
//! part_data(upload_id, part_number PRIMARY KEY, data BLOB, etag)
//! ```
//!
//! WAL journaling makes the commit point the transaction commit;
//! `INSERT OR REPLACE` provides upsert semantics.  The connection sits
//! behind a `Mutex` so the backend is `Send + Sync`.

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use super::backend::{AssembledObject, ObjectStat, PartSource, StorageBackend};
use crate::errors::{StoreError, StoreResult};
use crate::types::{composite_etag, md5_digest, now_iso8601, quoted_md5, BoxFut, ByteRange};

/// Storage backend keeping all bytes in a SQLite database.
pub struct SqliteBlobBackend {
    conn: Mutex<Connection>,
}

impl SqliteBlobBackend {
    /// Open (or create) the database at `path` and initialise the blob
    /// tables. `":memory:"` works for tests.
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS object_data (
                bucket        TEXT NOT NULL,
                key           TEXT NOT NULL,
                data          BLOB NOT NULL,
                etag          TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                PRIMARY KEY (bucket, key)
            );

            CREATE TABLE IF NOT EXISTS part_data (
                upload_id   TEXT NOT NULL,
                part_number INTEGER NOT NULL,
                data        BLOB NOT NULL,
                etag        TEXT NOT NULL,
                PRIMARY KEY (upload_id, part_number)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite mutex poisoned")
    }
}

impl StorageBackend for SqliteBlobBackend {
    fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BoxFut<'_, String> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let etag = quoted_md5(&data);
            let conn = self.lock();
            conn.execute(
                "INSERT OR REPLACE INTO object_data (bucket, key, data, etag, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![bucket, key, data.as_ref(), etag, now_iso8601()],
            )?;
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
            let conn = self.lock();
            let data: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT data FROM object_data WHERE bucket = ?1 AND key = ?2",
                    params![bucket, key],
                    |row| row.get(0),
                )
                .optional()?;
            let data = data.ok_or(StoreError::NoSuchKey { bucket, key })?;
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
            let conn = self.lock();
            let row: Option<(i64, String, String)> = conn
                .query_row(
                    "SELECT length(data), etag, last_modified
                     FROM object_data WHERE bucket = ?1 AND key = ?2",
                    params![bucket, key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let (size, etag, last_modified) =
                row.ok_or(StoreError::NoSuchKey { bucket, key })?;
            Ok(ObjectStat {
                size: size as u64,
                etag,
                last_modified,
            })
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM object_data WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
            )?;
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
            let conn = self.lock();
            let row: Option<(Vec<u8>, String)> = conn
                .query_row(
                    "SELECT data, etag FROM object_data WHERE bucket = ?1 AND key = ?2",
                    params![src_bucket, src_key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (data, etag) = row.ok_or(StoreError::NoSuchKey {
                bucket: src_bucket,
                key: src_key,
            })?;
            conn.execute(
                "INSERT OR REPLACE INTO object_data (bucket, key, data, etag, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![dst_bucket, dst_key, data, etag, now_iso8601()],
            )?;
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
            let etag = quoted_md5(&data);
            let conn = self.lock();
            conn.execute(
                "INSERT OR REPLACE INTO part_data (upload_id, part_number, data, etag)
                 VALUES (?1, ?2, ?3, ?4)",
                params![upload_id, part_number as i64, data.as_ref(), etag],
            )?;
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
            let conn = self.lock();
            let tx = conn.unchecked_transaction()?;

            let mut assembled: Vec<u8> = Vec::new();
            let mut part_digests: Vec<[u8; 16]> = Vec::with_capacity(parts.len());
            for part in &parts {
                let data: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT data FROM part_data
                         WHERE upload_id = ?1 AND part_number = ?2",
                        params![upload_id, part.part_number as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                let data = data.ok_or_else(|| StoreError::InvalidPart {
                    message: format!(
                        "Part {} of upload {} is not available",
                        part.part_number, upload_id
                    ),
                })?;
                part_digests.push(md5_digest(&data));
                assembled.extend_from_slice(&data);
            }

            let total_size = assembled.len() as u64;
            let etag = composite_etag(&part_digests);
            tx.execute(
                "INSERT OR REPLACE INTO object_data (bucket, key, data, etag, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![bucket, key, assembled, etag, now_iso8601()],
            )?;
            tx.commit()?;

            Ok(AssembledObject { etag, total_size })
        })
    }

    fn delete_parts(&self, _bucket: &str, upload_id: &str) -> BoxFut<'_, ()> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM part_data WHERE upload_id = ?1",
                params![upload_id],
            )?;
            Ok(())
        })
    }

    fn create_bucket(&self, _bucket: &str) -> BoxFut<'_, ()> {
        // Buckets are just a key-space dimension here.
        Box::pin(async move { Ok(()) })
    }

    fn delete_bucket(&self, bucket: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM object_data WHERE bucket = ?1",
                params![bucket],
            )?;
            Ok(())
        })
    }

    fn sweep_expired_parts(&self, live_upload_ids: &[String]) -> BoxFut<'_, ()> {
        let live = live_upload_ids.to_vec();
        Box::pin(async move {
            let conn = self.lock();
            let upload_ids: Vec<String> = {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT upload_id FROM part_data")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            for upload_id in upload_ids {
                if !live.contains(&upload_id) {
                    conn.execute(
                        "DELETE FROM part_data WHERE upload_id = ?1",
                        params![upload_id],
                    )?;
                }
            }
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let conn = self.lock();
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> SqliteBlobBackend {
        SqliteBlobBackend::open(":memory:").expect("failed to open in-memory backend")
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let backend = test_backend();
        let etag = backend
            .put_object("b", "hello.txt", Bytes::from("hello"))
            .await
            .unwrap();
        assert_eq!(etag, "\"5d41402abc4b2a76b9719d911017c592\"");
        assert_eq!(
            backend.get_object("b", "hello.txt", None).await.unwrap(),
            Bytes::from("hello")
        );

        let stat = backend.head_object("b", "hello.txt").await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.etag, etag);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let backend = test_backend();
        backend
            .put_object("b", "k", Bytes::from("v1"))
            .await
            .unwrap();
        backend
            .put_object("b", "k", Bytes::from("v2"))
            .await
            .unwrap();
        assert_eq!(
            backend.get_object("b", "k", None).await.unwrap(),
            Bytes::from("v2")
        );
    }

    #[tokio::test]
    async fn test_range() {
        let backend = test_backend();
        backend
            .put_object("b", "k", Bytes::from("abcdef"))
            .await
            .unwrap();
        let slice = backend
            .get_object(
                "b",
                "k",
                Some(ByteRange {
                    start: None,
                    end: Some(2),
                }),
            )
            .await
            .unwrap();
        assert_eq!(slice, Bytes::from("ef"));
    }

    #[tokio::test]
    async fn test_assemble_in_part_order() {
        let backend = test_backend();
        backend
            .put_part("b", "up", 2, Bytes::from("world"))
            .await
            .unwrap();
        backend
            .put_part("b", "up", 1, Bytes::from("hello "))
            .await
            .unwrap();

        let assembled = backend
            .assemble_parts(
                "b",
                "joined",
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
        assert_eq!(assembled.total_size, 11);
        assert_eq!(
            backend.get_object("b", "joined", None).await.unwrap(),
            Bytes::from("hello world")
        );
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_uploads() {
        let backend = test_backend();
        backend
            .put_part("b", "live", 1, Bytes::from("keep"))
            .await
            .unwrap();
        backend
            .put_part("b", "dead", 1, Bytes::from("drop"))
            .await
            .unwrap();

        backend
            .sweep_expired_parts(&["live".to_string()])
            .await
            .unwrap();

        assert!(backend
            .assemble_parts(
                "b",
                "ok",
                "live",
                &[PartSource {
                    part_number: 1,
                    etag: String::new()
                }]
            )
            .await
            .is_ok());
        assert!(backend
            .assemble_parts(
                "b",
                "gone",
                "dead",
                &[PartSource {
                    part_number: 1,
                    etag: String::new()
                }]
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_bucket_drops_objects() {
        let backend = test_backend();
        backend
            .put_object("b", "k1", Bytes::from("x"))
            .await
            .unwrap();
        backend
            .put_object("other", "k1", Bytes::from("y"))
            .await
            .unwrap();
        backend.delete_bucket("b").await.unwrap();
        assert!(backend.get_object("b", "k1", None).await.is_err());
        assert!(backend.get_object("other", "k1", None).await.is_ok());
    }
}
