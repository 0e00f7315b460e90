//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All trait methods are thin async wrappers
//! around synchronous rusqlite calls executed under a `Mutex`;
//! SQLite's WAL serializes writers while readers proceed.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;

use super::list;
use super::store::{
    BatchDeleteOutcome, BucketRecord, CredentialRecord, ExpiredUpload, ListObjectsQuery,
    ListObjectsResult, ListPartsQuery, ListPartsResult, ListUploadsQuery, ListUploadsResult,
    MetadataStore, MultipartUploadRecord, ObjectRecord, PartRecord,
};
use crate::errors::{StoreError, StoreResult};
use crate::types::{new_upload_id, now_iso8601, BoxFut};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

const OBJECT_COLUMNS: &str = "bucket, key, size, etag, content_type, content_encoding, \
     content_language, content_disposition, cache_control, expires, \
     storage_class, acl, user_metadata, last_modified, delete_marker";

const UPLOAD_COLUMNS: &str = "upload_id, bucket, key, content_type, content_encoding, \
     content_language, content_disposition, cache_control, expires, \
     storage_class, acl, user_metadata, owner_id, owner_display, initiated_at";

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the
    /// schema.  Passing `":memory:"` creates an in-memory database
    /// (useful for tests).  Opening is the recovery path too: WAL
    /// replay happens inside `Connection::open` and the schema DDL is
    /// `IF NOT EXISTS` throughout.
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_schema()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS buckets (
                name           TEXT PRIMARY KEY,
                region         TEXT NOT NULL DEFAULT 'us-east-1',
                owner_id       TEXT NOT NULL,
                owner_display  TEXT NOT NULL DEFAULT '',
                acl            TEXT NOT NULL DEFAULT '{}',
                created_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS objects (
                bucket              TEXT NOT NULL,
                key                 TEXT NOT NULL,
                size                INTEGER NOT NULL,
                etag                TEXT NOT NULL,
                content_type        TEXT NOT NULL DEFAULT 'application/octet-stream',
                content_encoding    TEXT,
                content_language    TEXT,
                content_disposition TEXT,
                cache_control       TEXT,
                expires             TEXT,
                storage_class       TEXT NOT NULL DEFAULT 'STANDARD',
                acl                 TEXT NOT NULL DEFAULT '{}',
                user_metadata       TEXT NOT NULL DEFAULT '{}',
                last_modified       TEXT NOT NULL,
                delete_marker       INTEGER NOT NULL DEFAULT 0,

                PRIMARY KEY (bucket, key),
                FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_objects_bucket
                ON objects(bucket);
            CREATE INDEX IF NOT EXISTS idx_objects_bucket_prefix
                ON objects(bucket, key);

            CREATE TABLE IF NOT EXISTS multipart_uploads (
                upload_id           TEXT PRIMARY KEY,
                bucket              TEXT NOT NULL,
                key                 TEXT NOT NULL,
                content_type        TEXT NOT NULL DEFAULT 'application/octet-stream',
                content_encoding    TEXT,
                content_language    TEXT,
                content_disposition TEXT,
                cache_control       TEXT,
                expires             TEXT,
                storage_class       TEXT NOT NULL DEFAULT 'STANDARD',
                acl                 TEXT NOT NULL DEFAULT '{}',
                user_metadata       TEXT NOT NULL DEFAULT '{}',
                owner_id            TEXT NOT NULL,
                owner_display       TEXT NOT NULL DEFAULT '',
                initiated_at        TEXT NOT NULL,

                FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_uploads_bucket
                ON multipart_uploads(bucket);
            CREATE INDEX IF NOT EXISTS idx_uploads_bucket_key
                ON multipart_uploads(bucket, key);

            CREATE TABLE IF NOT EXISTS multipart_parts (
                upload_id     TEXT NOT NULL,
                part_number   INTEGER NOT NULL,
                size          INTEGER NOT NULL,
                etag          TEXT NOT NULL,
                last_modified TEXT NOT NULL,

                PRIMARY KEY (upload_id, part_number),
                FOREIGN KEY (upload_id) REFERENCES multipart_uploads(upload_id)
                    ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS credentials (
                access_key_id TEXT PRIMARY KEY,
                secret_key    TEXT NOT NULL,
                owner_id      TEXT NOT NULL,
                display_name  TEXT NOT NULL DEFAULT '',
                active        INTEGER NOT NULL DEFAULT 1,
                created_at    TEXT NOT NULL
            );
            ",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now_iso8601()],
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite mutex poisoned")
    }
}

/// Escape `%`, `_`, and the escape character itself so a user-supplied
/// prefix can be used in a LIKE pattern.
fn like_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn serialize_user_metadata(meta: &HashMap<String, String>) -> String {
    serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string())
}

fn deserialize_user_metadata(json: &str) -> HashMap<String, String> {
    serde_json::from_str(json).unwrap_or_default()
}

fn map_bucket_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BucketRecord> {
    Ok(BucketRecord {
        name: row.get(0)?,
        region: row.get(1)?,
        owner_id: row.get(2)?,
        owner_display: row.get(3)?,
        acl: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_object_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let size: i64 = row.get(2)?;
    let user_metadata: String = row.get(12)?;
    let delete_marker: i64 = row.get(14)?;
    Ok(ObjectRecord {
        bucket: row.get(0)?,
        key: row.get(1)?,
        size: size as u64,
        etag: row.get(3)?,
        content_type: row.get(4)?,
        content_encoding: row.get(5)?,
        content_language: row.get(6)?,
        content_disposition: row.get(7)?,
        cache_control: row.get(8)?,
        expires: row.get(9)?,
        storage_class: row.get(10)?,
        acl: row.get(11)?,
        user_metadata: deserialize_user_metadata(&user_metadata),
        last_modified: row.get(13)?,
        delete_marker: delete_marker != 0,
    })
}

fn map_upload_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MultipartUploadRecord> {
    let user_metadata: String = row.get(11)?;
    Ok(MultipartUploadRecord {
        upload_id: row.get(0)?,
        bucket: row.get(1)?,
        key: row.get(2)?,
        content_type: row.get(3)?,
        content_encoding: row.get(4)?,
        content_language: row.get(5)?,
        content_disposition: row.get(6)?,
        cache_control: row.get(7)?,
        expires: row.get(8)?,
        storage_class: row.get(9)?,
        acl: row.get(10)?,
        user_metadata: deserialize_user_metadata(&user_metadata),
        owner_id: row.get(12)?,
        owner_display: row.get(13)?,
        initiated_at: row.get(14)?,
    })
}

fn map_part_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PartRecord> {
    let part_number: i64 = row.get(0)?;
    let size: i64 = row.get(1)?;
    Ok(PartRecord {
        part_number: part_number as u32,
        size: size as u64,
        etag: row.get(2)?,
        last_modified: row.get(3)?,
    })
}

fn map_credential_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRecord> {
    let active: i64 = row.get(4)?;
    Ok(CredentialRecord {
        access_key_id: row.get(0)?,
        secret_key: row.get(1)?,
        owner_id: row.get(2)?,
        display_name: row.get(3)?,
        active: active != 0,
        created_at: row.get(5)?,
    })
}

impl MetadataStore for SqliteMetadataStore {
    // ── Buckets ────────────────────────────────────────────────────

    fn create_bucket(&self, record: BucketRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let conn = self.lock();
            let tx = conn.unchecked_transaction()?;
            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM buckets WHERE name = ?1",
                    params![record.name],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(StoreError::BucketAlreadyExists {
                    bucket: record.name,
                });
            }
            tx.execute(
                "INSERT INTO buckets (name, region, owner_id, owner_display, acl, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.name,
                    record.region,
                    record.owner_id,
                    record.owner_display,
                    record.acl,
                    record.created_at,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn get_bucket(&self, name: &str) -> BoxFut<'_, Option<BucketRecord>> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let bucket = conn
                .query_row(
                    "SELECT name, region, owner_id, owner_display, acl, created_at
                     FROM buckets WHERE name = ?1",
                    params![name],
                    map_bucket_row,
                )
                .optional()?;
            Ok(bucket)
        })
    }

    fn delete_bucket(&self, name: &str) -> BoxFut<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let tx = conn.unchecked_transaction()?;
            let exists: bool = tx
                .query_row("SELECT 1 FROM buckets WHERE name = ?1", params![name], |_| {
                    Ok(())
                })
                .optional()?
                .is_some();
            if !exists {
                return Err(StoreError::NoSuchBucket { bucket: name });
            }
            let objects: i64 = tx.query_row(
                "SELECT COUNT(*) FROM objects WHERE bucket = ?1",
                params![name],
                |row| row.get(0),
            )?;
            let uploads: i64 = tx.query_row(
                "SELECT COUNT(*) FROM multipart_uploads WHERE bucket = ?1",
                params![name],
                |row| row.get(0),
            )?;
            if objects > 0 || uploads > 0 {
                return Err(StoreError::BucketNotEmpty { bucket: name });
            }
            tx.execute("DELETE FROM buckets WHERE name = ?1", params![name])?;
            tx.commit()?;
            Ok(())
        })
    }

    fn list_buckets(&self, owner: Option<&str>) -> BoxFut<'_, Vec<BucketRecord>> {
        let owner = owner.map(|s| s.to_string());
        Box::pin(async move {
            let conn = self.lock();
            let mut buckets = Vec::new();
            match owner {
                Some(owner_id) => {
                    let mut stmt = conn.prepare(
                        "SELECT name, region, owner_id, owner_display, acl, created_at
                         FROM buckets WHERE owner_id = ?1 ORDER BY name",
                    )?;
                    let rows = stmt.query_map(params![owner_id], map_bucket_row)?;
                    for row in rows {
                        buckets.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT name, region, owner_id, owner_display, acl, created_at
                         FROM buckets ORDER BY name",
                    )?;
                    let rows = stmt.query_map([], map_bucket_row)?;
                    for row in rows {
                        buckets.push(row?);
                    }
                }
            }
            Ok(buckets)
        })
    }

    fn update_bucket_acl(&self, name: &str, acl: &str) -> BoxFut<'_, ()> {
        let name = name.to_string();
        let acl = acl.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let changed = conn.execute(
                "UPDATE buckets SET acl = ?2 WHERE name = ?1",
                params![name, acl],
            )?;
            if changed == 0 {
                return Err(StoreError::NoSuchBucket { bucket: name });
            }
            Ok(())
        })
    }

    // ── Objects ────────────────────────────────────────────────────

    fn put_object(&self, record: ObjectRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let record = record.normalized();
            let conn = self.lock();
            let bucket_exists: bool = conn
                .query_row(
                    "SELECT 1 FROM buckets WHERE name = ?1",
                    params![record.bucket],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !bucket_exists {
                return Err(StoreError::NoSuchBucket {
                    bucket: record.bucket,
                });
            }
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO objects ({OBJECT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    record.bucket,
                    record.key,
                    record.size as i64,
                    record.etag,
                    record.content_type,
                    record.content_encoding,
                    record.content_language,
                    record.content_disposition,
                    record.cache_control,
                    record.expires,
                    record.storage_class,
                    record.acl,
                    serialize_user_metadata(&record.user_metadata),
                    record.last_modified,
                    record.delete_marker as i64,
                ],
            )?;
            Ok(())
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> BoxFut<'_, Option<ObjectRecord>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let object = conn
                .query_row(
                    &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = ?1 AND key = ?2"),
                    params![bucket, key],
                    map_object_row,
                )
                .optional()?;
            Ok(object)
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM objects WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
            )?;
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
            let conn = self.lock();
            let mut outcome = BatchDeleteOutcome::default();
            for key in keys {
                match conn.execute(
                    "DELETE FROM objects WHERE bucket = ?1 AND key = ?2",
                    params![bucket, key],
                ) {
                    Ok(_) => outcome.deleted.push(key),
                    Err(err) => outcome.errors.push(super::store::BatchDeleteError {
                        key,
                        code: "InternalError".to_string(),
                        message: err.to_string(),
                    }),
                }
            }
            Ok(outcome)
        })
    }

    fn update_object_acl(&self, bucket: &str, key: &str, acl: &str) -> BoxFut<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let acl = acl.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let changed = conn.execute(
                "UPDATE objects SET acl = ?3 WHERE bucket = ?1 AND key = ?2",
                params![bucket, key, acl],
            )?;
            if changed == 0 {
                return Err(StoreError::NoSuchKey { bucket, key });
            }
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
            let conn = self.lock();
            let start_key = query.start_key().to_string();
            let like_pattern = format!("{}%", like_escape(&query.prefix));

            let candidates: Vec<ObjectRecord> = if query.delimiter.is_empty() {
                // Fast path: without a delimiter every row is one list
                // entry, so max_keys+1 rows decide truncation.
                let mut stmt = conn.prepare(&format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects
                     WHERE bucket = ?1 AND key > ?2 AND key LIKE ?3 ESCAPE '\\'
                     ORDER BY key
                     LIMIT ?4"
                ))?;
                let rows = stmt.query_map(
                    params![bucket, start_key, like_pattern, query.max_keys as i64 + 1],
                    map_object_row,
                )?;
                rows.collect::<Result<_, _>>()?
            } else {
                // With a delimiter, many rows can collapse into one
                // common prefix, so the cut must happen after the
                // merge: fetch the whole filtered range.
                let mut stmt = conn.prepare(&format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects
                     WHERE bucket = ?1 AND key > ?2 AND key LIKE ?3 ESCAPE '\\'
                     ORDER BY key"
                ))?;
                let rows = stmt.query_map(params![bucket, start_key, like_pattern], map_object_row)?;
                rows.collect::<Result<_, _>>()?
            };

            Ok(list::paginate_objects(candidates, &query))
        })
    }

    fn count_objects(&self, bucket: &str) -> BoxFut<'_, u64> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM objects WHERE bucket = ?1",
                params![bucket],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // ── Multipart uploads ──────────────────────────────────────────

    fn create_multipart_upload(&self, record: MultipartUploadRecord) -> BoxFut<'_, String> {
        Box::pin(async move {
            let mut record = record;
            if record.upload_id.is_empty() {
                record.upload_id = new_upload_id();
            }
            let conn = self.lock();
            let bucket_exists: bool = conn
                .query_row(
                    "SELECT 1 FROM buckets WHERE name = ?1",
                    params![record.bucket],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !bucket_exists {
                return Err(StoreError::NoSuchBucket {
                    bucket: record.bucket,
                });
            }
            conn.execute(
                &format!(
                    "INSERT INTO multipart_uploads ({UPLOAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    record.upload_id,
                    record.bucket,
                    record.key,
                    record.content_type,
                    record.content_encoding,
                    record.content_language,
                    record.content_disposition,
                    record.cache_control,
                    record.expires,
                    record.storage_class,
                    record.acl,
                    serialize_user_metadata(&record.user_metadata),
                    record.owner_id,
                    record.owner_display,
                    record.initiated_at,
                ],
            )?;
            Ok(record.upload_id)
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
            let conn = self.lock();
            let upload = conn
                .query_row(
                    &format!(
                        "SELECT {UPLOAD_COLUMNS} FROM multipart_uploads
                         WHERE upload_id = ?1 AND bucket = ?2 AND key = ?3"
                    ),
                    params![upload_id, bucket, key],
                    map_upload_row,
                )
                .optional()?;
            Ok(upload)
        })
    }

    fn put_part(&self, upload_id: &str, part: PartRecord) -> BoxFut<'_, ()> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let upload_exists: bool = conn
                .query_row(
                    "SELECT 1 FROM multipart_uploads WHERE upload_id = ?1",
                    params![upload_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !upload_exists {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            conn.execute(
                "INSERT OR REPLACE INTO multipart_parts
                     (upload_id, part_number, size, etag, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    upload_id,
                    part.part_number as i64,
                    part.size as i64,
                    part.etag,
                    part.last_modified,
                ],
            )?;
            Ok(())
        })
    }

    fn list_parts(&self, upload_id: &str, query: ListPartsQuery) -> BoxFut<'_, ListPartsResult> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT part_number, size, etag, last_modified
                 FROM multipart_parts
                 WHERE upload_id = ?1 AND part_number > ?2
                 ORDER BY part_number
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![
                    upload_id,
                    query.part_number_marker as i64,
                    query.max_parts as i64 + 1
                ],
                map_part_row,
            )?;
            let candidates: Vec<PartRecord> = rows.collect::<Result<_, _>>()?;
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
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT part_number, size, etag, last_modified
                 FROM multipart_parts
                 WHERE upload_id = ?1
                 ORDER BY part_number",
            )?;
            let rows = stmt.query_map(params![upload_id], map_part_row)?;
            let mut parts: Vec<PartRecord> = rows.collect::<Result<_, _>>()?;
            if !part_numbers.is_empty() {
                parts.retain(|p| part_numbers.contains(&p.part_number));
            }
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
            let final_object = final_object.normalized();
            let conn = self.lock();
            let tx = conn.unchecked_transaction()?;

            let matches: bool = tx
                .query_row(
                    "SELECT 1 FROM multipart_uploads
                     WHERE upload_id = ?1 AND bucket = ?2 AND key = ?3",
                    params![upload_id, bucket, key],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !matches {
                return Err(StoreError::NoSuchUpload { upload_id });
            }

            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO objects ({OBJECT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    final_object.bucket,
                    final_object.key,
                    final_object.size as i64,
                    final_object.etag,
                    final_object.content_type,
                    final_object.content_encoding,
                    final_object.content_language,
                    final_object.content_disposition,
                    final_object.cache_control,
                    final_object.expires,
                    final_object.storage_class,
                    final_object.acl,
                    serialize_user_metadata(&final_object.user_metadata),
                    final_object.last_modified,
                    final_object.delete_marker as i64,
                ],
            )?;
            tx.execute(
                "DELETE FROM multipart_parts WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.execute(
                "DELETE FROM multipart_uploads WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.commit()?;
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
            let conn = self.lock();
            let tx = conn.unchecked_transaction()?;
            let matches: bool = tx
                .query_row(
                    "SELECT 1 FROM multipart_uploads
                     WHERE upload_id = ?1 AND bucket = ?2 AND key = ?3",
                    params![upload_id, bucket, key],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !matches {
                return Err(StoreError::NoSuchUpload { upload_id });
            }
            tx.execute(
                "DELETE FROM multipart_parts WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.execute(
                "DELETE FROM multipart_uploads WHERE upload_id = ?1",
                params![upload_id],
            )?;
            tx.commit()?;
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
            let conn = self.lock();
            let like_pattern = format!("{}%", like_escape(&query.prefix));
            // Marker predicate is (key, upload_id) tuple-greater-than,
            // expressed the SQL way.
            let mut stmt = conn.prepare(&format!(
                "SELECT {UPLOAD_COLUMNS} FROM multipart_uploads
                 WHERE bucket = ?1 AND key LIKE ?2 ESCAPE '\\'
                   AND (?3 = '' OR key > ?3 OR (key = ?3 AND ?4 != '' AND upload_id > ?4))
                 ORDER BY key, upload_id"
            ))?;
            let rows = stmt.query_map(
                params![
                    bucket,
                    like_pattern,
                    query.key_marker,
                    query.upload_id_marker
                ],
                map_upload_row,
            )?;
            let candidates: Vec<MultipartUploadRecord> = rows.collect::<Result<_, _>>()?;
            Ok(list::paginate_uploads(candidates, &query))
        })
    }

    fn count_uploads(&self, bucket: &str) -> BoxFut<'_, u64> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM multipart_uploads WHERE bucket = ?1",
                params![bucket],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn reap_expired_uploads(&self, ttl_seconds: i64) -> BoxFut<'_, Vec<ExpiredUpload>> {
        Box::pin(async move {
            // Compute the cutoff in the same ISO-8601 format as the
            // stored timestamps so the comparison is plain string
            // ordering.
            let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(ttl_seconds))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

            let conn = self.lock();
            let tx = conn.unchecked_transaction()?;

            let expired: Vec<ExpiredUpload> = {
                let mut stmt = tx.prepare(
                    "SELECT upload_id, bucket, key FROM multipart_uploads
                     WHERE initiated_at < ?1",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| {
                    Ok(ExpiredUpload {
                        upload_id: row.get(0)?,
                        bucket: row.get(1)?,
                        key: row.get(2)?,
                    })
                })?;
                rows.collect::<Result<_, _>>()?
            };

            for upload in &expired {
                tx.execute(
                    "DELETE FROM multipart_parts WHERE upload_id = ?1",
                    params![upload.upload_id],
                )?;
                tx.execute(
                    "DELETE FROM multipart_uploads WHERE upload_id = ?1",
                    params![upload.upload_id],
                )?;
            }

            tx.commit()?;
            Ok(expired)
        })
    }

    // ── Credentials ────────────────────────────────────────────────

    fn get_credential(&self, access_key_id: &str) -> BoxFut<'_, Option<CredentialRecord>> {
        let access_key_id = access_key_id.to_string();
        Box::pin(async move {
            let conn = self.lock();
            let credential = conn
                .query_row(
                    "SELECT access_key_id, secret_key, owner_id, display_name, active, created_at
                     FROM credentials WHERE access_key_id = ?1 AND active = 1",
                    params![access_key_id],
                    map_credential_row,
                )
                .optional()?;
            Ok(credential)
        })
    }

    fn put_credential(&self, record: CredentialRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            let conn = self.lock();
            conn.execute(
                "INSERT OR REPLACE INTO credentials
                     (access_key_id, secret_key, owner_id, display_name, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.access_key_id,
                    record.secret_key,
                    record.owner_id,
                    record.display_name,
                    record.active as i64,
                    record.created_at,
                ],
            )?;
            Ok(())
        })
    }

    // ── Dumps ──────────────────────────────────────────────────────

    fn dump_buckets(&self) -> BoxFut<'_, Vec<BucketRecord>> {
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT name, region, owner_id, owner_display, acl, created_at
                 FROM buckets ORDER BY name",
            )?;
            let rows = stmt.query_map([], map_bucket_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    fn dump_objects(&self) -> BoxFut<'_, Vec<ObjectRecord>> {
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {OBJECT_COLUMNS} FROM objects ORDER BY bucket, key"
            ))?;
            let rows = stmt.query_map([], map_object_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    fn dump_uploads(&self) -> BoxFut<'_, Vec<MultipartUploadRecord>> {
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {UPLOAD_COLUMNS} FROM multipart_uploads ORDER BY upload_id"
            ))?;
            let rows = stmt.query_map([], map_upload_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    fn dump_parts(&self) -> BoxFut<'_, Vec<(String, PartRecord)>> {
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT upload_id, part_number, size, etag, last_modified
                 FROM multipart_parts ORDER BY upload_id, part_number",
            )?;
            let rows = stmt.query_map([], |row| {
                let upload_id: String = row.get(0)?;
                let part_number: i64 = row.get(1)?;
                let size: i64 = row.get(2)?;
                Ok((
                    upload_id,
                    PartRecord {
                        part_number: part_number as u32,
                        size: size as u64,
                        etag: row.get(3)?,
                        last_modified: row.get(4)?,
                    },
                ))
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    fn dump_credentials(&self) -> BoxFut<'_, Vec<CredentialRecord>> {
        Box::pin(async move {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT access_key_id, secret_key, owner_id, display_name, active, created_at
                 FROM credentials ORDER BY access_key_id",
            )?;
            let rows = stmt.query_map([], map_credential_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
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
    use crate::metadata::store::test_fixtures::{make_bucket, make_object, make_upload};

    fn test_store() -> SqliteMetadataStore {
        SqliteMetadataStore::open(":memory:").expect("failed to open in-memory store")
    }

    #[tokio::test]
    async fn test_schema_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let path = path.to_str().unwrap();
        // Opening twice must not error: crash-only startup reruns the
        // DDL every time.
        let store = SqliteMetadataStore::open(path).unwrap();
        drop(store);
        let _store = SqliteMetadataStore::open(path).unwrap();
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let store = test_store();
        store.create_bucket(make_bucket("my-bucket")).await.unwrap();

        let bucket = store.get_bucket("my-bucket").await.unwrap().unwrap();
        assert_eq!(bucket.name, "my-bucket");
        assert_eq!(bucket.owner_id, "test-owner");

        let err = store
            .create_bucket(make_bucket("my-bucket"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BucketAlreadyExists");

        store.delete_bucket("my-bucket").await.unwrap();
        assert!(store.get_bucket("my-bucket").await.unwrap().is_none());

        let err = store.delete_bucket("my-bucket").await.unwrap_err();
        assert_eq!(err.code(), "NoSuchBucket");
    }

    #[tokio::test]
    async fn test_delete_bucket_not_empty() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store.put_object(make_object("b", "k", 1)).await.unwrap();

        let err = store.delete_bucket("b").await.unwrap_err();
        assert_eq!(err.code(), "BucketNotEmpty");
    }

    #[tokio::test]
    async fn test_object_upsert_roundtrip() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();

        let mut obj = make_object("b", "hello.txt", 5);
        obj.user_metadata
            .insert("author".to_string(), "tester".to_string());
        store.put_object(obj.clone()).await.unwrap();

        let fetched = store.get_object("b", "hello.txt").await.unwrap().unwrap();
        assert_eq!(fetched, obj);

        // Upsert replaces.
        let replacement = make_object("b", "hello.txt", 42);
        store.put_object(replacement).await.unwrap();
        let fetched = store.get_object("b", "hello.txt").await.unwrap().unwrap();
        assert_eq!(fetched.size, 42);
    }

    #[tokio::test]
    async fn test_list_objects_prefix_and_delimiter() {
        let store = test_store();
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

        let result = store
            .list_objects(
                "b",
                ListObjectsQuery {
                    prefix: "photos/".to_string(),
                    delimiter: "/".to_string(),
                    ..ListObjectsQuery::default()
                },
            )
            .await
            .unwrap();
        assert!(result.objects.is_empty());
        assert_eq!(result.common_prefixes, vec!["photos/2024/", "photos/2025/"]);
    }

    #[tokio::test]
    async fn test_list_objects_delimiter_truncation_counts_merged_entries() {
        // Ten keys under one prefix plus one loose key must truncate on
        // the merged {prefix, key} multiset, not the raw row count.
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        for i in 0..10 {
            store
                .put_object(make_object("b", &format!("logs/{i}.txt"), 1))
                .await
                .unwrap();
        }
        store.put_object(make_object("b", "zzz.txt", 1)).await.unwrap();

        let result = store
            .list_objects(
                "b",
                ListObjectsQuery {
                    delimiter: "/".to_string(),
                    max_keys: 2,
                    ..ListObjectsQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.common_prefixes, vec!["logs/"]);
        assert_eq!(result.objects.len(), 1);
        assert_eq!(result.objects[0].key, "zzz.txt");
        assert!(!result.is_truncated);
    }

    #[tokio::test]
    async fn test_list_objects_like_wildcards_are_literal() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store
            .put_object(make_object("b", "100%_done.txt", 1))
            .await
            .unwrap();
        store
            .put_object(make_object("b", "100x_done.txt", 1))
            .await
            .unwrap();

        let result = store
            .list_objects(
                "b",
                ListObjectsQuery {
                    prefix: "100%".to_string(),
                    ..ListObjectsQuery::default()
                },
            )
            .await
            .unwrap();
        let keys: Vec<&str> = result.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["100%_done.txt"]);
    }

    #[tokio::test]
    async fn test_pagination_totality() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        for i in 0..5 {
            store
                .put_object(make_object("b", &format!("key{i}"), 1))
                .await
                .unwrap();
        }

        let mut token = None;
        let mut seen = Vec::new();
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
            seen.extend(result.objects.iter().map(|o| o.key.clone()));
            if !result.is_truncated {
                break;
            }
            token = result.next_continuation_token;
        }
        assert_eq!(seen, vec!["key0", "key1", "key2", "key3", "key4"]);
    }

    #[tokio::test]
    async fn test_batch_delete_order() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        for key in ["a", "b", "c"] {
            store.put_object(make_object("b", key, 1)).await.unwrap();
        }
        let keys = vec!["c".to_string(), "ghost".to_string(), "a".to_string()];
        let outcome = store.delete_objects_meta("b", &keys).await.unwrap();
        assert_eq!(outcome.deleted, keys);
        assert_eq!(store.count_objects("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_acls() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        store.put_object(make_object("b", "k", 1)).await.unwrap();

        store
            .update_bucket_acl("b", r#"{"owner":{"id":"x"}}"#)
            .await
            .unwrap();
        assert!(store
            .get_bucket("b")
            .await
            .unwrap()
            .unwrap()
            .acl
            .contains("\"x\""));

        store
            .update_object_acl("b", "k", r#"{"owner":{"id":"y"}}"#)
            .await
            .unwrap();
        assert!(store
            .get_object("b", "k")
            .await
            .unwrap()
            .unwrap()
            .acl
            .contains("\"y\""));

        let err = store
            .update_object_acl("b", "missing", "{}")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchKey");
    }

    #[tokio::test]
    async fn test_multipart_complete_is_transactional() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        let upload_id = store
            .create_multipart_upload(make_upload("b", "big.bin", ""))
            .await
            .unwrap();
        assert_eq!(upload_id.len(), 32);

        for n in 1..=2u32 {
            store
                .put_part(
                    &upload_id,
                    PartRecord {
                        part_number: n,
                        size: 100,
                        etag: format!("\"p{n}\""),
                        last_modified: now_iso8601(),
                    },
                )
                .await
                .unwrap();
        }

        store
            .complete_multipart_upload(
                "b",
                "big.bin",
                &upload_id,
                make_object("b", "big.bin", 200),
            )
            .await
            .unwrap();

        assert!(store.get_object("b", "big.bin").await.unwrap().is_some());
        assert!(store
            .get_multipart_upload("b", "big.bin", &upload_id)
            .await
            .unwrap()
            .is_none());
        let parts = store
            .list_parts(&upload_id, ListPartsQuery::default())
            .await
            .unwrap();
        assert!(parts.parts.is_empty());

        // Completing again is NoSuchUpload.
        let err = store
            .complete_multipart_upload(
                "b",
                "big.bin",
                &upload_id,
                make_object("b", "big.bin", 200),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchUpload");
    }

    #[tokio::test]
    async fn test_get_upload_checks_bucket_and_key() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        let upload_id = store
            .create_multipart_upload(make_upload("b", "file.bin", ""))
            .await
            .unwrap();

        assert!(store
            .get_multipart_upload("b", "file.bin", &upload_id)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_multipart_upload("b", "wrong.bin", &upload_id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_multipart_upload("other", "file.bin", &upload_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_uploads_marker_predicate() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        for (key, id) in [("k1", "aaa"), ("k1", "bbb"), ("k2", "ccc")] {
            store
                .create_multipart_upload(make_upload("b", key, id))
                .await
                .unwrap();
        }

        let result = store
            .list_multipart_uploads(
                "b",
                ListUploadsQuery {
                    key_marker: "k1".to_string(),
                    upload_id_marker: "aaa".to_string(),
                    ..ListUploadsQuery::default()
                },
            )
            .await
            .unwrap();
        let got: Vec<(&str, &str)> = result
            .uploads
            .iter()
            .map(|u| (u.key.as_str(), u.upload_id.as_str()))
            .collect();
        assert_eq!(got, vec![("k1", "bbb"), ("k2", "ccc")]);
    }

    #[tokio::test]
    async fn test_parts_pagination() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();
        let upload_id = store
            .create_multipart_upload(make_upload("b", "big.bin", ""))
            .await
            .unwrap();
        for n in 1..=5u32 {
            store
                .put_part(
                    &upload_id,
                    PartRecord {
                        part_number: n,
                        size: 10,
                        etag: format!("\"p{n}\""),
                        last_modified: now_iso8601(),
                    },
                )
                .await
                .unwrap();
        }

        let page = store
            .list_parts(
                &upload_id,
                ListPartsQuery {
                    max_parts: 2,
                    part_number_marker: 2,
                },
            )
            .await
            .unwrap();
        let numbers: Vec<u32> = page.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![3, 4]);
        assert!(page.is_truncated);
        assert_eq!(page.next_part_number_marker, Some(4));
    }

    #[tokio::test]
    async fn test_reap_expired_uploads() {
        let store = test_store();
        store.create_bucket(make_bucket("b")).await.unwrap();

        let mut stale = make_upload("b", "old.bin", "stale-upload");
        stale.initiated_at = "2020-01-01T00:00:00.000Z".to_string();
        store.create_multipart_upload(stale).await.unwrap();
        store
            .put_part(
                "stale-upload",
                PartRecord {
                    part_number: 1,
                    size: 10,
                    etag: "\"p\"".to_string(),
                    last_modified: now_iso8601(),
                },
            )
            .await
            .unwrap();
        store
            .create_multipart_upload(make_upload("b", "new.bin", "fresh-upload"))
            .await
            .unwrap();

        let expired = store.reap_expired_uploads(3600).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].upload_id, "stale-upload");
        assert_eq!(expired[0].bucket, "b");

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
    async fn test_credentials_inactive_hidden() {
        let store = test_store();
        store
            .put_credential(CredentialRecord {
                access_key_id: "ak".to_string(),
                secret_key: "sk".to_string(),
                owner_id: "o".to_string(),
                display_name: "o".to_string(),
                active: true,
                created_at: now_iso8601(),
            })
            .await
            .unwrap();
        assert!(store.get_credential("ak").await.unwrap().is_some());

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
    async fn test_dumps_are_ordered() {
        let store = test_store();
        for name in ["zeta", "alpha", "mid"] {
            store.create_bucket(make_bucket(name)).await.unwrap();
        }
        store
            .put_object(make_object("zeta", "b-key", 1))
            .await
            .unwrap();
        store
            .put_object(make_object("alpha", "z-key", 1))
            .await
            .unwrap();

        let buckets = store.dump_buckets().await.unwrap();
        let names: Vec<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);

        let objects = store.dump_objects().await.unwrap();
        let pairs: Vec<(&str, &str)> = objects
            .iter()
            .map(|o| (o.bucket.as_str(), o.key.as_str()))
            .collect();
        assert_eq!(pairs, vec![("alpha", "z-key"), ("zeta", "b-key")]);
    }
}
