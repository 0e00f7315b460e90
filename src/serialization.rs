//! Metadata export/import in the canonical JSON envelope.
//!
//! The serializer runs against `&dyn MetadataStore`, never a concrete
//! substrate: rows stream out of the `dump_*` methods in primary-key
//! order and the output is rendered from sorted-key maps with 2-space
//! indent.  That construction is what makes the export of the same
//! logical state byte-identical across every backend.
//!
//! Rendering rules: nullable fields are explicit `null`, booleans are
//! JSON booleans, `acl` and `user_metadata` are expanded to nested
//! objects (not strings), and `secret_key` is the literal `"REDACTED"`
//! unless credentials are explicitly included.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{StoreError, StoreResult};
use crate::metadata::store::{
    BucketRecord, CredentialRecord, MetadataStore, MultipartUploadRecord, ObjectRecord, PartRecord,
};
use crate::types::now_iso8601;

/// Engine version advertised in the export envelope's `source` field.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Envelope format version.
pub const EXPORT_VERSION: i64 = 1;

/// Schema version recorded in the envelope.
pub const SCHEMA_VERSION: i64 = 1;

/// Tables in dependency (insert) order.
pub const ALL_TABLES: &[&str] = &[
    "buckets",
    "objects",
    "multipart_uploads",
    "multipart_parts",
    "credentials",
];

/// Sentinel written in place of redacted secrets.
pub const REDACTED: &str = "REDACTED";

/// Export configuration.
pub struct ExportOptions {
    /// Which tables to include, in any order; output order is fixed.
    pub tables: Vec<String>,
    /// Emit real secret keys instead of the redaction sentinel.
    pub include_credentials: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            tables: ALL_TABLES.iter().map(|s| s.to_string()).collect(),
            include_credentials: false,
        }
    }
}

/// Import configuration.
#[derive(Default)]
pub struct ImportOptions {
    /// Replace mode: truncate the tables present in the input before
    /// inserting. Merge mode (default) only inserts missing rows.
    pub replace: bool,
}

/// Per-table import counters plus warnings.
#[derive(Debug)]
pub struct ImportReport {
    pub counts: BTreeMap<String, usize>,
    pub skipped: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
}

// ── Row rendering ──────────────────────────────────────────────────

/// Parse an ACL blob into an object; malformed blobs collapse to `{}`
/// rather than poisoning the export.
fn expand_json_blob(blob: &str) -> Value {
    serde_json::from_str(blob).unwrap_or_else(|_| Value::Object(Map::new()))
}

fn opt_string(value: &Option<String>) -> Value {
    match value {
        Some(v) => Value::String(v.clone()),
        None => Value::Null,
    }
}

fn bucket_row(record: &BucketRecord) -> Value {
    // serde_json's default Map is BTree-backed, so insertion order is
    // irrelevant: keys always render sorted.
    json!({
        "acl": expand_json_blob(&record.acl),
        "created_at": record.created_at,
        "name": record.name,
        "owner_display": record.owner_display,
        "owner_id": record.owner_id,
        "region": record.region,
    })
}

fn object_row(record: &ObjectRecord) -> Value {
    json!({
        "acl": expand_json_blob(&record.acl),
        "bucket": record.bucket,
        "cache_control": opt_string(&record.cache_control),
        "content_disposition": opt_string(&record.content_disposition),
        "content_encoding": opt_string(&record.content_encoding),
        "content_language": opt_string(&record.content_language),
        "content_type": record.content_type,
        "delete_marker": record.delete_marker,
        "etag": record.etag,
        "expires": opt_string(&record.expires),
        "key": record.key,
        "last_modified": record.last_modified,
        "size": record.size,
        "storage_class": record.storage_class,
        "user_metadata": record.user_metadata,
    })
}

fn upload_row(record: &MultipartUploadRecord) -> Value {
    json!({
        "acl": expand_json_blob(&record.acl),
        "bucket": record.bucket,
        "cache_control": opt_string(&record.cache_control),
        "content_disposition": opt_string(&record.content_disposition),
        "content_encoding": opt_string(&record.content_encoding),
        "content_language": opt_string(&record.content_language),
        "content_type": record.content_type,
        "expires": opt_string(&record.expires),
        "initiated_at": record.initiated_at,
        "key": record.key,
        "owner_display": record.owner_display,
        "owner_id": record.owner_id,
        "storage_class": record.storage_class,
        "upload_id": record.upload_id,
        "user_metadata": record.user_metadata,
    })
}

fn part_row(upload_id: &str, record: &PartRecord) -> Value {
    json!({
        "etag": record.etag,
        "last_modified": record.last_modified,
        "part_number": record.part_number,
        "size": record.size,
        "upload_id": upload_id,
    })
}

fn credential_row(record: &CredentialRecord, include_secret: bool) -> Value {
    json!({
        "access_key_id": record.access_key_id,
        "active": record.active,
        "created_at": record.created_at,
        "display_name": record.display_name,
        "owner_id": record.owner_id,
        "secret_key": if include_secret { record.secret_key.clone() } else { REDACTED.to_string() },
    })
}

// ── Export ─────────────────────────────────────────────────────────

/// Export the selected tables as the canonical envelope.
pub async fn export_state(
    store: &dyn MetadataStore,
    options: &ExportOptions,
) -> StoreResult<String> {
    let selected: BTreeSet<&str> = options.tables.iter().map(|t| t.as_str()).collect();
    for table in &selected {
        if !ALL_TABLES.contains(table) {
            return Err(StoreError::invalid(format!("unknown table: {table}")));
        }
    }

    let mut result = BTreeMap::<String, Value>::new();
    result.insert(
        "bleepstore_export".to_string(),
        json!({
            "exported_at": now_iso8601(),
            "schema_version": SCHEMA_VERSION,
            "source": format!("rust/{VERSION}"),
            "version": EXPORT_VERSION,
        }),
    );

    if selected.contains("buckets") {
        let rows: Vec<Value> = store.dump_buckets().await?.iter().map(bucket_row).collect();
        result.insert("buckets".to_string(), Value::Array(rows));
    }
    if selected.contains("objects") {
        let rows: Vec<Value> = store.dump_objects().await?.iter().map(object_row).collect();
        result.insert("objects".to_string(), Value::Array(rows));
    }
    if selected.contains("multipart_uploads") {
        let rows: Vec<Value> = store.dump_uploads().await?.iter().map(upload_row).collect();
        result.insert("multipart_uploads".to_string(), Value::Array(rows));
    }
    if selected.contains("multipart_parts") {
        let rows: Vec<Value> = store
            .dump_parts()
            .await?
            .iter()
            .map(|(upload_id, part)| part_row(upload_id, part))
            .collect();
        result.insert("multipart_parts".to_string(), Value::Array(rows));
    }
    if selected.contains("credentials") {
        let rows: Vec<Value> = store
            .dump_credentials()
            .await?
            .iter()
            .map(|c| credential_row(c, options.include_credentials))
            .collect();
        result.insert("credentials".to_string(), Value::Array(rows));
    }

    Ok(serde_json::to_string_pretty(&result)?)
}

// ── Import ─────────────────────────────────────────────────────────

/// Turn an exported row back into a record: `acl` collapses from an
/// object to a blob string; unknown fields are ignored.
fn row_to_record<T: serde::de::DeserializeOwned>(row: &Value) -> StoreResult<T> {
    let mut row = row.clone();
    if let Some(map) = row.as_object_mut() {
        let acl = map.get("acl").cloned().unwrap_or(Value::Null);
        let collapsed = match acl {
            Value::Null => "{}".to_string(),
            Value::String(s) => s,
            other => serde_json::to_string(&other)?,
        };
        map.insert("acl".to_string(), Value::String(collapsed));
    }
    Ok(serde_json::from_value(row)?)
}

fn rows_of<'a>(data: &'a BTreeMap<String, Value>, table: &str) -> &'a [Value] {
    data.get(table)
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[])
}

/// Import an envelope. Merge mode inserts only missing rows, skipping
/// orphans with warnings; replace mode validates referential integrity
/// first, refuses the whole import on failure, and truncates the
/// tables present in the input before inserting.
pub async fn import_state(
    store: &dyn MetadataStore,
    json_str: &str,
    options: &ImportOptions,
) -> StoreResult<ImportReport> {
    let data: BTreeMap<String, Value> = serde_json::from_str(json_str)?;

    let envelope = data
        .get("bleepstore_export")
        .and_then(|v| v.as_object())
        .ok_or_else(|| StoreError::invalid("missing bleepstore_export envelope"))?;
    let version = envelope.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
    if !(1..=EXPORT_VERSION).contains(&version) {
        return Err(StoreError::invalid(format!(
            "unsupported export version: {version}"
        )));
    }

    let mut report = ImportReport {
        counts: BTreeMap::new(),
        skipped: BTreeMap::new(),
        warnings: Vec::new(),
    };
    for table in ALL_TABLES {
        if data.contains_key(*table) {
            report.counts.insert(table.to_string(), 0);
            report.skipped.insert(table.to_string(), 0);
        }
    }

    if options.replace {
        validate_replace_integrity(store, &data).await?;
        truncate_tables(store, &data, &mut report).await?;
    }

    // Buckets.
    for row in rows_of(&data, "buckets") {
        let record: BucketRecord = row_to_record(row)?;
        let name = record.name.clone();
        if store.get_bucket(&name).await?.is_some() {
            bump(&mut report.skipped, "buckets");
            continue;
        }
        match store.create_bucket(record).await {
            Ok(()) => bump(&mut report.counts, "buckets"),
            Err(StoreError::BucketAlreadyExists { .. }) => bump(&mut report.skipped, "buckets"),
            Err(err) => return Err(err),
        }
    }

    // Objects.
    for row in rows_of(&data, "objects") {
        let record: ObjectRecord = row_to_record(row)?;
        if store.get_bucket(&record.bucket).await?.is_none() {
            bump(&mut report.skipped, "objects");
            report.warnings.push(format!(
                "Skipped object '{}/{}': bucket does not exist",
                record.bucket, record.key
            ));
            continue;
        }
        if store.get_object(&record.bucket, &record.key).await?.is_some() {
            bump(&mut report.skipped, "objects");
            continue;
        }
        store.put_object(record).await?;
        bump(&mut report.counts, "objects");
    }

    // Uploads.
    for row in rows_of(&data, "multipart_uploads") {
        let record: MultipartUploadRecord = row_to_record(row)?;
        if store.get_bucket(&record.bucket).await?.is_none() {
            bump(&mut report.skipped, "multipart_uploads");
            report.warnings.push(format!(
                "Skipped upload '{}': bucket '{}' does not exist",
                record.upload_id, record.bucket
            ));
            continue;
        }
        if store
            .get_multipart_upload(&record.bucket, &record.key, &record.upload_id)
            .await?
            .is_some()
        {
            bump(&mut report.skipped, "multipart_uploads");
            continue;
        }
        store.create_multipart_upload(record).await?;
        bump(&mut report.counts, "multipart_uploads");
    }

    // Parts.
    for row in rows_of(&data, "multipart_parts") {
        let upload_id = row
            .get("upload_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let record: PartRecord = row_to_record(row)?;
        match store.put_part(&upload_id, record).await {
            Ok(()) => bump(&mut report.counts, "multipart_parts"),
            Err(StoreError::NoSuchUpload { .. }) => {
                bump(&mut report.skipped, "multipart_parts");
                report.warnings.push(format!(
                    "Skipped part of upload '{upload_id}': upload does not exist"
                ));
            }
            Err(err) => return Err(err),
        }
    }

    // Credentials.
    for row in rows_of(&data, "credentials") {
        let record: CredentialRecord = row_to_record(row)?;
        if record.secret_key == REDACTED {
            bump(&mut report.skipped, "credentials");
            report.warnings.push(format!(
                "Skipped credential '{}': REDACTED secret_key",
                record.access_key_id
            ));
            continue;
        }
        if store.get_credential(&record.access_key_id).await?.is_some() {
            bump(&mut report.skipped, "credentials");
            continue;
        }
        store.put_credential(record).await?;
        bump(&mut report.counts, "credentials");
    }

    Ok(report)
}

fn bump(counters: &mut BTreeMap<String, usize>, table: &str) {
    *counters.entry(table.to_string()).or_insert(0) += 1;
}

/// Replace-mode integrity check, performed before any mutation: every
/// child row's parent must exist either in the payload (when its table
/// is being replaced) or in the store (when it is not). A violation
/// aborts the import with no writes -- the substrate-independent
/// equivalent of a rollback.
async fn validate_replace_integrity(
    store: &dyn MetadataStore,
    data: &BTreeMap<String, Value>,
) -> StoreResult<()> {
    let replacing_buckets = data.contains_key("buckets");
    let replacing_uploads = data.contains_key("multipart_uploads");

    let payload_buckets: BTreeSet<String> = rows_of(data, "buckets")
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.as_str()).map(String::from))
        .collect();
    let payload_uploads: BTreeSet<String> = rows_of(data, "multipart_uploads")
        .iter()
        .filter_map(|r| {
            r.get("upload_id")
                .and_then(|v| v.as_str())
                .map(String::from)
        })
        .collect();

    for row in rows_of(data, "objects").iter().chain(rows_of(data, "multipart_uploads")) {
        let bucket = row
            .get("bucket")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let present = if replacing_buckets {
            payload_buckets.contains(bucket)
        } else {
            store.get_bucket(bucket).await?.is_some()
        };
        if !present {
            return Err(StoreError::invalid(format!(
                "replace import references missing bucket '{bucket}'"
            )));
        }
    }

    for row in rows_of(data, "multipart_parts") {
        let upload_id = row
            .get("upload_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let present = if replacing_uploads {
            payload_uploads.contains(upload_id)
        } else {
            // No bucket/key to hand; presence in dumps is the check.
            store
                .dump_uploads()
                .await?
                .iter()
                .any(|u| u.upload_id == upload_id)
        };
        if !present {
            return Err(StoreError::invalid(format!(
                "replace import references missing upload '{upload_id}'"
            )));
        }
    }

    Ok(())
}

/// Drop current rows of each table present in the input, children
/// before parents.
async fn truncate_tables(
    store: &dyn MetadataStore,
    data: &BTreeMap<String, Value>,
    report: &mut ImportReport,
) -> StoreResult<()> {
    // Uploads take their parts with them.
    if data.contains_key("multipart_uploads") || data.contains_key("multipart_parts") {
        for upload in store.dump_uploads().await? {
            store
                .abort_multipart_upload(&upload.bucket, &upload.key, &upload.upload_id)
                .await?;
        }
    }
    if data.contains_key("objects") {
        for object in store.dump_objects().await? {
            store.delete_object(&object.bucket, &object.key).await?;
        }
    }
    if data.contains_key("buckets") {
        for bucket in store.dump_buckets().await? {
            match store.delete_bucket(&bucket.name).await {
                Ok(()) => {}
                Err(StoreError::BucketNotEmpty { .. }) => {
                    report.warnings.push(format!(
                        "Kept bucket '{}': still referenced by rows outside this import",
                        bucket.name
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }
    // Credentials have no children; removal is replacement by upsert,
    // so stale keys not present in the payload are dropped explicitly.
    if data.contains_key("credentials") {
        let payload_keys: BTreeSet<&str> = rows_of(data, "credentials")
            .iter()
            .filter_map(|r| r.get("access_key_id").and_then(|v| v.as_str()))
            .collect();
        for credential in store.dump_credentials().await? {
            if !payload_keys.contains(credential.access_key_id.as_str()) {
                // Deactivation is the closest thing to deletion the
                // contract offers, and lookups treat it as absent.
                let mut record = credential;
                record.active = false;
                store.put_credential(record).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::jsonl::JsonlMetadataStore;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::store::test_fixtures::{make_bucket, make_object, make_upload};
    use crate::metadata::store::{ListPartsQuery, PartRecord};

    async fn seed(store: &dyn MetadataStore) {
        store.create_bucket(make_bucket("test-bucket")).await.unwrap();
        let mut object = make_object("test-bucket", "photos/cat.jpg", 142_857);
        object.content_type = "image/jpeg".to_string();
        object
            .user_metadata
            .insert("author".to_string(), "John".to_string());
        store.put_object(object).await.unwrap();
        store
            .create_multipart_upload(make_upload("test-bucket", "large-file.bin", "upload-abc123"))
            .await
            .unwrap();
        store
            .put_part(
                "upload-abc123",
                PartRecord {
                    part_number: 1,
                    size: 5_242_880,
                    etag: "\"098f6bcd4621d373cade4e832627b4f6\"".to_string(),
                    last_modified: "2026-02-25T13:05:00.000Z".to_string(),
                },
            )
            .await
            .unwrap();
        store
            .put_credential(CredentialRecord {
                access_key_id: "bleepstore".to_string(),
                secret_key: "bleepstore-secret".to_string(),
                owner_id: "bleepstore".to_string(),
                display_name: "bleepstore".to_string(),
                active: true,
                created_at: "2026-02-25T12:00:00.000Z".to_string(),
            })
            .await
            .unwrap();
    }

    fn strip_envelope(exported: &str) -> BTreeMap<String, Value> {
        let mut data: BTreeMap<String, Value> = serde_json::from_str(exported).unwrap();
        data.remove("bleepstore_export");
        data
    }

    #[tokio::test]
    async fn test_export_shape() {
        let store = MemoryMetadataStore::new();
        seed(&store).await;

        let exported = export_state(&store, &ExportOptions::default()).await.unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&exported).unwrap();

        let envelope = data["bleepstore_export"].as_object().unwrap();
        assert_eq!(envelope["version"], 1);
        assert_eq!(envelope["schema_version"], 1);
        assert_eq!(envelope["source"], format!("rust/{VERSION}"));

        // 2-space indent, sorted top-level keys.
        assert!(exported.starts_with("{\n  \"bleepstore_export\""));

        let object = &data["objects"][0];
        assert_eq!(object["content_type"], "image/jpeg");
        // Explicit nulls for absent nullable fields.
        assert!(object["content_encoding"].is_null());
        // Expanded user metadata, boolean delete marker.
        assert_eq!(object["user_metadata"]["author"], "John");
        assert_eq!(object["delete_marker"], false);
        // ACL expands to an object, not a string.
        assert!(data["buckets"][0]["acl"].is_object());
    }

    #[tokio::test]
    async fn test_export_redacts_credentials_by_default() {
        let store = MemoryMetadataStore::new();
        seed(&store).await;

        let exported = export_state(&store, &ExportOptions::default()).await.unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&exported).unwrap();
        assert_eq!(data["credentials"][0]["secret_key"], "REDACTED");

        let options = ExportOptions {
            include_credentials: true,
            ..ExportOptions::default()
        };
        let exported = export_state(&store, &options).await.unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&exported).unwrap();
        assert_eq!(data["credentials"][0]["secret_key"], "bleepstore-secret");
    }

    #[tokio::test]
    async fn test_export_identity_across_backends() {
        // Identical logical state renders byte-identically from
        // every substrate, modulo the envelope.
        let memory = MemoryMetadataStore::new();
        seed(&memory).await;

        let sqlite = SqliteMetadataStore::open(":memory:").unwrap();
        seed(&sqlite).await;

        let dir = tempfile::tempdir().unwrap();
        let jsonl = JsonlMetadataStore::open(dir.path(), false).unwrap();
        seed(&jsonl).await;

        let from_memory = export_state(&memory, &ExportOptions::default()).await.unwrap();
        let from_sqlite = export_state(&sqlite, &ExportOptions::default()).await.unwrap();
        let from_jsonl = export_state(&jsonl, &ExportOptions::default()).await.unwrap();

        assert_eq!(strip_envelope(&from_memory), strip_envelope(&from_sqlite));
        assert_eq!(strip_envelope(&from_memory), strip_envelope(&from_jsonl));
    }

    #[tokio::test]
    async fn test_table_selection() {
        let store = MemoryMetadataStore::new();
        seed(&store).await;
        let options = ExportOptions {
            tables: vec!["buckets".to_string(), "objects".to_string()],
            include_credentials: false,
        };
        let exported = export_state(&store, &options).await.unwrap();
        let data: BTreeMap<String, Value> = serde_json::from_str(&exported).unwrap();
        assert!(data.contains_key("buckets"));
        assert!(data.contains_key("objects"));
        assert!(!data.contains_key("credentials"));

        let err = export_state(
            &store,
            &ExportOptions {
                tables: vec!["no_such_table".to_string()],
                include_credentials: false,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[tokio::test]
    async fn test_roundtrip_merge_import() {
        let source = MemoryMetadataStore::new();
        seed(&source).await;
        let options = ExportOptions {
            include_credentials: true,
            ..ExportOptions::default()
        };
        let exported = export_state(&source, &options).await.unwrap();

        let target = SqliteMetadataStore::open(":memory:").unwrap();
        let report = import_state(&target, &exported, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.counts["buckets"], 1);
        assert_eq!(report.counts["objects"], 1);
        assert_eq!(report.counts["multipart_uploads"], 1);
        assert_eq!(report.counts["multipart_parts"], 1);
        assert_eq!(report.counts["credentials"], 1);

        let re_exported = export_state(&target, &options).await.unwrap();
        assert_eq!(strip_envelope(&exported), strip_envelope(&re_exported));
    }

    #[tokio::test]
    async fn test_merge_import_is_idempotent() {
        let store = MemoryMetadataStore::new();
        seed(&store).await;
        let options = ExportOptions {
            include_credentials: true,
            ..ExportOptions::default()
        };
        let exported = export_state(&store, &options).await.unwrap();

        let report = import_state(&store, &exported, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.counts["buckets"], 0);
        assert_eq!(report.skipped["buckets"], 1);
        assert_eq!(report.counts["objects"], 0);
    }

    #[tokio::test]
    async fn test_merge_skips_orphans_with_warning() {
        let store = MemoryMetadataStore::new();
        let payload = json!({
            "bleepstore_export": {"version": 1},
            "objects": [{
                "acl": {},
                "bucket": "ghost-bucket",
                "cache_control": null,
                "content_disposition": null,
                "content_encoding": null,
                "content_language": null,
                "content_type": "application/octet-stream",
                "delete_marker": false,
                "etag": "\"e\"",
                "expires": null,
                "key": "k",
                "last_modified": "2026-02-23T00:00:00.000Z",
                "size": 1,
                "storage_class": "STANDARD",
                "user_metadata": {},
            }],
        });
        let report = import_state(&store, &payload.to_string(), &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.counts["objects"], 0);
        assert_eq!(report.skipped["objects"], 1);
        assert!(report.warnings[0].contains("ghost-bucket"));
    }

    #[tokio::test]
    async fn test_replace_refuses_orphans_without_writing() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("survivor")).await.unwrap();

        let payload = json!({
            "bleepstore_export": {"version": 1},
            "buckets": [],
            "objects": [{
                "acl": {},
                "bucket": "not-in-payload",
                "cache_control": null,
                "content_disposition": null,
                "content_encoding": null,
                "content_language": null,
                "content_type": "application/octet-stream",
                "delete_marker": false,
                "etag": "\"e\"",
                "expires": null,
                "key": "k",
                "last_modified": "2026-02-23T00:00:00.000Z",
                "size": 1,
                "storage_class": "STANDARD",
                "user_metadata": {},
            }],
        });
        let err = import_state(&store, &payload.to_string(), &ImportOptions { replace: true })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
        // Validation failed before truncation: the store is untouched.
        assert!(store.get_bucket("survivor").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replace_truncates_then_inserts() {
        let store = MemoryMetadataStore::new();
        store.create_bucket(make_bucket("old-bucket")).await.unwrap();
        store
            .put_object(make_object("old-bucket", "old-key", 1))
            .await
            .unwrap();

        let source = MemoryMetadataStore::new();
        source.create_bucket(make_bucket("new-bucket")).await.unwrap();
        source
            .put_object(make_object("new-bucket", "new-key", 2))
            .await
            .unwrap();
        let exported = export_state(&source, &ExportOptions::default()).await.unwrap();

        let report = import_state(&store, &exported, &ImportOptions { replace: true })
            .await
            .unwrap();
        assert_eq!(report.counts["buckets"], 1);
        assert!(store.get_bucket("old-bucket").await.unwrap().is_none());
        assert!(store.get_object("new-bucket", "new-key").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_import_always_skips_redacted_credentials() {
        let store = MemoryMetadataStore::new();
        seed(&store).await;
        let exported = export_state(&store, &ExportOptions::default()).await.unwrap();

        let target = MemoryMetadataStore::new();
        let report = import_state(&target, &exported, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.counts["credentials"], 0);
        assert_eq!(report.skipped["credentials"], 1);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("REDACTED")));
    }

    #[tokio::test]
    async fn test_import_rejects_unknown_version() {
        let store = MemoryMetadataStore::new();
        let err = import_state(
            &store,
            r#"{"bleepstore_export":{"version":99}}"#,
            &ImportOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[tokio::test]
    async fn test_part_rows_reattach_to_uploads() {
        let source = MemoryMetadataStore::new();
        seed(&source).await;
        let exported = export_state(&source, &ExportOptions::default()).await.unwrap();

        let target = MemoryMetadataStore::new();
        import_state(&target, &exported, &ImportOptions::default())
            .await
            .unwrap();
        let parts = target
            .list_parts("upload-abc123", ListPartsQuery::default())
            .await
            .unwrap();
        assert_eq!(parts.parts.len(), 1);
        assert_eq!(parts.parts[0].size, 5_242_880);
    }
}
