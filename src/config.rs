//! Configuration loading and types.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! engine: seed credentials, metadata persistence, object storage, the
//! multipart reaper, and logging.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Region reported for new buckets when the caller supplies none.
    #[serde(default = "default_region")]
    pub region: String,

    /// Seed credentials applied on every startup.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Object storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Engine tuning (multipart TTL, reaper, recovery).
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Authentication seed credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Access key (also accepts `access_key_id` in YAML).
    #[serde(alias = "access_key_id", default = "default_access_key")]
    pub access_key: String,

    /// Secret key (also accepts `secret_access_key`).
    #[serde(alias = "secret_access_key", default = "default_secret_key")]
    pub secret_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_key: default_access_key(),
            secret_key: default_secret_key(),
        }
    }
}

// ── Metadata ───────────────────────────────────────────────────────

/// Which metadata substrate to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataBackendKind {
    LocalJsonl,
    Sqlite,
    Dynamodb,
    Cosmos,
    Firestore,
    Memory,
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Backend selector.
    #[serde(default = "default_metadata_backend")]
    pub backend: MetadataBackendKind,

    /// Local JSONL settings.
    #[serde(default)]
    pub jsonl: JsonlMetaConfig,

    /// SQLite settings.
    #[serde(default)]
    pub sqlite: SqliteMetaConfig,

    /// DynamoDB settings.
    #[serde(default)]
    pub dynamodb: Option<DynamoDbMetaConfig>,

    /// Cosmos DB settings.
    #[serde(default)]
    pub cosmos: Option<CosmosMetaConfig>,

    /// Firestore settings.
    #[serde(default)]
    pub firestore: Option<FirestoreMetaConfig>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: default_metadata_backend(),
            jsonl: JsonlMetaConfig::default(),
            sqlite: SqliteMetaConfig::default(),
            dynamodb: None,
            cosmos: None,
            firestore: None,
        }
    }
}

/// Local JSONL metadata settings.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonlMetaConfig {
    /// Directory holding the five `.jsonl` files.
    #[serde(default = "default_jsonl_root")]
    pub root_dir: String,

    /// Rewrite the logs without tombstones on startup.
    #[serde(default = "default_true")]
    pub compact_on_startup: bool,
}

impl Default for JsonlMetaConfig {
    fn default() -> Self {
        Self {
            root_dir: default_jsonl_root(),
            compact_on_startup: true,
        }
    }
}

/// SQLite metadata settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteMetaConfig {
    /// Path to the database file.
    #[serde(default = "default_sqlite_meta_path")]
    pub path: String,
}

impl Default for SqliteMetaConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_meta_path(),
        }
    }
}

/// DynamoDB metadata settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbMetaConfig {
    /// Table name (string keys `pk` and `sk`).
    #[serde(default = "default_dynamodb_table")]
    pub table: String,

    /// AWS region; empty falls through to the credential chain.
    #[serde(default)]
    pub region: String,

    /// Custom endpoint (e.g. LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
}

/// Cosmos DB metadata settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CosmosMetaConfig {
    /// Storage account name.
    pub account: String,

    /// Base64-encoded master key.
    pub master_key: String,

    /// Database id.
    #[serde(default = "default_cosmos_database")]
    pub database: String,

    /// Container id (partition key path `/pk`).
    #[serde(default = "default_cosmos_container")]
    pub container: String,

    /// Custom endpoint; defaults to `https://{account}.documents.azure.com`.
    #[serde(default)]
    pub endpoint: String,
}

/// Firestore metadata settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FirestoreMetaConfig {
    /// GCP project id.
    pub project: String,

    /// Prefix for the five collection names.
    #[serde(default = "default_firestore_prefix")]
    pub collection_prefix: String,

    /// Path to a credentials JSON file (sets
    /// `GOOGLE_APPLICATION_CREDENTIALS`).
    #[serde(default)]
    pub credentials_file: String,
}

// ── Storage ────────────────────────────────────────────────────────

/// Which storage substrate to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackendKind {
    LocalFs,
    SqliteBlob,
    Memory,
    Aws,
    Gcp,
    Azure,
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend selector.
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackendKind,

    /// Local filesystem settings.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// SQLite blob settings.
    #[serde(default)]
    pub sqlite: SqliteBlobConfig,

    /// In-memory settings.
    #[serde(default)]
    pub memory: MemoryStorageConfig,

    /// AWS S3 gateway settings.
    #[serde(default)]
    pub aws: Option<AwsStorageConfig>,

    /// GCS gateway settings.
    #[serde(default)]
    pub gcp: Option<GcpStorageConfig>,

    /// Azure Blob gateway settings.
    #[serde(default)]
    pub azure: Option<AzureStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local: LocalStorageConfig::default(),
            sqlite: SqliteBlobConfig::default(),
            memory: MemoryStorageConfig::default(),
            aws: None,
            gcp: None,
            azure: None,
        }
    }
}

/// Local filesystem storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
        }
    }
}

/// SQLite blob storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteBlobConfig {
    /// Path to the database file.
    #[serde(default = "default_sqlite_blob_path")]
    pub path: String,
}

impl Default for SqliteBlobConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_blob_path(),
        }
    }
}

/// In-memory storage settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryStorageConfig {
    /// Maximum total stored bytes; 0 means unlimited.
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// AWS S3 gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsStorageConfig {
    /// Backing S3 bucket name.
    pub bucket: String,

    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,

    /// Key prefix in the backing bucket.
    #[serde(default)]
    pub prefix: String,

    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,

    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
}

/// GCS gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GcpStorageConfig {
    /// Backing GCS bucket name.
    pub bucket: String,

    /// Key prefix in the backing bucket.
    #[serde(default)]
    pub prefix: String,

    /// Path to a credentials JSON file (sets
    /// `GOOGLE_APPLICATION_CREDENTIALS`).
    #[serde(default)]
    pub credentials_file: String,
}

/// Azure Blob gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AzureStorageConfig {
    /// Backing container name.
    pub container: String,

    /// Storage account name.
    pub account: String,

    /// Key prefix in the backing container.
    #[serde(default)]
    pub prefix: String,

    /// Shared key; falls back to `AZURE_STORAGE_KEY` when empty.
    #[serde(default)]
    pub account_key: String,

    /// Custom endpoint; defaults to
    /// `https://{account}.blob.core.windows.net`.
    #[serde(default)]
    pub endpoint: String,
}

// ── Engine ─────────────────────────────────────────────────────────

/// Engine tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Multipart uploads older than this are expired by the reaper.
    #[serde(default = "default_multipart_ttl")]
    pub multipart_ttl_seconds: u64,

    /// Interval between reaper ticks. 0 disables the background task.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,

    /// Cross-check storage against metadata during startup recovery.
    #[serde(default)]
    pub reconcile_on_startup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            multipart_ttl_seconds: default_multipart_ttl(),
            reaper_interval_seconds: default_reaper_interval(),
            reconcile_on_startup: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ── Defaults ───────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_access_key() -> String {
    "bleepstore".to_string()
}

fn default_secret_key() -> String {
    "bleepstore-secret".to_string()
}

fn default_metadata_backend() -> MetadataBackendKind {
    MetadataBackendKind::Sqlite
}

fn default_jsonl_root() -> String {
    "./data/metadata".to_string()
}

fn default_sqlite_meta_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_dynamodb_table() -> String {
    "bleepstore_metadata".to_string()
}

fn default_cosmos_database() -> String {
    "bleepstore".to_string()
}

fn default_cosmos_container() -> String {
    "metadata".to_string()
}

fn default_firestore_prefix() -> String {
    "bleepstore_".to_string()
}

fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::LocalFs
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_sqlite_blob_path() -> String {
    "./data/objects.db".to_string()
}

fn default_multipart_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_reaper_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// ── Loader ─────────────────────────────────────────────────────────

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.auth.access_key, "bleepstore");
        assert_eq!(config.metadata.backend, MetadataBackendKind::Sqlite);
        assert_eq!(config.storage.backend, StorageBackendKind::LocalFs);
        assert_eq!(config.engine.multipart_ttl_seconds, 7 * 24 * 3600);
        assert!(!config.engine.reconcile_on_startup);
    }

    #[test]
    fn test_backend_kind_names() {
        let config: Config = serde_yaml::from_str(
            r#"
metadata:
  backend: local-jsonl
  jsonl:
    root_dir: /tmp/meta
    compact_on_startup: false
storage:
  backend: sqlite-blob
  sqlite:
    path: /tmp/blobs.db
"#,
        )
        .unwrap();
        assert_eq!(config.metadata.backend, MetadataBackendKind::LocalJsonl);
        assert!(!config.metadata.jsonl.compact_on_startup);
        assert_eq!(config.storage.backend, StorageBackendKind::SqliteBlob);
        assert_eq!(config.storage.sqlite.path, "/tmp/blobs.db");
    }

    #[test]
    fn test_gateway_sections() {
        let config: Config = serde_yaml::from_str(
            r#"
storage:
  backend: azure
  azure:
    container: blobs
    account: myaccount
    prefix: "bleep/"
metadata:
  backend: cosmos
  cosmos:
    account: myaccount
    master_key: "c2VjcmV0"
"#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackendKind::Azure);
        let azure = config.storage.azure.unwrap();
        assert_eq!(azure.container, "blobs");
        assert_eq!(azure.prefix, "bleep/");
        let cosmos = config.metadata.cosmos.unwrap();
        assert_eq!(cosmos.database, "bleepstore");
        assert_eq!(cosmos.container, "metadata");
    }

    #[test]
    fn test_auth_aliases() {
        let config: Config = serde_yaml::from_str(
            r#"
auth:
  access_key_id: AKIDEXAMPLE
  secret_access_key: shhh
"#,
        )
        .unwrap();
        assert_eq!(config.auth.access_key, "AKIDEXAMPLE");
        assert_eq!(config.auth.secret_key, "shhh");
    }
}
