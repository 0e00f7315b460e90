//! BleepStore storage engine.
//!
//! The core of an S3-compatible object store: a pluggable metadata
//! index ([`metadata::store::MetadataStore`]) and a pluggable byte
//! plane ([`storage::backend::StorageBackend`]), composed by the
//! [`engine::Engine`] coordinator which owns validation, the multipart
//! state machine, crash-only recovery, and the upload reaper.  The
//! [`serialization`] module renders the canonical metadata export.
//!
//! The HTTP surface (routing, XML, request signing) lives outside this
//! crate and consumes the engine through these interfaces.

use std::sync::Arc;

pub mod config;
pub mod engine;
pub mod errors;
pub mod gcp_auth;
pub mod metadata;
pub mod serialization;
pub mod storage;
pub mod types;

pub use engine::{CompletedPart, Engine, ObjectWriteOptions, Owner};
pub use errors::{StoreError, StoreResult};

use config::{Config, MetadataBackendKind, StorageBackendKind};
use metadata::store::MetadataStore;
use storage::backend::StorageBackend;

/// Construct the configured metadata store.
pub async fn open_metadata_store(config: &Config) -> StoreResult<Arc<dyn MetadataStore>> {
    let store: Arc<dyn MetadataStore> = match config.metadata.backend {
        MetadataBackendKind::LocalJsonl => Arc::new(metadata::jsonl::JsonlMetadataStore::open(
            &config.metadata.jsonl.root_dir,
            config.metadata.jsonl.compact_on_startup,
        )?),
        MetadataBackendKind::Sqlite => {
            let path = &config.metadata.sqlite.path;
            ensure_parent_dir(path)?;
            Arc::new(metadata::sqlite::SqliteMetadataStore::open(path)?)
        }
        MetadataBackendKind::Dynamodb => {
            let section = config.metadata.dynamodb.as_ref().ok_or_else(|| {
                StoreError::invalid(
                    "metadata.backend is 'dynamodb' but metadata.dynamodb section is missing",
                )
            })?;
            Arc::new(metadata::dynamodb::DynamoDbMetadataStore::connect(section).await?)
        }
        MetadataBackendKind::Cosmos => {
            let section = config.metadata.cosmos.as_ref().ok_or_else(|| {
                StoreError::invalid(
                    "metadata.backend is 'cosmos' but metadata.cosmos section is missing",
                )
            })?;
            Arc::new(metadata::cosmos::CosmosMetadataStore::connect(section)?)
        }
        MetadataBackendKind::Firestore => {
            let section = config.metadata.firestore.as_ref().ok_or_else(|| {
                StoreError::invalid(
                    "metadata.backend is 'firestore' but metadata.firestore section is missing",
                )
            })?;
            Arc::new(metadata::firestore::FirestoreMetadataStore::connect(section)?)
        }
        MetadataBackendKind::Memory => Arc::new(metadata::memory::MemoryMetadataStore::new()),
    };
    Ok(store)
}

/// Construct the configured storage backend.
pub async fn open_storage_backend(config: &Config) -> StoreResult<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config.storage.backend {
        StorageBackendKind::LocalFs => Arc::new(storage::local::LocalFsBackend::new(
            &config.storage.local.root_dir,
        )?),
        StorageBackendKind::SqliteBlob => {
            let path = &config.storage.sqlite.path;
            ensure_parent_dir(path)?;
            Arc::new(storage::sqlite::SqliteBlobBackend::open(path)?)
        }
        StorageBackendKind::Memory => Arc::new(storage::memory::MemoryStorageBackend::new(
            config.storage.memory.max_size_bytes,
        )),
        StorageBackendKind::Aws => {
            let section = config.storage.aws.as_ref().ok_or_else(|| {
                StoreError::invalid("storage.backend is 'aws' but storage.aws section is missing")
            })?;
            Arc::new(storage::aws::AwsGatewayBackend::connect(section).await?)
        }
        StorageBackendKind::Gcp => {
            let section = config.storage.gcp.as_ref().ok_or_else(|| {
                StoreError::invalid("storage.backend is 'gcp' but storage.gcp section is missing")
            })?;
            Arc::new(storage::gcp::GcpGatewayBackend::connect(section)?)
        }
        StorageBackendKind::Azure => {
            let section = config.storage.azure.as_ref().ok_or_else(|| {
                StoreError::invalid(
                    "storage.backend is 'azure' but storage.azure section is missing",
                )
            })?;
            Arc::new(storage::azure::AzureGatewayBackend::connect(section)?)
        }
    };
    Ok(backend)
}

fn ensure_parent_dir(path: &str) -> StoreResult<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Build the engine from configuration and run startup recovery.
/// Every startup is a recovery (crash-only); there is no separate
/// first-boot path.
pub async fn build_engine(config: &Config) -> StoreResult<Engine> {
    let metadata = open_metadata_store(config).await?;
    let storage = open_storage_backend(config).await?;
    let engine = Engine::new(metadata, storage, config);
    engine
        .recover(&config.auth.access_key, &config.auth.secret_key)
        .await?;
    Ok(engine)
}
