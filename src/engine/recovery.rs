//! Crash-only startup recovery.
//!
//! Every startup runs the same sequence; there is no separate "first
//! boot" or "after crash" branch:
//!
//! 1. The metadata substrate was already opened (WAL replay, schema
//!    DDL) by its constructor.
//! 2. Seed credentials from config, idempotently.
//! 3. Expire uploads past TTL in metadata.
//! 4. Sweep storage: clear scratch space and remove part staging areas
//!    whose upload id has no live row.
//! 5. Optionally reconcile storage against metadata (off by default):
//!    an object row whose bytes are missing is invariant breakage and
//!    gets logged loudly; orphan bytes are merely counted.

use tracing::{error, info, warn};

use super::Engine;
use crate::errors::StoreResult;
use crate::metadata::store::seed_credential_record;

/// What a recovery pass found and did.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Whether the seed credential was inserted (false = already there).
    pub seeded_credential: bool,
    /// Uploads removed because they were past TTL.
    pub expired_uploads: usize,
    /// Object records whose bytes were missing (reconcile only).
    pub missing_bytes: usize,
}

impl Engine {
    /// Run the full recovery sequence. Safe to call on every
    /// startup; a SIGKILL at any earlier point leaves state this
    /// sequence repairs.
    pub async fn recover(&self, access_key: &str, secret_key: &str) -> StoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        info!("crash-only startup: running recovery sequence");

        // Seed credentials, insert-if-absent so a rotated secret is
        // never clobbered by the config default.
        let already_present = self
            .metadata()
            .dump_credentials()
            .await?
            .iter()
            .any(|c| c.access_key_id == access_key);
        if !already_present {
            self.metadata()
                .put_credential(seed_credential_record(access_key, secret_key))
                .await?;
            report.seeded_credential = true;
            info!(access_key, "seeded default credential");
        }

        // Expire stale uploads first so the storage sweep sees the
        // final set of live ids.
        let expired = self
            .metadata()
            .reap_expired_uploads(self.multipart_ttl_seconds() as i64)
            .await?;
        report.expired_uploads = expired.len();
        for upload in &expired {
            self.storage()
                .delete_parts(&upload.bucket, &upload.upload_id)
                .await?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale multipart uploads");
        }

        // Storage sweep: scratch space and orphaned part staging.
        let live: Vec<String> = self
            .metadata()
            .dump_uploads()
            .await?
            .into_iter()
            .map(|u| u.upload_id)
            .collect();
        self.storage().sweep_expired_parts(&live).await?;

        if self.reconcile_on_startup {
            report.missing_bytes = self.reconcile().await?;
        }

        info!(
            expired = report.expired_uploads,
            missing = report.missing_bytes,
            "recovery sequence complete"
        );
        Ok(report)
    }

    /// Cross-check every object record against stored bytes. Metadata
    /// without bytes breaks the reachability invariant and is reported
    /// as an error-level event; the record is left in place for the
    /// operator.
    async fn reconcile(&self) -> StoreResult<usize> {
        let mut missing = 0usize;
        for record in self.metadata().dump_objects().await? {
            match self.storage().head_object(&record.bucket, &record.key).await {
                Ok(stat) => {
                    if stat.size != record.size {
                        warn!(
                            bucket = %record.bucket,
                            key = %record.key,
                            meta_size = record.size,
                            stored_size = stat.size,
                            "object size mismatch between metadata and storage"
                        );
                    }
                }
                Err(err) if err.is_not_found() => {
                    missing += 1;
                    error!(
                        bucket = %record.bucket,
                        key = %record.key,
                        "object record has no stored bytes"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{ObjectWriteOptions, Owner};
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::storage::memory::MemoryStorageBackend;
    use bytes::Bytes;
    use std::sync::Arc;

    fn owner() -> Owner {
        Owner {
            id: "o1".to_string(),
            display_name: "Owner".to_string(),
        }
    }

    fn engine_with_ttl(ttl: u64) -> Engine {
        let mut config = Config::default();
        config.engine.multipart_ttl_seconds = ttl;
        Engine::new(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryStorageBackend::default()),
            &config,
        )
    }

    #[tokio::test]
    async fn test_recovery_seeds_credential_once() {
        let engine = engine_with_ttl(3600);
        let report = engine.recover("ak", "sk").await.unwrap();
        assert!(report.seeded_credential);
        assert!(engine.get_credential("ak").await.unwrap().is_some());

        // Second startup: idempotent, no reseed.
        let report = engine.recover("ak", "sk").await.unwrap();
        assert!(!report.seeded_credential);
    }

    #[tokio::test]
    async fn test_recovery_expires_stale_uploads() {
        // TTL of zero expires everything on the next pass.
        let engine = engine_with_ttl(0);
        engine.create_bucket("b", None, &owner()).await.unwrap();
        let upload = engine
            .create_multipart_upload("b", "k", ObjectWriteOptions::default(), &owner())
            .await
            .unwrap();
        engine
            .upload_part("b", "k", &upload.upload_id, 1, Bytes::from("data"))
            .await
            .unwrap();

        // The reaper cutoff is strictly-before, so step past the
        // initiation timestamp's second.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let report = engine.recover("ak", "sk").await.unwrap();
        assert_eq!(report.expired_uploads, 1);
        assert!(engine
            .get_multipart_upload("b", "k", &upload.upload_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recovery_keeps_live_uploads() {
        let engine = engine_with_ttl(3600);
        engine.create_bucket("b", None, &owner()).await.unwrap();
        let upload = engine
            .create_multipart_upload("b", "k", ObjectWriteOptions::default(), &owner())
            .await
            .unwrap();
        engine
            .upload_part("b", "k", &upload.upload_id, 1, Bytes::from("data"))
            .await
            .unwrap();

        let report = engine.recover("ak", "sk").await.unwrap();
        assert_eq!(report.expired_uploads, 0);
        assert!(engine
            .get_multipart_upload("b", "k", &upload.upload_id)
            .await
            .unwrap()
            .is_some());
        // The staged part survived the sweep: completing still works.
        let parts = engine
            .list_parts("b", "k", &upload.upload_id, Default::default())
            .await
            .unwrap();
        assert_eq!(parts.parts.len(), 1);
    }
}
