//! Background reaper for expired multipart uploads.
//!
//! A timer task that periodically asks the metadata store for uploads
//! past TTL and clears their staged part bytes.  It takes no locks of
//! its own; every call it makes is an ordinary thread-safe store
//! operation, so it composes with live traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metadata::store::MetadataStore;
use crate::storage::backend::StorageBackend;

/// Handle to a running reaper task. Dropping the handle does not stop
/// the task; call [`ReaperHandle::shutdown`].
pub struct ReaperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the task and wait for it to finish its current tick.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the reaper. `interval` is the tick period; `ttl_seconds` is
/// forwarded to [`MetadataStore::reap_expired_uploads`] on every tick.
pub fn spawn(
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageBackend>,
    ttl_seconds: u64,
    interval: Duration,
) -> ReaperHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick of tokio's interval fires immediately; skip it
        // so startup recovery (which just ran) is not duplicated.
        ticker.tick().await;
        info!(ttl_seconds, interval_secs = interval.as_secs(), "upload reaper running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_tick(metadata.as_ref(), storage.as_ref(), ttl_seconds).await;
                }
                _ = stopped.changed() => {
                    if *stopped.borrow() {
                        info!("upload reaper stopping");
                        break;
                    }
                }
            }
        }
    });
    ReaperHandle { stop, task }
}

/// One reaper pass: expire rows, then drop the staged bytes for each
/// expired upload. Failures are logged and retried on the next tick.
pub async fn run_tick(
    metadata: &dyn MetadataStore,
    storage: &dyn StorageBackend,
    ttl_seconds: u64,
) {
    let expired = match metadata.reap_expired_uploads(ttl_seconds as i64).await {
        Ok(expired) => expired,
        Err(err) => {
            warn!(%err, "reaper failed to expire uploads");
            return;
        }
    };
    if expired.is_empty() {
        return;
    }
    info!(count = expired.len(), "reaper expired multipart uploads");
    for upload in expired {
        if let Err(err) = storage.delete_parts(&upload.bucket, &upload.upload_id).await {
            // Rows are already gone, so a failed byte sweep leaves
            // orphans the startup sweep will catch.
            warn!(upload_id = %upload.upload_id, %err, "reaper failed to delete staged parts");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::metadata::store::test_fixtures::{make_bucket, make_upload};
    use crate::storage::backend::PartSource;
    use crate::storage::memory::MemoryStorageBackend;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_tick_removes_expired_upload_and_parts() {
        let metadata = MemoryMetadataStore::new();
        let storage = MemoryStorageBackend::default();

        metadata.create_bucket(make_bucket("b")).await.unwrap();
        let mut stale = make_upload("b", "old.bin", "stale-upload");
        stale.initiated_at = "2020-01-01T00:00:00.000Z".to_string();
        metadata.create_multipart_upload(stale).await.unwrap();
        storage
            .put_part("b", "stale-upload", 1, Bytes::from("bytes"))
            .await
            .unwrap();

        run_tick(&metadata, &storage, 3600).await;

        assert!(metadata
            .get_multipart_upload("b", "old.bin", "stale-upload")
            .await
            .unwrap()
            .is_none());
        // Staged bytes are gone too, not just the rows.
        let err = storage
            .assemble_parts(
                "b",
                "k",
                "stale-upload",
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
    async fn test_tick_leaves_fresh_uploads() {
        let metadata = MemoryMetadataStore::new();
        let storage = MemoryStorageBackend::default();
        metadata.create_bucket(make_bucket("b")).await.unwrap();
        metadata
            .create_multipart_upload(make_upload("b", "new.bin", "fresh-upload"))
            .await
            .unwrap();

        run_tick(&metadata, &storage, 3600).await;

        assert!(metadata
            .get_multipart_upload("b", "new.bin", "fresh-upload")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_spawned_reaper_shuts_down() {
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorageBackend::default());
        let handle = spawn(metadata, storage, 3600, Duration::from_secs(60));
        handle.shutdown().await;
    }
}
