use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, Semaphore, SemaphorePermit, broadcast};
use tracing::{debug, instrument};
use viewsync::error::ReplicaError;
use viewsync::{Replica, ReplicaSchema, VersionedBatch};

/// Batches a syncer may fall behind by before it is torn down.
pub const FEED_CAPACITY: usize = 1024;

/// The replica plus the broadcast of every batch applied to it.
///
/// A batch is applied and broadcast under the write lock, so a reader that
/// holds the read lock has already been sent every batch the replica
/// reflects.
pub struct ReplicaFeed {
    schema: Arc<ReplicaSchema>,
    replica: RwLock<Replica>,
    readers: Semaphore,
    tx: broadcast::Sender<Arc<VersionedBatch>>,
}

/// Read access to the replica, holding one of the bounded reader permits.
pub struct ReplicaReader<'a> {
    _permit: SemaphorePermit<'a>,
    guard: RwLockReadGuard<'a, Replica>,
}

impl Deref for ReplicaReader<'_> {
    type Target = Replica;

    fn deref(&self) -> &Replica {
        &self.guard
    }
}

impl ReplicaFeed {
    pub fn new(schema: Arc<ReplicaSchema>, replica: Replica, readers: usize) -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            schema,
            replica: RwLock::new(replica),
            readers: Semaphore::new(readers.max(1)),
            tx,
        }
    }

    pub fn schema(&self) -> &Arc<ReplicaSchema> {
        &self.schema
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<VersionedBatch>> {
        self.tx.subscribe()
    }

    /// Apply an upstream batch and broadcast the changes it actually made.
    #[instrument(skip_all, fields(version = batch.version, changes = batch.changes.len()))]
    pub async fn ingest(&self, batch: VersionedBatch) -> Result<Arc<VersionedBatch>, ReplicaError> {
        let mut replica = self.replica.write().await;
        let applied = Arc::new(replica.apply(&self.schema, batch)?);
        // No subscribers just means no group is active.
        let receivers = self.tx.send(applied.clone()).unwrap_or(0);
        debug!(applied = applied.changes.len(), receivers, "batch ingested");
        Ok(applied)
    }

    pub async fn read(&self) -> anyhow::Result<ReplicaReader<'_>> {
        let permit = self.readers.acquire().await?;
        let guard = self.replica.read().await;
        Ok(ReplicaReader {
            _permit: permit,
            guard,
        })
    }

    /// Unbounded read for snapshots and diagnostics.
    pub async fn snapshot(&self) -> RwLockReadGuard<'_, Replica> {
        self.replica.read().await
    }

    pub async fn version(&self) -> Option<u64> {
        self.replica.read().await.version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use viewsync::engine::RowChangeEvent;
    use viewsync::engine::types::row_from_json;

    fn feed() -> ReplicaFeed {
        let config = serde_json::from_value(json!({"tables": {"issue": {"primaryKey": ["id"]}}})).unwrap();
        let schema = Arc::new(ReplicaSchema::from_config(config, "_clients").unwrap());
        ReplicaFeed::new(schema, Replica::new(), 2)
    }

    fn insert(version: u64, id: i64) -> VersionedBatch {
        VersionedBatch {
            version,
            changes: vec![RowChangeEvent::insert("issue", row_from_json(json!({"id": id})))],
        }
    }

    #[tokio::test]
    async fn test_ingest_broadcasts_applied_batch() {
        let feed = feed();
        let mut rx = feed.subscribe();
        feed.ingest(insert(1, 1)).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.changes.len(), 1);
        assert_eq!(feed.version().await, Some(1));
        assert_eq!(feed.read().await.unwrap().row_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_batch_is_rejected_and_not_broadcast() {
        let feed = feed();
        feed.ingest(insert(2, 1)).await.unwrap();
        let mut rx = feed.subscribe();
        let err = feed.ingest(insert(2, 2)).await.unwrap_err();
        assert!(matches!(err, ReplicaError::StaleVersion { .. }));
        assert!(rx.try_recv().is_err());
    }
}
