//! Owns the running syncers of this task, sharded over worker slots.

use crate::feed::ReplicaFeed;
use crate::metrics::Metrics;
use crate::syncer_service::{self, SyncerHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use viewsync::syncer::GroupSummary;
use viewsync::{CvrStore, Router, SyncError, ViewSyncer};

pub struct Dispatcher {
    router: Router,
    shards: Vec<Mutex<HashMap<String, SyncerHandle>>>,
    store: Arc<dyn CvrStore>,
    feed: Arc<ReplicaFeed>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(router: Router, store: Arc<dyn CvrStore>, feed: Arc<ReplicaFeed>, metrics: Arc<Metrics>) -> Self {
        let shards = (0..router.workers()).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            router,
            shards,
            store,
            feed,
            metrics,
        }
    }

    fn shard(&self, group_id: &str) -> (usize, &Mutex<HashMap<String, SyncerHandle>>) {
        let worker = self.router.worker_for(group_id);
        (worker, &self.shards[worker])
    }

    /// The running syncer for `group_id`, loading it from the store if it is
    /// not running or its task has exited.
    #[instrument(skip(self))]
    pub async fn handle_for(&self, group_id: &str) -> Result<SyncerHandle, SyncError> {
        let (worker, shard) = self.shard(group_id);
        let mut syncers = shard.lock().await;
        if let Some(handle) = syncers.get(group_id).filter(|h| !h.is_closed()) {
            return Ok(handle.clone());
        }
        let syncer = ViewSyncer::load(group_id, self.feed.schema().clone(), self.store.clone())?;
        let handle = syncer_service::spawn(syncer, self.feed.clone(), self.metrics.clone(), worker);
        info!(worker, "started view syncer");
        syncers.insert(group_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Running syncer for `group_id`, without starting one.
    pub async fn get(&self, group_id: &str) -> Option<SyncerHandle> {
        let (_, shard) = self.shard(group_id);
        let syncers = shard.lock().await;
        syncers.get(group_id).filter(|h| !h.is_closed()).cloned()
    }

    pub async fn summary(&self, group_id: &str) -> Option<GroupSummary> {
        self.get(group_id).await?.summary().await
    }

    pub async fn running(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.lock().await.values().filter(|h| !h.is_closed()).count();
        }
        count
    }

    /// Drain every syncer, one group at a time, spreading the work over
    /// `timeout` so clients do not all reconnect at once. A group that takes
    /// longer than `timeout` is abandoned. Returns the number of groups
    /// drained.
    #[instrument(skip(self))]
    pub async fn drain_all(&self, timeout: Duration) -> usize {
        let mut handles = Vec::new();
        for shard in &self.shards {
            handles.extend(shard.lock().await.drain().map(|(_, h)| h));
        }
        handles.retain(|h| !h.is_closed());
        if handles.is_empty() {
            return 0;
        }
        let started = Instant::now();
        let pace = timeout / handles.len() as u32;
        let total = handles.len();
        for (i, handle) in handles.into_iter().enumerate() {
            if tokio::time::timeout(timeout, handle.drain()).await.is_err() {
                warn!(client_group = handle.group_id(), "syncer did not drain in time");
            }
            if i + 1 < total && started.elapsed() < timeout {
                tokio::time::sleep(pace).await;
            }
        }
        info!(groups = total, elapsed_ms = started.elapsed().as_millis() as u64, "drained all syncers");
        total
    }
}
