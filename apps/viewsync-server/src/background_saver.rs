use crate::feed::ReplicaFeed;
use crate::persistence;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Debounced snapshots of the replica.
pub struct BackgroundSaver {
    path: PathBuf,
    feed: Arc<ReplicaFeed>,
    notify: Arc<Notify>,
    shutdown: Arc<Notify>,
    stopped: Arc<Notify>,
    debounce_duration: Duration,
}

impl BackgroundSaver {
    pub fn new(path: PathBuf, feed: Arc<ReplicaFeed>, debounce_ms: u64) -> Self {
        Self {
            path,
            feed,
            notify: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            stopped: Arc::new(Notify::new()),
            debounce_duration: Duration::from_millis(debounce_ms),
        }
    }

    pub fn trigger_save(&self) {
        self.notify.notify_one();
    }

    pub async fn run(self: Arc<Self>) {
        info!("Background saver started");
        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    debug!("Change detected, waiting {:?} before saving", self.debounce_duration);
                    sleep(self.debounce_duration).await;

                    self.save_now().await;
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, performing final save");
                    self.save_now().await;
                    break;
                }
            }
        }
        info!("Background saver stopped");
        self.stopped.notify_one();
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once `run` has made its final save.
    pub async fn wait_stopped(&self) {
        self.stopped.notified().await;
    }

    pub async fn save_now(&self) {
        debug!("Saving replica snapshot...");
        let replica = self.feed.snapshot().await;
        if let Err(e) = persistence::save_replica(&self.path, &replica) {
            error!("Background save failed: {:#}", e);
        } else {
            debug!("Background save completed");
        }
    }
}
