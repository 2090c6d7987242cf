//! Runs one [`ViewSyncer`] as a task.
//!
//! The task owns the syncer and is the only thing that touches it. It
//! multiplexes commands from connections with batches from the replica
//! feed, and retries a commit that failed transiently before taking any
//! other work.

use crate::feed::ReplicaFeed;
use crate::metrics::Metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, warn};
use viewsync::syncer::GroupSummary;
use viewsync::{ConnectRequest, Replica, SyncError, SyncerState, VersionedBatch, ViewSyncer};
use viewsync_protocol::{Downstream, QueriesPatchOp};

const RETRY_MIN: Duration = Duration::from_millis(50);
const RETRY_MAX: Duration = Duration::from_secs(5);

type Reply<T> = oneshot::Sender<T>;

pub enum Command {
    Connect {
        request: ConnectRequest,
        sink: mpsc::UnboundedSender<Downstream>,
        reply: Reply<Result<(), SyncError>>,
    },
    ChangeDesiredQueries {
        client_id: String,
        ops: Vec<QueriesPatchOp>,
        reply: Reply<Result<(), SyncError>>,
    },
    Disconnect {
        client_id: String,
        wsid: String,
    },
    Summary {
        reply: Reply<GroupSummary>,
    },
    Drain {
        done: Reply<()>,
    },
}

/// Cheap, cloneable address of a running syncer task.
#[derive(Clone)]
pub struct SyncerHandle {
    group_id: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
}

fn stopped(op: &'static str) -> SyncError {
    SyncError::InvalidState {
        op,
        state: SyncerState::Stopped.name(),
    }
}

impl SyncerHandle {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Whether the task has exited. A stopped group is restarted by the
    /// dispatcher on the next connect.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn connect(
        &self,
        request: ConnectRequest,
        sink: mpsc::UnboundedSender<Downstream>,
    ) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect { request, sink, reply })
            .map_err(|_| stopped("connect"))?;
        rx.await.map_err(|_| stopped("connect"))?
    }

    pub async fn change_desired_queries(
        &self,
        client_id: &str,
        ops: Vec<QueriesPatchOp>,
    ) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ChangeDesiredQueries {
                client_id: client_id.to_string(),
                ops,
                reply,
            })
            .map_err(|_| stopped("change desired queries"))?;
        rx.await.map_err(|_| stopped("change desired queries"))?
    }

    pub fn disconnect(&self, client_id: &str, wsid: &str) {
        let _ = self.tx.send(Command::Disconnect {
            client_id: client_id.to_string(),
            wsid: wsid.to_string(),
        });
    }

    pub async fn summary(&self) -> Option<GroupSummary> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Summary { reply }).ok()?;
        rx.await.ok()
    }

    /// Ask the syncer to drain and wait until it has stopped.
    pub async fn drain(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Command::Drain { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start a task for `syncer`. It subscribes to the feed immediately, so no
/// batch applied after this call is missed.
pub fn spawn(
    syncer: ViewSyncer,
    feed: Arc<ReplicaFeed>,
    metrics: Arc<Metrics>,
    worker: usize,
) -> SyncerHandle {
    let (tx, commands) = mpsc::unbounded_channel();
    let group_id: Arc<str> = Arc::from(syncer.group_id());
    let span = info_span!("view_syncer", client_group = %group_id, worker);
    let service = GroupService {
        batches: feed.subscribe(),
        syncer,
        feed,
        metrics,
        retry_delay: RETRY_MIN,
    };
    tokio::spawn(service.run(commands).instrument(span));
    SyncerHandle { group_id, tx }
}

struct GroupService {
    syncer: ViewSyncer,
    feed: Arc<ReplicaFeed>,
    metrics: Arc<Metrics>,
    batches: broadcast::Receiver<Arc<VersionedBatch>>,
    retry_delay: Duration,
}

enum Flow {
    Continue,
    Stop,
}

impl GroupService {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.metrics.active_syncers.add(1, &[]);
        debug!("view syncer task started");
        loop {
            let pending = self.syncer.has_pending_commit();
            let flow = tokio::select! {
                _ = sleep(self.retry_delay), if pending => self.retry(),
                command = commands.recv(), if !pending => match command {
                    Some(command) => self.handle(command).await,
                    None => Flow::Stop,
                },
                batch = self.batches.recv(), if !pending => match batch {
                    Ok(batch) => self.process(&batch),
                    Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                    Err(RecvError::Closed) => Flow::Stop,
                },
            };
            if matches!(flow, Flow::Stop) || self.syncer.state().is_terminal() {
                break;
            }
        }
        self.syncer.stop();
        self.metrics.active_syncers.add(-1, &[]);
        info!(version = %self.syncer.version(), "view syncer task exited");
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect { request, sink, reply } => {
                let feed = self.feed.clone();
                let result = match feed.read().await {
                    Ok(replica) => {
                        self.catch_up(&replica);
                        let hydrating = self.syncer.state() == SyncerState::Idle
                            || !request.desired_queries_patch.is_empty();
                        let started = Instant::now();
                        let result = self.syncer.connect(request, sink, &replica);
                        if hydrating {
                            self.record_hydration(started);
                        }
                        result
                    }
                    Err(e) => Err(SyncError::Internal(e.to_string())),
                };
                self.note_transient(&result);
                let _ = reply.send(result);
            }
            Command::ChangeDesiredQueries {
                client_id,
                ops,
                reply,
            } => {
                let feed = self.feed.clone();
                let result = match feed.read().await {
                    Ok(replica) => {
                        self.catch_up(&replica);
                        let started = Instant::now();
                        let result = self.syncer.change_desired_queries(&client_id, &ops, &replica);
                        self.record_hydration(started);
                        result
                    }
                    Err(e) => Err(SyncError::Internal(e.to_string())),
                };
                self.note_transient(&result);
                let _ = reply.send(result);
            }
            Command::Disconnect { client_id, wsid } => {
                self.syncer.remove_handler(&client_id, &wsid);
            }
            Command::Summary { reply } => {
                let _ = reply.send(self.syncer.summary());
            }
            Command::Drain { done } => {
                self.syncer.drain();
                self.syncer.stop();
                let _ = done.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Process every batch already broadcast. Called under the replica read
    /// lock, after which the syncer has seen everything the replica holds.
    fn catch_up(&mut self, replica: &Replica) {
        loop {
            match self.batches.try_recv() {
                Ok(batch) => {
                    if matches!(self.process(&batch), Flow::Stop) || self.syncer.has_pending_commit() {
                        return;
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    self.lagged(skipped);
                    return;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        debug!(replica_version = ?replica.version(), syncer_version = ?self.syncer.replica_version(), "caught up with feed");
    }

    fn process(&mut self, batch: &VersionedBatch) -> Flow {
        let clients = self.syncer.client_count() as u64;
        match self.syncer.process_batch(batch) {
            Ok(()) => {
                self.metrics.batches_processed.add(1, &[]);
                self.metrics.pokes_sent.add(clients, &[]);
                Flow::Continue
            }
            Err(err) if err.is_transient() => {
                self.retry_delay = RETRY_MIN;
                Flow::Continue
            }
            Err(err) => {
                warn!(error = %err, "batch failed");
                if self.syncer.state().is_terminal() {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// The feed dropped batches this syncer never saw, so its state can no
    /// longer be trusted. Clients reconnect and re-hydrate.
    fn lagged(&mut self, skipped: u64) -> Flow {
        let err = SyncError::Internal(format!("fell behind the change feed by {skipped} batches"));
        self.syncer.fail(&err);
        Flow::Stop
    }

    fn retry(&mut self) -> Flow {
        self.metrics.commit_retries.add(1, &[]);
        match self.syncer.retry_pending() {
            Ok(_) => {
                debug!("pending commit succeeded");
                self.retry_delay = RETRY_MIN;
                Flow::Continue
            }
            Err(err) if err.is_transient() => {
                self.retry_delay = (self.retry_delay * 2).min(RETRY_MAX);
                warn!(error = %err, delay_ms = self.retry_delay.as_millis() as u64, "commit retry failed");
                Flow::Continue
            }
            Err(_) => Flow::Stop,
        }
    }

    fn note_transient(&mut self, result: &Result<(), SyncError>) {
        if result.as_ref().is_err_and(SyncError::is_transient) {
            self.retry_delay = RETRY_MIN;
        }
    }

    fn record_hydration(&self, started: Instant) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .hydration_duration
            .record(elapsed_ms, &[KeyValue::new("client_group", self.syncer.group_id().to_string())]);
    }
}
