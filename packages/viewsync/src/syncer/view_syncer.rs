use super::state::SyncerState;
use crate::client_handler::{ClientHandler, HandlerOptions};
use crate::cvr::{
    apply_results, catchup_patches, cookie_to_version, result_as_delta, ClientId, Cvr,
    CvrStore, CvrVersion, NullableCvrVersion, PatchToVersion, QueryHash,
};
use crate::engine::operators::Operator;
use crate::engine::pipeline::Pipeline;
use crate::engine::replica::Replica;
use crate::engine::types::{Change, RowChangeEvent, VersionedBatch};
use crate::error::{CvrError, PipelineError, SyncError};
use crate::schema::ReplicaSchema;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, instrument, warn};
use viewsync_protocol::{
    ConnectParams, Downstream, QueriesPatchOp, SchemaVersions, MIN_SERVER_SUPPORTED_SYNC_PROTOCOL,
};

pub struct ConnectRequest {
    pub params: ConnectParams,
    pub protocol_version: u32,
    pub desired_queries_patch: Vec<QueriesPatchOp>,
}

/// A change to one client's subscriptions, validated against the schema.
enum DesiredChange {
    Put(QueryHash, Operator),
    Del(QueryHash),
    Clear,
}

/// A new record plus what to send once it is durable.
struct Step {
    cvr: Cvr,
    patches: Vec<PatchToVersion>,
    /// Clients that get a catch-up poke from their base version instead of
    /// the step's patches.
    catchup: Vec<ClientId>,
}

/// Snapshot of a syncer for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub group_id: String,
    pub state: SyncerState,
    pub version: String,
    pub replica_version: Option<u64>,
    pub clients: Vec<String>,
    pub connected: Vec<String>,
    pub queries: usize,
    pub rows: usize,
    pub commit_pending: bool,
}

/// Owns one client group: its record, its query pipelines and the
/// handlers of its connected clients.
///
/// Every operation runs to completion before the next one starts. A step
/// computes a new record from a clone of the current one, commits it, and
/// only then adopts it and pokes clients, so nothing is sent for a version
/// that is not durable.
pub struct ViewSyncer {
    group_id: String,
    state: SyncerState,
    schema: Arc<ReplicaSchema>,
    store: Arc<dyn CvrStore>,
    cvr: Cvr,
    /// Version last written to the store, if any.
    committed: NullableCvrVersion,
    pipelines: BTreeMap<QueryHash, Pipeline>,
    handlers: BTreeMap<ClientId, ClientHandler>,
    /// Step whose commit failed transiently and must be retried.
    pending: Option<Step>,
}

impl ViewSyncer {
    pub fn load(
        group_id: &str,
        schema: Arc<ReplicaSchema>,
        store: Arc<dyn CvrStore>,
    ) -> Result<Self, SyncError> {
        let (cvr, committed) = match store.load(group_id)? {
            Some(cvr) => {
                let version = cvr.version.clone();
                (cvr, Some(version))
            }
            None => (Cvr::new(group_id), None),
        };
        debug!(
            client_group = group_id,
            version = %cvr.version,
            queries = cvr.queries.len(),
            "view syncer loaded"
        );
        Ok(Self {
            group_id: group_id.to_string(),
            state: SyncerState::Idle,
            schema,
            store,
            cvr,
            committed,
            pipelines: BTreeMap::new(),
            handlers: BTreeMap::new(),
            pending: None,
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn state(&self) -> SyncerState {
        self.state
    }

    pub fn cvr(&self) -> &Cvr {
        &self.cvr
    }

    pub fn version(&self) -> &CvrVersion {
        &self.cvr.version
    }

    pub fn replica_version(&self) -> Option<u64> {
        self.cvr.replica_version
    }

    pub fn client_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending.is_some()
    }

    pub fn summary(&self) -> GroupSummary {
        GroupSummary {
            group_id: self.group_id.clone(),
            state: self.state,
            version: self.cvr.version.to_cookie(),
            replica_version: self.cvr.replica_version,
            clients: self.cvr.clients.keys().cloned().collect(),
            connected: self.handlers.keys().cloned().collect(),
            queries: self.cvr.queries.len(),
            rows: self.cvr.rows.values().filter(|r| r.contents.is_some()).count(),
            commit_pending: self.pending.is_some(),
        }
    }

    /// Run every query of the record against `replica` and bring the record
    /// in line with the results.
    #[instrument(skip_all, fields(client_group = %self.group_id))]
    pub fn hydrate(&mut self, replica: &Replica) -> Result<(), SyncError> {
        if self.state != SyncerState::Idle {
            return Err(self.invalid_state("hydrate"));
        }
        self.state = SyncerState::Hydrating;
        let started = Instant::now();
        let result = self.hydrate_all(replica).and_then(|step| match step {
            Some(step) => self.commit_step(step),
            None => Ok(()),
        });
        // A transient commit failure leaves the step pending; the group
        // streams once it is retried.
        if !result.as_ref().is_err_and(|e| e.is_fatal_to_group()) {
            self.state = SyncerState::Streaming;
        }
        self.guard(result)?;
        info!(
            version = %self.cvr.version,
            replica_version = ?self.cvr.replica_version,
            queries = self.pipelines.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "hydrated"
        );
        Ok(())
    }

    fn hydrate_all(&mut self, replica: &Replica) -> Result<Option<Step>, SyncError> {
        let mut next = self.cvr.clone();
        next.ensure_client_metadata_query(&self.schema.clients_table);

        let mut pipelines = BTreeMap::new();
        let mut results = Vec::with_capacity(next.queries.len());
        for (hash, query) in &next.queries {
            let mut pipeline = build_pipeline(hash, &query.ast, &self.schema)?;
            let full = pipeline.hydrate(replica).map_err(|source| SyncError::Pipeline {
                query: hash.clone(),
                source,
            })?;
            results.push((hash.clone(), result_as_delta(&next, hash, full)));
            pipelines.insert(hash.clone(), pipeline);
        }
        self.pipelines = pipelines;

        let version = next.version.next(replica.version());
        let mut patches = apply_results(&mut next, &results, &version);
        let hashes: Vec<QueryHash> = next.queries.keys().cloned().collect();
        patches.extend(hashes.iter().filter_map(|h| next.mark_materialized(h, &version)));

        let changed = !patches.is_empty()
            || self.committed.is_none()
            || next.replica_version != replica.version()
            || next.queries.len() != self.cvr.queries.len();
        if !changed {
            return Ok(None);
        }
        next.version = version;
        next.replica_version = replica.version();
        Ok(Some(Step {
            cvr: next,
            patches,
            catchup: Vec::new(),
        }))
    }

    /// Attach a client connection. Errors that only concern this connection
    /// are returned without touching the group; the caller reports them to
    /// the client. Group-fatal errors also stop the syncer.
    #[instrument(skip_all, fields(client_group = %self.group_id, client_id = %request.params.client_id))]
    pub fn connect(
        &mut self,
        request: ConnectRequest,
        sink: UnboundedSender<Downstream>,
        replica: &Replica,
    ) -> Result<(), SyncError> {
        self.ensure_accepting("connect")?;
        let params = &request.params;
        if request.protocol_version < MIN_SERVER_SUPPORTED_SYNC_PROTOCOL {
            return Err(SyncError::VersionNotSupported(request.protocol_version));
        }
        if !self.schema.schema_versions.supports(params.schema_version) {
            return Err(SyncError::SchemaVersionNotSupported(params.schema_version));
        }
        let base = cookie_to_version(params.base_cookie())
            .map_err(|e| SyncError::InvalidBaseCookie(e.to_string()))?;
        let (changes, mut new_pipelines) = self.parse_desired(&request.desired_queries_patch)?;

        if self.state == SyncerState::Idle {
            self.hydrate(replica)?;
        }
        if let Some(base) = &base {
            if *base > self.cvr.version {
                return Err(SyncError::BaseCookieAhead {
                    base: base.to_cookie(),
                    current: self.cvr.version.to_cookie(),
                });
            }
        }

        let client_id = params.client_id.clone();
        if let Some(mut previous) = self.handlers.remove(&client_id) {
            previous.close("replaced");
        }

        let mut next = self.cvr.clone();
        let version = next.version.next(None);
        let mut patches = Vec::new();
        let mut changed = false;
        if let Some(patch) = next.put_client(&client_id, &version) {
            patches.push(patch);
            changed = true;
        }
        if let Some(record) = next.clients.get_mut(&client_id) {
            if record.schema_version != params.schema_version
                || record.protocol_version != request.protocol_version
                || record.acked_version != base
            {
                record.schema_version = params.schema_version;
                record.protocol_version = request.protocol_version;
                record.acked_version = base.clone();
                changed = true;
            }
        }
        let result = self.apply_desired(
            &mut next,
            &client_id,
            changes,
            &mut new_pipelines,
            &version,
            replica,
            &mut patches,
        );
        self.guard(result)?;
        changed |= !patches.is_empty();

        let mut handler = ClientHandler::new(
            HandlerOptions {
                group_id: self.group_id.clone(),
                client_id: client_id.clone(),
                wsid: params.wsid.clone().unwrap_or_default(),
                protocol_version: request.protocol_version,
                schema_version: params.schema_version,
                clients_table: self.schema.clients_table.clone(),
                base_version: base,
                visible_queries: next.visible_queries(&client_id),
            },
            sink,
        );
        handler.send_connected(None);
        self.handlers.insert(client_id.clone(), handler);
        info!(clients = self.handlers.len(), "client connected");

        if changed {
            next.version = version;
            let result = self.commit_step(Step {
                cvr: next,
                patches,
                catchup: vec![client_id],
            });
            self.guard(result)
        } else {
            self.deliver(&[], &[client_id]);
            Ok(())
        }
    }

    /// Apply a client's subscription changes.
    #[instrument(skip_all, fields(client_group = %self.group_id, client_id = %client_id))]
    pub fn change_desired_queries(
        &mut self,
        client_id: &str,
        ops: &[QueriesPatchOp],
        replica: &Replica,
    ) -> Result<(), SyncError> {
        if self.state != SyncerState::Streaming {
            return Err(self.not_accepting("change desired queries"));
        }
        self.ensure_no_pending()?;
        if !self.handlers.contains_key(client_id) {
            return Err(SyncError::ClientNotFound(client_id.to_string()));
        }
        let (changes, mut new_pipelines) = self.parse_desired(ops)?;

        let mut next = self.cvr.clone();
        let version = next.version.next(None);
        let mut patches = Vec::new();
        let result = self.apply_desired(
            &mut next,
            client_id,
            changes,
            &mut new_pipelines,
            &version,
            replica,
            &mut patches,
        );
        self.guard(result)?;
        if patches.is_empty() {
            return Ok(());
        }
        next.version = version;
        let result = self.commit_step(Step {
            cvr: next,
            patches,
            catchup: Vec::new(),
        });
        self.guard(result)
    }

    /// Incorporate one upstream batch that has already been applied to the
    /// replica. Batches at or below the record's replica version are
    /// ignored.
    #[instrument(skip_all, fields(client_group = %self.group_id, version = batch.version))]
    pub fn process_batch(&mut self, batch: &VersionedBatch) -> Result<(), SyncError> {
        match self.state {
            SyncerState::Streaming => {}
            SyncerState::Idle | SyncerState::Draining => {
                debug!(state = %self.state, "batch ignored");
                return Ok(());
            }
            _ => return Err(self.invalid_state("process batch")),
        }
        self.ensure_no_pending()?;
        if self.cvr.replica_version.is_some_and(|v| batch.version <= v) {
            debug!(replica_version = ?self.cvr.replica_version, "batch already applied");
            return Ok(());
        }

        let results = run_pipelines(&mut self.pipelines, &batch.changes);
        let results = self.guard(results)?;

        let mut next = self.cvr.clone();
        let version = next.version.next(Some(batch.version));
        let patches = apply_results(&mut next, &results, &version);
        next.version = version;
        next.replica_version = Some(batch.version);
        debug!(
            changes = batch.changes.len(),
            patches = patches.len(),
            version = %next.version,
            "batch processed"
        );
        let result = self.commit_step(Step {
            cvr: next,
            patches,
            catchup: Vec::new(),
        });
        self.guard(result)
    }

    /// Retry a step whose commit failed transiently. Returns whether there
    /// was one.
    pub fn retry_pending(&mut self) -> Result<bool, SyncError> {
        let Some(step) = self.pending.take() else {
            return Ok(false);
        };
        let result = self.commit_step(step);
        self.guard(result)?;
        Ok(true)
    }

    /// Detach a connection. A stale wsid (the client reconnected since) is
    /// ignored.
    pub fn remove_handler(&mut self, client_id: &str, wsid: &str) -> bool {
        let current = self.handlers.get(client_id).is_some_and(|h| h.wsid() == wsid);
        if !current {
            return false;
        }
        if let Some(mut handler) = self.handlers.remove(client_id) {
            handler.close("disconnected");
        }
        debug!(client_group = %self.group_id, client_id, clients = self.handlers.len(), "client disconnected");
        true
    }

    /// Stop accepting work. Call [`ViewSyncer::stop`] once in-flight work
    /// is done.
    pub fn drain(&mut self) {
        if matches!(
            self.state,
            SyncerState::Idle | SyncerState::Hydrating | SyncerState::Streaming
        ) {
            info!(client_group = %self.group_id, clients = self.handlers.len(), "draining");
            self.state = SyncerState::Draining;
        }
    }

    /// Close every client and stop. Drained clients are told to reconnect
    /// elsewhere. The record stays as last committed.
    pub fn stop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let drained = self.state == SyncerState::Draining;
        for handler in self.handlers.values_mut() {
            if drained {
                handler.fail(&SyncError::Rebalance);
            } else {
                handler.close("stopped");
            }
        }
        self.handlers.clear();
        self.pipelines.clear();
        if self.pending.take().is_some() {
            warn!(client_group = %self.group_id, "stopping with an uncommitted step");
        }
        self.state = SyncerState::Stopped;
        info!(client_group = %self.group_id, version = %self.cvr.version, "stopped");
    }

    /// Tear the group down after a fatal error. Every client is told why.
    pub fn fail(&mut self, err: &SyncError) {
        if self.state.is_terminal() {
            return;
        }
        error!(client_group = %self.group_id, error = %err, "view syncer failed");
        for handler in self.handlers.values_mut() {
            handler.fail(err);
        }
        self.handlers.clear();
        self.pipelines.clear();
        self.pending = None;
        self.state = SyncerState::Stopped;
    }

    fn guard<T>(&mut self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        if let Err(err) = &result {
            if err.is_fatal_to_group() {
                self.fail(err);
            }
        }
        result
    }

    fn invalid_state(&self, op: &'static str) -> SyncError {
        SyncError::InvalidState {
            op,
            state: self.state.name(),
        }
    }

    fn not_accepting(&self, op: &'static str) -> SyncError {
        match self.state {
            SyncerState::Draining => SyncError::Rebalance,
            _ => self.invalid_state(op),
        }
    }

    fn ensure_accepting(&self, op: &'static str) -> Result<(), SyncError> {
        match self.state {
            SyncerState::Idle | SyncerState::Streaming => self.ensure_no_pending(),
            _ => Err(self.not_accepting(op)),
        }
    }

    fn ensure_no_pending(&self) -> Result<(), SyncError> {
        if self.pending.is_some() {
            return Err(CvrError::Transient("previous commit still pending".into()).into());
        }
        Ok(())
    }

    /// Validate a desired-queries patch. Queries new to the group get a
    /// pipeline built here so a bad query is rejected before anything
    /// changes.
    fn parse_desired(
        &self,
        ops: &[QueriesPatchOp],
    ) -> Result<(Vec<DesiredChange>, BTreeMap<QueryHash, Pipeline>), SyncError> {
        let mut changes = Vec::with_capacity(ops.len());
        let mut pipelines = BTreeMap::new();
        for op in ops {
            match op {
                QueriesPatchOp::Put { hash, ast } => {
                    let ast: Operator = serde_json::from_value(ast.clone()).map_err(|e| {
                        SyncError::InvalidMessage(format!("query {hash}: {e}"))
                    })?;
                    if !self.cvr.queries.contains_key(hash) && !pipelines.contains_key(hash) {
                        let pipeline = Pipeline::build(&ast, &self.schema).map_err(|e| {
                            SyncError::InvalidMessage(format!("query {hash}: {e}"))
                        })?;
                        pipelines.insert(hash.clone(), pipeline);
                    }
                    changes.push(DesiredChange::Put(hash.clone(), ast));
                }
                QueriesPatchOp::Del { hash } => changes.push(DesiredChange::Del(hash.clone())),
                QueriesPatchOp::Clear => changes.push(DesiredChange::Clear),
            }
        }
        Ok((changes, pipelines))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_desired(
        &mut self,
        next: &mut Cvr,
        client_id: &str,
        changes: Vec<DesiredChange>,
        new_pipelines: &mut BTreeMap<QueryHash, Pipeline>,
        version: &CvrVersion,
        replica: &Replica,
        patches: &mut Vec<PatchToVersion>,
    ) -> Result<(), SyncError> {
        for change in changes {
            match change {
                DesiredChange::Put(hash, ast) => {
                    let update = next.put_desired_queries(client_id, [(hash, ast)], version);
                    patches.extend(update.patches);
                    for hash in update.needs_hydration {
                        if replica.version() != next.replica_version {
                            return Err(SyncError::ReplicaMismatch {
                                replica: replica.version(),
                                syncer: next.replica_version,
                            });
                        }
                        let mut pipeline = match new_pipelines.remove(&hash) {
                            Some(p) => p,
                            None => {
                                let ast = next.queries.get(&hash).map(|q| q.ast.clone());
                                let ast = ast.ok_or_else(|| {
                                    SyncError::Internal(format!("query {hash} vanished"))
                                })?;
                                build_pipeline(&hash, &ast, &self.schema)?
                            }
                        };
                        let started = Instant::now();
                        let full = pipeline.hydrate(replica).map_err(|source| SyncError::Pipeline {
                            query: hash.clone(),
                            source,
                        })?;
                        debug!(
                            query = %hash,
                            rows = full.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "query hydrated"
                        );
                        patches.extend(apply_results(next, &[(hash.clone(), full)], version));
                        patches.extend(next.mark_materialized(&hash, version));
                        self.pipelines.insert(hash, pipeline);
                    }
                }
                DesiredChange::Del(hash) => {
                    patches.extend(next.del_desired_queries(client_id, [hash.as_str()], version));
                }
                DesiredChange::Clear => {
                    patches.extend(next.clear_desired_queries(client_id, version));
                }
            }
        }
        self.pipelines.retain(|hash, _| next.queries.contains_key(hash));
        Ok(())
    }

    fn commit_step(&mut self, step: Step) -> Result<(), SyncError> {
        if cfg!(debug_assertions) {
            step.cvr.check_consistency().map_err(SyncError::Internal)?;
        }
        match self.store.commit(&step.cvr, self.committed.as_ref()) {
            Ok(()) => {
                let Step {
                    cvr,
                    patches,
                    catchup,
                } = step;
                self.committed = Some(cvr.version.clone());
                self.cvr = cvr;
                self.deliver(&patches, &catchup);
                Ok(())
            }
            Err(err) if err.is_transient() => {
                warn!(client_group = %self.group_id, error = %err, "commit failed, will retry");
                self.pending = Some(step);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Poke every connected client up to the current version.
    fn deliver(&mut self, patches: &[PatchToVersion], catchup: &[ClientId]) {
        let version = self.cvr.version.clone();
        let schema_versions = Some(self.schema.schema_versions);
        for handler in self.handlers.values_mut() {
            let result = if catchup.iter().any(|c| c == handler.client_id()) {
                let patches = catchup_patches(&self.cvr, handler.client_id(), handler.base_version());
                poke(handler, &version, schema_versions, &patches)
            } else {
                poke(handler, &version, schema_versions, patches)
            };
            if let Err(err) = result {
                error!(client_id = %handler.client_id(), error = %err, "poke failed");
                handler.fail(&err);
            }
        }
        self.handlers.retain(|_, h| !h.is_closed());
    }
}

fn poke(
    handler: &mut ClientHandler,
    version: &CvrVersion,
    schema_versions: Option<SchemaVersions>,
    patches: &[PatchToVersion],
) -> Result<(), SyncError> {
    let mut poke = handler.start_poke(version, schema_versions);
    for patch in patches {
        poke.add_patch(patch);
    }
    poke.end(version)
}

fn build_pipeline(hash: &str, ast: &Operator, schema: &ReplicaSchema) -> Result<Pipeline, SyncError> {
    Pipeline::build(ast, schema).map_err(|source| SyncError::Pipeline {
        query: hash.to_string(),
        source,
    })
}

type QueryResults = Vec<(QueryHash, Vec<Change>)>;

/// Push a batch through every pipeline that reads one of its tables.
fn run_pipelines(
    pipelines: &mut BTreeMap<QueryHash, Pipeline>,
    events: &[RowChangeEvent],
) -> Result<QueryResults, SyncError> {
    let impacted = |p: &Pipeline| events.iter().any(|e| p.reads(&e.table));

    #[cfg(feature = "parallel")]
    let results: Vec<(QueryHash, Result<Vec<Change>, PipelineError>)> = {
        use rayon::prelude::*;
        pipelines
            .par_iter_mut()
            .filter(|(_, p)| impacted(p))
            .map(|(hash, p)| (hash.clone(), p.apply(events)))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let results: Vec<(QueryHash, Result<Vec<Change>, PipelineError>)> = pipelines
        .iter_mut()
        .filter(|(_, p)| impacted(p))
        .map(|(hash, p)| (hash.clone(), p.apply(events)))
        .collect();

    let mut out = Vec::with_capacity(results.len());
    for (hash, result) in results {
        match result {
            Ok(changes) if changes.is_empty() => {}
            Ok(changes) => out.push((hash, changes)),
            Err(source) => return Err(SyncError::Pipeline { query: hash, source }),
        }
    }
    Ok(out)
}
