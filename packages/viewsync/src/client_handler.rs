//! Per-connection poke builder.
//!
//! A [`ClientHandler`] turns versioned patches into `pokeStart`, `pokePart`
//! and `pokeEnd` messages for one client. The client's base version only
//! moves when a poke ends successfully.

use crate::cvr::{
    version_to_nullable_cookie, ClientId, CvrVersion, NullableCvrVersion, Patch, PatchOp,
    PatchToVersion, QueryHash,
};
use crate::engine::types::{row_to_json, Datum, Row, RowId};
use crate::error::SyncError;
use smol_str::SmolStr;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};
use viewsync_protocol::{
    supports_revised_cookie_protocol, ClientsPatchOp, ConnectedBody, Downstream, PokeEndBody,
    PokePartBody, PokeStartBody, QueriesPatchOp, RowPatchOp, SchemaVersions,
};

/// Patches per `pokePart` before the body is flushed.
pub const PART_COUNT_FLUSH_THRESHOLD: usize = 100;

pub struct ClientHandler {
    group_id: String,
    client_id: ClientId,
    wsid: String,
    protocol_version: u32,
    schema_version: u32,
    clients_table: SmolStr,
    base_version: NullableCvrVersion,
    /// Queries whose rows this client sees.
    visible_queries: BTreeSet<QueryHash>,
    sink: Option<UnboundedSender<Downstream>>,
}

pub struct HandlerOptions {
    pub group_id: String,
    pub client_id: ClientId,
    pub wsid: String,
    pub protocol_version: u32,
    pub schema_version: u32,
    pub clients_table: SmolStr,
    pub base_version: NullableCvrVersion,
    pub visible_queries: BTreeSet<QueryHash>,
}

impl ClientHandler {
    pub fn new(options: HandlerOptions, sink: UnboundedSender<Downstream>) -> Self {
        Self {
            group_id: options.group_id,
            client_id: options.client_id,
            wsid: options.wsid,
            protocol_version: options.protocol_version,
            schema_version: options.schema_version,
            clients_table: options.clients_table,
            base_version: options.base_version,
            visible_queries: options.visible_queries,
            sink: Some(sink),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn wsid(&self) -> &str {
        &self.wsid
    }

    pub fn base_version(&self) -> &NullableCvrVersion {
        &self.base_version
    }

    pub fn is_closed(&self) -> bool {
        self.sink.as_ref().map_or(true, |s| s.is_closed())
    }

    /// Begin a poke towards `tentative`. Returns a no-op poke when the client
    /// already has that version or was failed for an unsupported schema.
    pub fn start_poke(
        &mut self,
        tentative: &CvrVersion,
        schema_versions: Option<SchemaVersions>,
    ) -> PokeHandler<'_> {
        let poke_id = tentative.to_cookie();
        if let Some(range) = schema_versions {
            if !range.supports(self.schema_version) {
                let err = SyncError::SchemaVersionNotSupported(self.schema_version);
                self.fail(&err);
                return PokeHandler::noop(self, poke_id);
            }
        }
        if self.base_version.as_ref().is_some_and(|base| base >= tentative) {
            debug!(
                client_id = %self.client_id,
                base = ?version_to_nullable_cookie(&self.base_version),
                tentative = %poke_id,
                "client already caught up"
            );
            return PokeHandler::noop(self, poke_id);
        }
        let start = PokeStartBody {
            poke_id: poke_id.clone(),
            base_cookie: version_to_nullable_cookie(&self.base_version),
            cookie: poke_id.clone(),
            schema_versions,
        };
        PokeHandler {
            handler: self,
            poke_id,
            start: Some(start),
            body: None,
            parts: 0,
            started: false,
            active: true,
        }
    }

    pub fn send_connected(&mut self, timestamp: Option<u64>) {
        let wsid = self.wsid.clone();
        self.send(Downstream::Connected(ConnectedBody { wsid, timestamp }));
    }

    /// Report an error to the client and close the connection.
    pub fn fail(&mut self, err: &SyncError) {
        info!(client_id = %self.client_id, kind = %err.error_kind(), error = %err, "failing connection");
        self.send(Downstream::Error(err.to_body()));
        self.close("error");
    }

    pub fn close(&mut self, reason: &str) {
        if self.sink.take().is_some() {
            debug!(client_id = %self.client_id, wsid = %self.wsid, reason, "closing connection");
        }
    }

    pub fn send(&mut self, message: Downstream) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };
        if sink.send(message).is_err() {
            debug!(client_id = %self.client_id, "connection went away");
            self.sink = None;
            return false;
        }
        true
    }

    fn sees(&self, refs: &[QueryHash]) -> bool {
        refs.iter().any(|h| self.visible_queries.contains(h))
    }

    /// Pull `lastMutationID` out of a client metadata row. Rows of other
    /// groups never reach the client.
    fn last_mutation_id(&self, row: &Row) -> Option<(String, u64)> {
        let group = row.get("clientGroupID").and_then(Datum::as_str);
        if group != Some(self.group_id.as_str()) {
            error!(
                client_group = %self.group_id,
                row_group = ?group,
                "client metadata row from another group"
            );
            return None;
        }
        let client_id = row.get("clientID").and_then(Datum::as_str)?;
        let lmid = row.get("lastMutationID").and_then(Datum::as_f64)?;
        Some((client_id.to_string(), lmid.max(0.0) as u64))
    }
}

pub struct PokeHandler<'a> {
    handler: &'a mut ClientHandler,
    poke_id: String,
    start: Option<PokeStartBody>,
    body: Option<PokePartBody>,
    parts: usize,
    started: bool,
    active: bool,
}

enum RowOp {
    Put(Row),
    Del,
}

impl<'a> PokeHandler<'a> {
    fn noop(handler: &'a mut ClientHandler, poke_id: String) -> Self {
        Self {
            handler,
            poke_id,
            start: None,
            body: None,
            parts: 0,
            started: false,
            active: false,
        }
    }

    pub fn is_noop(&self) -> bool {
        !self.active
    }

    pub fn add_patch(&mut self, patch: &PatchToVersion) {
        if !self.active {
            return;
        }
        if let Some(scope) = &patch.scope {
            if *scope != self.handler.client_id {
                return;
            }
        }
        if self
            .handler
            .base_version
            .as_ref()
            .is_some_and(|base| patch.to_version <= *base)
        {
            return;
        }

        match &patch.patch {
            Patch::Client { op, client_id } => {
                let entry = match op {
                    PatchOp::Put => ClientsPatchOp::Put {
                        client_id: client_id.clone(),
                    },
                    PatchOp::Del => ClientsPatchOp::Del {
                        client_id: client_id.clone(),
                    },
                };
                self.body().clients_patch.get_or_insert_with(Vec::new).push(entry);
            }
            Patch::Query {
                op,
                hash,
                ast,
                client_id,
            } => {
                let entry = match op {
                    PatchOp::Put => QueriesPatchOp::Put {
                        hash: hash.clone(),
                        ast: ast
                            .as_ref()
                            .and_then(|a| serde_json::to_value(a).ok())
                            .unwrap_or_default(),
                    },
                    PatchOp::Del => QueriesPatchOp::Del { hash: hash.clone() },
                };
                match client_id {
                    Some(client_id) => {
                        if *client_id == self.handler.client_id {
                            match op {
                                PatchOp::Put => self.handler.visible_queries.insert(hash.clone()),
                                PatchOp::Del => self.handler.visible_queries.remove(hash),
                            };
                        }
                        self.body()
                            .desired_queries_patches
                            .get_or_insert_with(BTreeMap::new)
                            .entry(client_id.clone())
                            .or_default()
                            .push(entry);
                    }
                    None => {
                        self.body().queries_patch.get_or_insert_with(Vec::new).push(entry);
                    }
                }
            }
            Patch::Row {
                op,
                id,
                contents,
                refs,
            } => {
                if id.table == self.handler.clients_table {
                    if let (PatchOp::Put, Some(row)) = (op, contents) {
                        if let Some((client_id, lmid)) = self.handler.last_mutation_id(row) {
                            self.body()
                                .last_mutation_id_changes
                                .get_or_insert_with(BTreeMap::new)
                                .insert(client_id, lmid);
                        }
                    }
                } else {
                    let forwarded = if patch.scope.is_some() {
                        match op {
                            PatchOp::Put => contents.clone().map(RowOp::Put),
                            PatchOp::Del => Some(RowOp::Del),
                        }
                    } else {
                        let before = self.handler.sees(&refs.before);
                        let after = self.handler.sees(&refs.after);
                        match op {
                            PatchOp::Put if after && (!before || refs.contents_changed) => {
                                contents.clone().map(RowOp::Put)
                            }
                            PatchOp::Put | PatchOp::Del if before && !after => Some(RowOp::Del),
                            _ => None,
                        }
                    };
                    let Some(row_op) = forwarded else {
                        return;
                    };
                    let entry = row_patch(id, row_op);
                    self.body().rows_patch.get_or_insert_with(Vec::new).push(entry);
                }
            }
        }

        self.parts += 1;
        if self.parts >= PART_COUNT_FLUSH_THRESHOLD {
            self.flush();
        }
    }

    /// Abort the poke. The client drops what it received of it.
    pub fn cancel(mut self) {
        self.send_cancel();
    }

    fn send_cancel(&mut self) {
        if self.started {
            self.body = None;
            let end = PokeEndBody {
                poke_id: self.poke_id.clone(),
                cookie: None,
                cancel: true,
            };
            self.handler.send(Downstream::PokeEnd(end));
        }
    }

    /// Finish the poke at `final_version` and make it the client's base.
    /// An empty poke still advances the client when the version moved.
    pub fn end(mut self, final_version: &CvrVersion) -> Result<(), SyncError> {
        if !self.active {
            return Ok(());
        }
        if !self.started {
            if self.handler.base_version.as_ref() == Some(final_version) {
                return Ok(());
            }
            if let Some(mut start) = self.start.take() {
                start.cookie = final_version.to_cookie();
                self.started = true;
                self.handler.send(Downstream::PokeStart(start));
            }
        } else if self
            .handler
            .base_version
            .as_ref()
            .is_some_and(|base| base >= final_version)
        {
            self.send_cancel();
            return Err(SyncError::Internal(format!(
                "poke {} ended at {final_version}, not after base {:?}",
                self.poke_id,
                version_to_nullable_cookie(&self.handler.base_version)
            )));
        }
        self.flush();
        let cookie = supports_revised_cookie_protocol(self.handler.protocol_version)
            .then(|| final_version.to_cookie());
        self.handler.send(Downstream::PokeEnd(PokeEndBody {
            poke_id: self.poke_id.clone(),
            cookie,
            cancel: false,
        }));
        self.handler.base_version = Some(final_version.clone());
        Ok(())
    }

    fn body(&mut self) -> &mut PokePartBody {
        if !self.started {
            if let Some(start) = self.start.take() {
                self.handler.send(Downstream::PokeStart(start));
            }
            self.started = true;
        }
        self.body
            .get_or_insert_with(|| PokePartBody::new(self.poke_id.clone()))
    }

    fn flush(&mut self) {
        if let Some(body) = self.body.take() {
            self.handler.send(Downstream::PokePart(body));
        }
        self.parts = 0;
    }
}

fn row_patch(id: &RowId, op: RowOp) -> RowPatchOp {
    match op {
        RowOp::Put(row) => RowPatchOp::Put {
            table_name: id.table.to_string(),
            value: row_to_json(&row),
        },
        RowOp::Del => RowPatchOp::Del {
            table_name: id.table.to_string(),
            id: id.key.to_json(),
        },
    }
}
