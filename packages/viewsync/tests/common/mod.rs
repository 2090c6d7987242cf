//! Shared fixtures for the viewsync integration tests.
//!
//! Provides a small issue tracker schema, replica and batch builders, and a
//! helper that connects clients to a syncer and collects what they receive.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use ulid::Ulid;
use viewsync::engine::types::{row_from_json, Row};
use viewsync::engine::{RowChangeEvent, VersionedBatch};
use viewsync::schema::DEFAULT_CLIENTS_TABLE;
use viewsync::{
    ConnectRequest, MemoryCvrStore, Operator, Replica, ReplicaSchema, SchemaConfig, SyncError,
    ViewSyncer,
};
use viewsync_protocol::{
    ConnectParams, Downstream, PokePartBody, QueriesPatchOp, RowPatchOp, PROTOCOL_VERSION,
};

/// Generate a unique id the way clients do.
pub fn generate_id() -> String {
    Ulid::new().to_string()
}

/// `issue` and `comment` tables, schema versions 1 through 3.
pub fn schema() -> Arc<ReplicaSchema> {
    let config: SchemaConfig = serde_json::from_value(json!({
        "schemaVersions": {"minSupportedVersion": 1, "maxSupportedVersion": 3},
        "tables": {
            "issue": {
                "primaryKey": ["id"],
                "columns": {"id": "number", "title": "string", "open": "boolean", "owner": "string", "points": "number"}
            },
            "comment": {
                "primaryKey": ["id"],
                "columns": {"id": "number", "issueId": "number", "body": "string"}
            }
        }
    }))
    .expect("valid schema");
    Arc::new(ReplicaSchema::from_config(config, DEFAULT_CLIENTS_TABLE).expect("valid schema"))
}

pub fn row(value: Value) -> Row {
    row_from_json(value)
}

pub fn issue(id: i64, title: &str, open: bool) -> Row {
    row(json!({"id": id, "title": title, "open": open, "owner": "ann", "points": id}))
}

pub fn comment(id: i64, issue_id: i64, body: &str) -> Row {
    row(json!({"id": id, "issueId": issue_id, "body": body}))
}

pub fn batch(version: u64, changes: Vec<RowChangeEvent>) -> VersionedBatch {
    VersionedBatch { version, changes }
}

/// Replica with `batches` applied in order.
pub fn replica(schema: &ReplicaSchema, batches: Vec<VersionedBatch>) -> Replica {
    let mut replica = Replica::new();
    for b in batches {
        replica.apply(schema, b).expect("batch applies");
    }
    replica
}

pub fn ast(value: Value) -> Operator {
    serde_json::from_value(value).expect("valid query")
}

pub fn scan(table: &str) -> Value {
    json!({"op": "scan", "table": table})
}

pub fn open_issues() -> Value {
    json!({"op": "scan", "table": "issue", "filter": {"type": "eq", "field": "open", "value": true}})
}

pub fn put_query(hash: &str, ast: Value) -> QueriesPatchOp {
    QueriesPatchOp::Put {
        hash: hash.to_string(),
        ast,
    }
}

pub fn syncer(group: &str, schema: Arc<ReplicaSchema>) -> (ViewSyncer, Arc<MemoryCvrStore>) {
    let store = Arc::new(MemoryCvrStore::new());
    let syncer = ViewSyncer::load(group, schema, store.clone()).expect("load");
    (syncer, store)
}

/// A connected test client.
pub struct TestClient {
    pub client_id: String,
    pub wsid: String,
    pub rx: UnboundedReceiver<Downstream>,
}

impl TestClient {
    pub fn messages(&mut self) -> Vec<Downstream> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// All poke parts received since the last call.
    pub fn parts(&mut self) -> Vec<PokePartBody> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Downstream::PokePart(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

pub fn rows_in(parts: &[PokePartBody]) -> Vec<RowPatchOp> {
    parts
        .iter()
        .flat_map(|p| p.rows_patch.clone().unwrap_or_default())
        .collect()
}

/// Cookie of the last `pokeEnd` in `messages`.
pub fn last_cookie(messages: &[Downstream]) -> Option<String> {
    messages.iter().rev().find_map(|m| match m {
        Downstream::PokeEnd(end) if !end.cancel => end.cookie.clone(),
        _ => None,
    })
}

pub fn connect(
    syncer: &mut ViewSyncer,
    replica: &Replica,
    client_id: &str,
    base_cookie: Option<String>,
    queries: Vec<QueriesPatchOp>,
) -> Result<TestClient, SyncError> {
    connect_with(syncer, replica, client_id, base_cookie, queries, 2, PROTOCOL_VERSION)
}

pub fn connect_with(
    syncer: &mut ViewSyncer,
    replica: &Replica,
    client_id: &str,
    base_cookie: Option<String>,
    queries: Vec<QueriesPatchOp>,
    schema_version: u32,
    protocol_version: u32,
) -> Result<TestClient, SyncError> {
    let (tx, rx) = unbounded_channel();
    let wsid = generate_id();
    let request = ConnectRequest {
        params: ConnectParams {
            client_group_id: syncer.group_id().to_string(),
            client_id: client_id.to_string(),
            base_cookie,
            schema_version,
            wsid: Some(wsid.clone()),
        },
        protocol_version,
        desired_queries_patch: queries,
    };
    syncer.connect(request, tx, replica)?;
    Ok(TestClient {
        client_id: client_id.to_string(),
        wsid,
        rx,
    })
}
