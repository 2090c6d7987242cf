//! Server state backed by a temporary directory.

#![allow(dead_code)]

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use viewsync::ConnectRequest;
use viewsync_protocol::{ConnectParams, Downstream, QueriesPatchOp, PROTOCOL_VERSION};
use viewsync_server::config::Config;
use viewsync_server::metrics::Metrics;
use viewsync_server::AppState;

pub const SECRET: &str = "test-secret";

pub struct TestServer {
    pub state: AppState,
    // Dropped last so the files outlive the state.
    pub dir: TempDir,
}

pub fn server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = dir.path().join("schema.json");
    let schema = json!({
        "schemaVersions": {"minSupportedVersion": 1, "maxSupportedVersion": 1},
        "tables": {
            "issue": {
                "primaryKey": ["id"],
                "columns": {"id": "number", "title": "string", "open": "boolean"}
            }
        }
    });
    std::fs::write(&schema_path, schema.to_string()).unwrap();

    let vars: HashMap<&str, String> = HashMap::from([
        ("VIEWSYNC_TASK_ID", "task-test".to_string()),
        ("VIEWSYNC_WORKERS", "2".to_string()),
        ("VIEWSYNC_CVR_DB", dir.path().join("cvr.redb").display().to_string()),
        ("VIEWSYNC_REPLICA_FILE", dir.path().join("replica.cbor").display().to_string()),
        ("VIEWSYNC_SCHEMA_FILE", schema_path.display().to_string()),
        ("VIEWSYNC_DRAIN_TIMEOUT_MS", "200".to_string()),
        ("VIEWSYNC_AUTH_SECRET", SECRET.to_string()),
    ]);
    let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();
    let state = AppState::build(config, Arc::new(Metrics::disabled())).unwrap();
    TestServer { state, dir }
}

pub fn issue_batch(version: u64, issues: &[(i64, &str, bool)]) -> serde_json::Value {
    let changes: Vec<_> = issues
        .iter()
        .map(|(id, title, open)| {
            json!({"table": "issue", "op": "insert", "after": {"id": id, "title": title, "open": open}})
        })
        .collect();
    json!({"version": version, "changes": changes})
}

pub fn open_issues_query() -> QueriesPatchOp {
    QueriesPatchOp::Put {
        hash: "open-issues".to_string(),
        ast: json!({"op": "scan", "table": "issue", "filter": {"type": "eq", "field": "open", "value": true}}),
    }
}

pub fn connect_request(group: &str, client: &str, wsid: &str, queries: Vec<QueriesPatchOp>) -> ConnectRequest {
    ConnectRequest {
        params: ConnectParams {
            client_group_id: group.to_string(),
            client_id: client.to_string(),
            base_cookie: None,
            schema_version: 1,
            wsid: Some(wsid.to_string()),
        },
        protocol_version: PROTOCOL_VERSION,
        desired_queries_patch: queries,
    }
}

/// Receive messages up to and including the next `pokeEnd`.
pub async fn next_poke(rx: &mut UnboundedReceiver<Downstream>) -> Vec<Downstream> {
    let mut out = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a poke")
            .expect("connection closed before pokeEnd");
        let end = matches!(message, Downstream::PokeEnd(_));
        out.push(message);
        if end {
            return out;
        }
    }
}

/// Row puts in `messages` as (table, id) pairs.
pub fn row_puts(messages: &[Downstream]) -> Vec<(String, i64)> {
    messages
        .iter()
        .filter_map(|m| match m {
            Downstream::PokePart(part) => part.rows_patch.clone(),
            _ => None,
        })
        .flatten()
        .filter_map(|op| match op {
            viewsync_protocol::RowPatchOp::Put { table_name, value } => {
                value["id"].as_i64().map(|id| (table_name, id))
            }
            _ => None,
        })
        .collect()
}
