use super::version::{CvrVersion, NullableCvrVersion};
use crate::engine::operators::Operator;
use crate::engine::types::{Row, RowId};
use crate::serde_util::entries;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

pub type ClientId = String;
pub type QueryHash = String;

/// Query hashes referencing a row. Rows rarely belong to many queries.
pub type QueryRefs = SmallVec<[QueryHash; 2]>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: ClientId,
    /// Version at which the client joined the group.
    pub patch_version: CvrVersion,
    /// Desired queries and the version at which each became desired.
    pub desired_queries: BTreeMap<QueryHash, CvrVersion>,
    /// Queries the client stopped desiring, kept so a reconnecting client
    /// with an older cookie learns to drop their rows.
    #[serde(default)]
    pub undesired_queries: BTreeMap<QueryHash, CvrVersion>,
    pub schema_version: u32,
    pub protocol_version: u32,
    /// Last cookie the client presented when connecting.
    #[serde(default)]
    pub acked_version: NullableCvrVersion,
}

impl ClientRecord {
    pub fn new(id: impl Into<ClientId>, version: CvrVersion) -> Self {
        Self {
            id: id.into(),
            patch_version: version,
            desired_queries: BTreeMap::new(),
            undesired_queries: BTreeMap::new(),
            schema_version: 0,
            protocol_version: 0,
            acked_version: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub hash: QueryHash,
    pub ast: Operator,
    /// Server-owned queries are visible to every client and never removed.
    #[serde(default)]
    pub internal: bool,
    pub desired_by: BTreeSet<ClientId>,
    /// Version at which the query was materialized for the group.
    pub patch_version: Option<CvrVersion>,
    /// Output rows currently in the query's result.
    pub rows: BTreeSet<RowId>,
}

impl QueryRecord {
    pub fn new(hash: impl Into<QueryHash>, ast: Operator) -> Self {
        Self {
            hash: hash.into(),
            ast,
            internal: false,
            desired_by: BTreeSet::new(),
            patch_version: None,
            rows: BTreeSet::new(),
        }
    }
}

/// What the group was last sent for one row. `contents` is `None` for a
/// tombstone: a row that was sent and later deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub contents: Option<Row>,
    pub version: CvrVersion,
}

/// Client View Record: everything the server believes a client group has.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cvr {
    pub id: String,
    pub version: CvrVersion,
    /// Upstream version the record reflects.
    pub replica_version: Option<u64>,
    pub clients: BTreeMap<ClientId, ClientRecord>,
    pub queries: BTreeMap<QueryHash, QueryRecord>,
    /// Queries removed from the group, by removal version.
    #[serde(default)]
    pub removed_queries: BTreeMap<QueryHash, CvrVersion>,
    #[serde(with = "entries")]
    pub rows: BTreeMap<RowId, RowRecord>,
}

impl Cvr {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: CvrVersion::initial(),
            replica_version: None,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            removed_queries: BTreeMap::new(),
            rows: BTreeMap::new(),
        }
    }

    /// Queries whose result currently contains `id`.
    pub fn refs(&self, id: &RowId) -> QueryRefs {
        self.queries
            .values()
            .filter(|q| q.rows.contains(id))
            .map(|q| q.hash.clone())
            .collect()
    }

    /// Whether a client sees query `hash`: it desires it, or it is internal.
    pub fn client_sees(&self, client: &ClientRecord, hash: &str) -> bool {
        client.desired_queries.contains_key(hash)
            || self.queries.get(hash).is_some_and(|q| q.internal)
    }

    pub fn visible_to(&self, client: &ClientRecord, id: &RowId) -> bool {
        self.queries
            .values()
            .any(|q| q.rows.contains(id) && self.client_sees(client, &q.hash))
    }

    /// Hashes a client sees, internal queries included.
    pub fn visible_queries(&self, client_id: &str) -> BTreeSet<QueryHash> {
        let mut out: BTreeSet<QueryHash> = self
            .queries
            .values()
            .filter(|q| q.internal)
            .map(|q| q.hash.clone())
            .collect();
        if let Some(client) = self.clients.get(client_id) {
            out.extend(client.desired_queries.keys().cloned());
        }
        out
    }

    /// Structural consistency of the record. Used by tests and debug
    /// builds after every commit.
    pub fn check_consistency(&self) -> Result<(), String> {
        for query in self.queries.values() {
            for id in &query.rows {
                match self.rows.get(id) {
                    Some(RowRecord {
                        contents: Some(_), ..
                    }) => {}
                    _ => return Err(format!("query {} references unsent row {id}", query.hash)),
                }
            }
            for client in &query.desired_by {
                let desired = self
                    .clients
                    .get(client)
                    .is_some_and(|c| c.desired_queries.contains_key(&query.hash));
                if !desired {
                    return Err(format!("{client} in desired_by of {} without desiring it", query.hash));
                }
            }
            if !query.internal && query.desired_by.is_empty() {
                return Err(format!("query {} is desired by no one", query.hash));
            }
        }
        for (id, record) in &self.rows {
            let referenced = !self.refs(id).is_empty();
            if record.contents.is_some() != referenced {
                return Err(format!("row {id} liveness does not match its references"));
            }
            if record.version > self.version {
                return Err(format!("row {id} is newer than the record"));
            }
        }
        for client in self.clients.values() {
            for hash in client.desired_queries.keys() {
                if !self.queries.contains_key(hash) {
                    return Err(format!("{} desires unknown query {hash}", client.id));
                }
            }
        }
        Ok(())
    }
}
