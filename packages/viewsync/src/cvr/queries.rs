//! Client and query bookkeeping on a [`Cvr`].
//!
//! Every mutation returns the patches it implies at the version it was made
//! at. Patches that only concern the requesting client (rows it gains or
//! loses by changing its subscriptions) are scoped to it.

use super::patch::{Patch, PatchOp, PatchToVersion, RowRefs};
use super::types::{ClientRecord, Cvr, QueryHash, QueryRecord, RowRecord};
use super::version::CvrVersion;
use crate::engine::operators::{Operator, Predicate};
use crate::engine::types::{Datum, Path, RowId};
use std::collections::BTreeSet;
use viewsync_protocol::query_hash;

/// Result of a subscription request.
#[derive(Debug, Default)]
pub struct DesiredQueryUpdate {
    pub patches: Vec<PatchToVersion>,
    /// Queries that are new to the group and must be hydrated before their
    /// rows can be sent.
    pub needs_hydration: Vec<QueryHash>,
}

impl Cvr {
    /// Rows a client can currently see.
    pub fn visible_rows(&self, client_id: &str) -> BTreeSet<RowId> {
        let visible = self.visible_queries(client_id);
        self.queries
            .values()
            .filter(|q| visible.contains(&q.hash))
            .flat_map(|q| q.rows.iter().cloned())
            .collect()
    }

    /// Register a client. Returns a client put patch if it is new.
    pub fn put_client(&mut self, client_id: &str, version: &CvrVersion) -> Option<PatchToVersion> {
        if self.clients.contains_key(client_id) {
            return None;
        }
        self.clients
            .insert(client_id.to_string(), ClientRecord::new(client_id, version.clone()));
        Some(PatchToVersion::new(
            Patch::Client {
                op: PatchOp::Put,
                client_id: client_id.to_string(),
            },
            version.clone(),
        ))
    }

    /// Register the server-owned query over the client metadata table,
    /// restricted to this group. Returns its hash if it still has to be
    /// hydrated.
    pub fn ensure_client_metadata_query(&mut self, clients_table: &str) -> Option<QueryHash> {
        let ast = client_metadata_query(&self.id, clients_table);
        let hash = ast_hash(&ast);
        if self.queries.contains_key(&hash) {
            return None;
        }
        let mut record = QueryRecord::new(hash.clone(), ast);
        record.internal = true;
        self.queries.insert(hash.clone(), record);
        Some(hash)
    }

    pub fn put_desired_queries(
        &mut self,
        client_id: &str,
        queries: impl IntoIterator<Item = (QueryHash, Operator)>,
        version: &CvrVersion,
    ) -> DesiredQueryUpdate {
        let mut update = DesiredQueryUpdate::default();
        for (hash, ast) in queries {
            if self.put_desired_query(client_id, &hash, ast, version, &mut update.patches) {
                update.needs_hydration.push(hash);
            }
        }
        update
    }

    /// Returns true when the query is new to the group.
    fn put_desired_query(
        &mut self,
        client_id: &str,
        hash: &str,
        ast: Operator,
        version: &CvrVersion,
        patches: &mut Vec<PatchToVersion>,
    ) -> bool {
        let Some(client) = self.clients.get(client_id) else {
            tracing::warn!(client_id, query = hash, "desired query for unknown client");
            return false;
        };
        if client.desired_queries.contains_key(hash) {
            return false;
        }
        let visible_before = self.visible_rows(client_id);

        let is_new = !self.queries.contains_key(hash);
        let query = self
            .queries
            .entry(hash.to_string())
            .or_insert_with(|| QueryRecord::new(hash, ast.clone()));
        query.desired_by.insert(client_id.to_string());
        self.removed_queries.remove(hash);
        if let Some(client) = self.clients.get_mut(client_id) {
            client.desired_queries.insert(hash.to_string(), version.clone());
            client.undesired_queries.remove(hash);
        }

        patches.push(PatchToVersion::new(
            Patch::Query {
                op: PatchOp::Put,
                hash: hash.to_string(),
                ast: Some(ast),
                client_id: Some(client_id.to_string()),
            },
            version.clone(),
        ));

        if !is_new {
            for id in self.visible_rows(client_id).difference(&visible_before) {
                let contents = self.rows.get(id).and_then(|r| r.contents.clone());
                let refs = self.refs(id);
                patches.push(PatchToVersion::scoped(
                    Patch::Row {
                        op: PatchOp::Put,
                        id: id.clone(),
                        contents,
                        refs: RowRefs {
                            before: refs.clone(),
                            after: refs,
                            contents_changed: false,
                        },
                    },
                    version.clone(),
                    client_id,
                ));
            }
        }
        is_new
    }

    pub fn del_desired_queries<'a>(
        &mut self,
        client_id: &str,
        hashes: impl IntoIterator<Item = &'a str>,
        version: &CvrVersion,
    ) -> Vec<PatchToVersion> {
        let mut patches = Vec::new();
        for hash in hashes {
            self.del_desired_query(client_id, hash, version, &mut patches);
        }
        patches
    }

    pub fn clear_desired_queries(&mut self, client_id: &str, version: &CvrVersion) -> Vec<PatchToVersion> {
        let hashes: Vec<QueryHash> = self
            .clients
            .get(client_id)
            .map(|c| c.desired_queries.keys().cloned().collect())
            .unwrap_or_default();
        self.del_desired_queries(client_id, hashes.iter().map(String::as_str), version)
    }

    fn del_desired_query(
        &mut self,
        client_id: &str,
        hash: &str,
        version: &CvrVersion,
        patches: &mut Vec<PatchToVersion>,
    ) {
        let desired = self
            .clients
            .get(client_id)
            .is_some_and(|c| c.desired_queries.contains_key(hash));
        if !desired {
            return;
        }
        let visible_before = self.visible_rows(client_id);
        if let Some(client) = self.clients.get_mut(client_id) {
            client.desired_queries.remove(hash);
            client.undesired_queries.insert(hash.to_string(), version.clone());
        }
        let orphaned = match self.queries.get_mut(hash) {
            Some(query) => {
                query.desired_by.remove(client_id);
                query.desired_by.is_empty() && !query.internal
            }
            None => false,
        };

        patches.push(PatchToVersion::new(
            Patch::Query {
                op: PatchOp::Del,
                hash: hash.to_string(),
                ast: None,
                client_id: Some(client_id.to_string()),
            },
            version.clone(),
        ));

        let visible_after = self.visible_rows(client_id);
        for id in visible_before.difference(&visible_after) {
            let before = self.refs(id);
            let after = if orphaned {
                before.iter().filter(|h| h.as_str() != hash).cloned().collect()
            } else {
                before.clone()
            };
            patches.push(PatchToVersion::scoped(
                Patch::Row {
                    op: PatchOp::Del,
                    id: id.clone(),
                    contents: None,
                    refs: RowRefs {
                        before,
                        after,
                        contents_changed: false,
                    },
                },
                version.clone(),
                client_id,
            ));
        }

        if orphaned {
            patches.extend(self.remove_query(hash, version));
        }
    }

    /// Drop a query nobody desires. Rows it alone referenced become
    /// tombstones.
    fn remove_query(&mut self, hash: &str, version: &CvrVersion) -> Vec<PatchToVersion> {
        let Some(query) = self.queries.remove(hash) else {
            return Vec::new();
        };
        let mut patches = Vec::new();
        if query.patch_version.is_some() {
            patches.push(PatchToVersion::new(
                Patch::Query {
                    op: PatchOp::Del,
                    hash: hash.to_string(),
                    ast: None,
                    client_id: None,
                },
                version.clone(),
            ));
        }
        self.removed_queries.insert(hash.to_string(), version.clone());
        for id in query.rows {
            if self.refs(&id).is_empty() {
                self.rows.insert(
                    id,
                    RowRecord {
                        contents: None,
                        version: version.clone(),
                    },
                );
            }
        }
        patches
    }

    /// Record that a hydrated query's rows are now part of the group.
    /// Internal queries are not advertised to clients.
    pub fn mark_materialized(&mut self, hash: &str, version: &CvrVersion) -> Option<PatchToVersion> {
        let query = self.queries.get_mut(hash)?;
        if query.patch_version.is_some() {
            return None;
        }
        query.patch_version = Some(version.clone());
        if query.internal {
            return None;
        }
        Some(PatchToVersion::new(
            Patch::Query {
                op: PatchOp::Put,
                hash: hash.to_string(),
                ast: Some(query.ast.clone()),
                client_id: None,
            },
            version.clone(),
        ))
    }
}

/// Scan of the client metadata table for one group.
pub fn client_metadata_query(group_id: &str, clients_table: &str) -> Operator {
    Operator::Scan {
        table: clients_table.into(),
        filter: Some(Predicate::Eq {
            field: Path::new("clientGroupID"),
            value: Datum::from(group_id),
        }),
    }
}

/// Stable hash of a query AST.
pub fn ast_hash(ast: &Operator) -> QueryHash {
    match serde_json::to_value(ast) {
        Ok(value) => query_hash(&value),
        Err(_) => query_hash(&serde_json::Value::Null),
    }
}
