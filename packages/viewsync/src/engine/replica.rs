use super::types::{ChangeKind, Row, RowChangeEvent, RowKey, VersionedBatch};
use crate::error::ReplicaError;
use crate::schema::{PublishedTable, ReplicaSchema};
use crate::serde_util::entries;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaTable {
    #[serde(with = "entries")]
    pub rows: BTreeMap<RowKey, Row>,
}

/// Local copy of the published upstream tables at one source version.
///
/// Incoming batches are normalized against the current contents: inserts of
/// existing rows become updates, updates and deletes get their `before` row
/// from the replica, no-op changes are dropped, and changes that cross a
/// publication filter become inserts or deletes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    version: Option<u64>,
    tables: BTreeMap<SmolStr, ReplicaTable>,
}

struct Staged<'a> {
    event: RowChangeEvent,
    published: &'a PublishedTable,
    old_key: RowKey,
    new_key: Option<RowKey>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn rows<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a Row> + 'a {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|t| t.rows.values())
    }

    pub fn get(&self, table: &str, key: &RowKey) -> Option<&Row> {
        self.tables.get(table)?.rows.get(key)
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &SmolStr> {
        self.tables.keys()
    }

    /// Drop tables that are no longer published, e.g. after a schema change
    /// between restarts.
    pub fn retain_published(&mut self, schema: &ReplicaSchema) {
        self.tables.retain(|name, _| schema.table(name).is_some());
    }

    /// Apply a batch and return the normalized changes it made.
    ///
    /// The batch is validated completely before anything is written, so a
    /// rejected batch leaves the replica untouched.
    pub fn apply(
        &mut self,
        schema: &ReplicaSchema,
        batch: VersionedBatch,
    ) -> Result<VersionedBatch, ReplicaError> {
        if let Some(current) = self.version {
            if batch.version <= current {
                return Err(ReplicaError::StaleVersion {
                    current,
                    got: batch.version,
                });
            }
        }

        let mut staged = Vec::with_capacity(batch.changes.len());
        for event in batch.changes {
            staged.push(stage(schema, event)?);
        }

        let mut applied = Vec::new();
        for s in staged {
            self.apply_staged(s, &mut applied);
        }
        self.version = Some(batch.version);
        Ok(VersionedBatch {
            version: batch.version,
            changes: applied,
        })
    }

    fn apply_staged(&mut self, staged: Staged<'_>, out: &mut Vec<RowChangeEvent>) {
        let Staged {
            event,
            published,
            old_key,
            new_key,
        } = staged;
        let name = event.table;
        let table = self.tables.entry(name.clone()).or_default();

        let after = event
            .after
            .map(|row| published.project(row))
            .filter(|row| published.admits(row));

        let key = match new_key {
            Some(new_key) if new_key != old_key => {
                if let Some(old) = table.rows.remove(&old_key) {
                    out.push(RowChangeEvent::delete(name.clone(), old));
                }
                new_key
            }
            _ => old_key,
        };

        let existing = table.rows.get(&key).cloned();
        match (existing, after) {
            (None, None) => {}
            (None, Some(row)) => {
                table.rows.insert(key, row.clone());
                out.push(RowChangeEvent::insert(name, row));
            }
            (Some(old), None) => {
                table.rows.remove(&key);
                out.push(RowChangeEvent::delete(name, old));
            }
            (Some(old), Some(row)) => {
                if old != row {
                    table.rows.insert(key, row.clone());
                    out.push(RowChangeEvent::update(name, Some(old), row));
                }
            }
        }
    }
}

fn stage(schema: &ReplicaSchema, event: RowChangeEvent) -> Result<Staged<'_>, ReplicaError> {
    let published = schema
        .table(&event.table)
        .ok_or_else(|| ReplicaError::UnknownTable(event.table.clone()))?;
    let key_of = |row: Option<&Row>| -> Result<RowKey, ReplicaError> {
        let row = row.ok_or_else(|| ReplicaError::MissingRow {
            table: event.table.clone(),
        })?;
        published
            .schema
            .key_of(row)
            .map_err(|source| ReplicaError::Key {
                table: event.table.clone(),
                source,
            })
    };

    let (old_key, new_key) = match event.kind {
        ChangeKind::Insert => (key_of(event.after.as_ref())?, None),
        ChangeKind::Update => {
            let new_key = key_of(event.after.as_ref())?;
            let old_key = match &event.before {
                Some(before) => key_of(Some(before))?,
                None => new_key.clone(),
            };
            (old_key, Some(new_key))
        }
        ChangeKind::Delete => (key_of(event.before.as_ref())?, None),
    };
    let event = match event.kind {
        ChangeKind::Delete => RowChangeEvent {
            after: None,
            ..event
        },
        _ => event,
    };
    Ok(Staged {
        event,
        published,
        old_key,
        new_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::row_from_json;
    use crate::schema::{SchemaConfig, DEFAULT_CLIENTS_TABLE};
    use serde_json::json;

    fn schema() -> ReplicaSchema {
        let config: SchemaConfig = serde_json::from_value(json!({
            "tables": {"issue": {"primaryKey": ["id"]}},
            "publications": [{"name": "p", "tables": [
                {"table": "issue", "filter": {"type": "eq", "field": "open", "value": true}}
            ]}]
        }))
        .unwrap();
        ReplicaSchema::from_config(config, DEFAULT_CLIENTS_TABLE).unwrap()
    }

    fn batch(version: u64, changes: Vec<RowChangeEvent>) -> VersionedBatch {
        VersionedBatch { version, changes }
    }

    #[test]
    fn test_insert_then_duplicate_insert_becomes_update() {
        let schema = schema();
        let mut replica = Replica::new();
        replica
            .apply(&schema, batch(1, vec![RowChangeEvent::insert("issue", row_from_json(json!({"id": 1, "open": true, "t": "a"})))]))
            .unwrap();
        let out = replica
            .apply(&schema, batch(2, vec![RowChangeEvent::insert("issue", row_from_json(json!({"id": 1, "open": true, "t": "b"})))]))
            .unwrap();
        assert_eq!(out.changes.len(), 1);
        assert_eq!(out.changes[0].kind, ChangeKind::Update);
        assert_eq!(
            out.changes[0].before,
            Some(row_from_json(json!({"id": 1, "open": true, "t": "a"})))
        );
        assert_eq!(replica.version(), Some(2));
    }

    #[test]
    fn test_update_leaving_filter_becomes_delete() {
        let schema = schema();
        let mut replica = Replica::new();
        replica
            .apply(&schema, batch(1, vec![RowChangeEvent::insert("issue", row_from_json(json!({"id": 1, "open": true})))]))
            .unwrap();
        let out = replica
            .apply(&schema, batch(2, vec![RowChangeEvent::update("issue", None, row_from_json(json!({"id": 1, "open": false})))]))
            .unwrap();
        assert_eq!(out.changes.len(), 1);
        assert_eq!(out.changes[0].kind, ChangeKind::Delete);
        assert_eq!(replica.row_count(), 0);

        let out = replica
            .apply(&schema, batch(3, vec![RowChangeEvent::update("issue", None, row_from_json(json!({"id": 1, "open": true})))]))
            .unwrap();
        assert_eq!(out.changes[0].kind, ChangeKind::Insert);
    }

    #[test]
    fn test_rows_outside_publication_never_stored() {
        let schema = schema();
        let mut replica = Replica::new();
        let out = replica
            .apply(&schema, batch(1, vec![RowChangeEvent::insert("issue", row_from_json(json!({"id": 1, "open": false})))]))
            .unwrap();
        assert!(out.changes.is_empty());
        assert_eq!(replica.row_count(), 0);
    }

    #[test]
    fn test_rejected_batch_leaves_replica_untouched() {
        let schema = schema();
        let mut replica = Replica::new();
        let err = replica
            .apply(&schema, batch(1, vec![
                RowChangeEvent::insert("issue", row_from_json(json!({"id": 1, "open": true}))),
                RowChangeEvent::insert("nope", row_from_json(json!({"id": 1}))),
            ]))
            .unwrap_err();
        assert_eq!(err, ReplicaError::UnknownTable("nope".into()));
        assert_eq!(replica.row_count(), 0);
        assert_eq!(replica.version(), None);
    }

    #[test]
    fn test_stale_version_rejected() {
        let schema = schema();
        let mut replica = Replica::new();
        replica.apply(&schema, batch(5, vec![])).unwrap();
        assert!(matches!(
            replica.apply(&schema, batch(5, vec![])),
            Err(ReplicaError::StaleVersion { current: 5, got: 5 })
        ));
    }

    #[test]
    fn test_key_change_deletes_old_row() {
        let schema = schema();
        let mut replica = Replica::new();
        replica
            .apply(&schema, batch(1, vec![RowChangeEvent::insert("issue", row_from_json(json!({"id": 1, "open": true})))]))
            .unwrap();
        let out = replica
            .apply(&schema, batch(2, vec![RowChangeEvent::update(
                "issue",
                Some(row_from_json(json!({"id": 1, "open": true}))),
                row_from_json(json!({"id": 2, "open": true})),
            )]))
            .unwrap();
        let kinds: Vec<_> = out.changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Delete, ChangeKind::Insert]);
    }

    #[test]
    fn test_delete_of_missing_row_is_dropped() {
        let schema = schema();
        let mut replica = Replica::new();
        let out = replica
            .apply(&schema, batch(1, vec![RowChangeEvent::delete("issue", row_from_json(json!({"id": 9})))]))
            .unwrap();
        assert!(out.changes.is_empty());
    }
}
