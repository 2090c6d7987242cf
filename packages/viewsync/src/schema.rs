//! Table schemas and publications.
//!
//! A publication selects which tables (and optionally which columns and
//! rows) the upstream replicates. Several publications may name the same
//! table; they are merged into one [`PublishedTable`] per table.

use crate::engine::operators::Predicate;
use crate::engine::types::{Datum, Row, RowKey};
use crate::error::{KeyError, SchemaError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::{BTreeMap, BTreeSet};
use viewsync_protocol::SchemaVersions;

pub const DEFAULT_CLIENTS_TABLE: &str = "_viewsync_clients";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Number,
    String,
    /// Any value, including arrays and objects.
    Json,
}

impl ColumnType {
    /// Null is accepted by every type; only key columns must be non-null.
    pub fn accepts(&self, value: &Datum) -> bool {
        match (self, value) {
            (_, Datum::Null) | (ColumnType::Json, _) => true,
            (ColumnType::Boolean, Datum::Bool(_)) => true,
            (ColumnType::Number, Datum::Number(_)) => true,
            (ColumnType::String, Datum::Str(_)) => true,
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    #[serde(default)]
    pub name: SmolStr,
    pub primary_key: Vec<SmolStr>,
    /// Declared columns. Empty means rows are not type checked.
    #[serde(default)]
    pub columns: IndexMap<SmolStr, ColumnType>,
}

impl TableSchema {
    pub fn new(name: impl Into<SmolStr>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.iter().map(|c| SmolStr::new(c)).collect(),
            columns: IndexMap::new(),
        }
    }

    pub fn with_column(mut self, name: &str, ty: ColumnType) -> Self {
        self.columns.insert(SmolStr::new(name), ty);
        self
    }

    pub fn key_of(&self, row: &Row) -> Result<RowKey, KeyError> {
        RowKey::from_row(row, &self.primary_key)
    }

    /// Check a row against the declared columns.
    pub fn validate(&self, row: &Row) -> Result<(), String> {
        self.key_of(row).map_err(|e| e.to_string())?;
        if self.columns.is_empty() {
            return Ok(());
        }
        for (col, value) in row {
            match self.columns.get(col) {
                None => return Err(format!("undeclared column `{col}`")),
                Some(ty) if !ty.accepts(value) => {
                    return Err(format!(
                        "column `{col}` expects {ty:?}, got {}",
                        value.type_name()
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn clients_table(name: &str) -> Self {
        TableSchema::new(name, &["clientGroupID", "clientID"])
            .with_column("clientGroupID", ColumnType::String)
            .with_column("clientID", ColumnType::String)
            .with_column("lastMutationID", ColumnType::Number)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PublicationTable {
    pub table: SmolStr,
    #[serde(default)]
    pub columns: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub filter: Option<Predicate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Publication {
    pub name: SmolStr,
    pub tables: Vec<PublicationTable>,
}

/// A replicated table after merging every publication that names it.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishedTable {
    pub schema: TableSchema,
    /// `None` publishes every column.
    pub columns: Option<BTreeSet<SmolStr>>,
    /// `None` publishes every row.
    pub filter: Option<Predicate>,
}

impl PublishedTable {
    fn unfiltered(schema: TableSchema) -> Self {
        Self {
            schema,
            columns: None,
            filter: None,
        }
    }

    pub fn admits(&self, row: &Row) -> bool {
        self.filter.as_ref().map_or(true, |f| f.eval(row))
    }

    /// Drop unpublished columns. Key columns are always kept.
    pub fn project(&self, mut row: Row) -> Row {
        if let Some(columns) = &self.columns {
            row.retain(|col, _| columns.contains(col) || self.schema.primary_key.contains(col));
        }
        row
    }
}

fn default_schema_versions() -> SchemaVersions {
    SchemaVersions {
        min_supported_version: 0,
        max_supported_version: u32::MAX,
    }
}

/// On-disk schema description loaded at startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaConfig {
    #[serde(default = "default_schema_versions")]
    pub schema_versions: SchemaVersions,
    pub tables: IndexMap<SmolStr, TableSchema>,
    /// No publications means every table is replicated in full.
    #[serde(default)]
    pub publications: Vec<Publication>,
}

/// Tables the replica holds, keyed by name.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaSchema {
    pub schema_versions: SchemaVersions,
    pub clients_table: SmolStr,
    pub tables: BTreeMap<SmolStr, PublishedTable>,
}

impl ReplicaSchema {
    pub fn from_config(config: SchemaConfig, clients_table: &str) -> Result<Self, SchemaError> {
        let mut declared = config.tables;
        for (name, table) in declared.iter_mut() {
            table.name = name.clone();
            if table.primary_key.is_empty() {
                return Err(SchemaError::MissingPrimaryKey(name.clone()));
            }
        }

        let mut tables = if config.publications.is_empty() {
            declared
                .into_iter()
                .map(|(name, schema)| (name, PublishedTable::unfiltered(schema)))
                .collect()
        } else {
            merge_publications(&declared, &config.publications)?
        };

        tables
            .entry(SmolStr::new(clients_table))
            .or_insert_with(|| PublishedTable::unfiltered(TableSchema::clients_table(clients_table)));

        Ok(Self {
            schema_versions: config.schema_versions,
            clients_table: SmolStr::new(clients_table),
            tables,
        })
    }

    pub fn table(&self, name: &str) -> Option<&PublishedTable> {
        self.tables.get(name)
    }
}

/// Merge publications into one entry per table.
///
/// Row filters of the same table are OR-ed, and a single unfiltered
/// publication makes the table unfiltered. Column lists must agree.
pub fn merge_publications(
    declared: &IndexMap<SmolStr, TableSchema>,
    publications: &[Publication],
) -> Result<BTreeMap<SmolStr, PublishedTable>, SchemaError> {
    struct Merged {
        columns: Option<BTreeSet<SmolStr>>,
        filters: Vec<Predicate>,
        unfiltered: bool,
    }

    let mut merged: BTreeMap<SmolStr, Merged> = BTreeMap::new();
    for publication in publications {
        for entry in &publication.tables {
            if !declared.contains_key(&entry.table) {
                return Err(SchemaError::UnknownTable(entry.table.clone()));
            }
            let columns = entry
                .columns
                .as_ref()
                .map(|cols| cols.iter().cloned().collect::<BTreeSet<_>>());
            match merged.get_mut(&entry.table) {
                Some(existing) => {
                    if existing.columns != columns {
                        return Err(SchemaError::ConflictingColumns {
                            table: entry.table.clone(),
                        });
                    }
                    match &entry.filter {
                        Some(f) => existing.filters.push(f.clone()),
                        None => existing.unfiltered = true,
                    }
                }
                None => {
                    merged.insert(
                        entry.table.clone(),
                        Merged {
                            columns,
                            filters: entry.filter.iter().cloned().collect(),
                            unfiltered: entry.filter.is_none(),
                        },
                    );
                }
            }
        }
    }

    Ok(merged
        .into_iter()
        .filter_map(|(name, m)| {
            let schema = declared.get(&name)?.clone();
            let filter = if m.unfiltered {
                None
            } else {
                Some(Predicate::any_of(m.filters))
            };
            Some((
                name,
                PublishedTable {
                    schema,
                    columns: m.columns,
                    filter,
                },
            ))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::row_from_json;
    use serde_json::json;

    fn config(publications: serde_json::Value) -> SchemaConfig {
        serde_json::from_value(json!({
            "tables": {
                "issue": {"primaryKey": ["id"], "columns": {"id": "number", "title": "string", "open": "boolean"}},
                "comment": {"primaryKey": ["id"]}
            },
            "publications": publications
        }))
        .unwrap()
    }

    #[test]
    fn test_no_publications_replicates_everything() {
        let schema = ReplicaSchema::from_config(config(json!([])), DEFAULT_CLIENTS_TABLE).unwrap();
        assert!(schema.table("issue").unwrap().filter.is_none());
        assert!(schema.table("comment").is_some());
        assert_eq!(
            schema.table(DEFAULT_CLIENTS_TABLE).unwrap().schema.primary_key,
            vec![SmolStr::new("clientGroupID"), SmolStr::new("clientID")]
        );
    }

    #[test]
    fn test_filters_are_ored() {
        let schema = ReplicaSchema::from_config(
            config(json!([
                {"name": "a", "tables": [{"table": "issue", "filter": {"type": "eq", "field": "id", "value": 1}}]},
                {"name": "b", "tables": [{"table": "issue", "filter": {"type": "eq", "field": "id", "value": 2}}]}
            ])),
            DEFAULT_CLIENTS_TABLE,
        )
        .unwrap();
        let issue = schema.table("issue").unwrap();
        assert!(issue.admits(&row_from_json(json!({"id": 1}))));
        assert!(issue.admits(&row_from_json(json!({"id": 2}))));
        assert!(!issue.admits(&row_from_json(json!({"id": 3}))));
        assert!(schema.table("comment").is_none());
    }

    #[test]
    fn test_unfiltered_publication_wins() {
        let schema = ReplicaSchema::from_config(
            config(json!([
                {"name": "a", "tables": [{"table": "issue", "filter": {"type": "eq", "field": "id", "value": 1}}]},
                {"name": "b", "tables": [{"table": "issue"}]}
            ])),
            DEFAULT_CLIENTS_TABLE,
        )
        .unwrap();
        assert!(schema.table("issue").unwrap().filter.is_none());
    }

    #[test]
    fn test_conflicting_columns_rejected() {
        let err = ReplicaSchema::from_config(
            config(json!([
                {"name": "a", "tables": [{"table": "issue", "columns": ["id", "title"]}]},
                {"name": "b", "tables": [{"table": "issue", "columns": ["id"]}]}
            ])),
            DEFAULT_CLIENTS_TABLE,
        )
        .unwrap_err();
        assert_eq!(err, SchemaError::ConflictingColumns { table: "issue".into() });
    }

    #[test]
    fn test_unknown_table_rejected() {
        let err = ReplicaSchema::from_config(
            config(json!([{"name": "a", "tables": [{"table": "nope"}]}])),
            DEFAULT_CLIENTS_TABLE,
        )
        .unwrap_err();
        assert_eq!(err, SchemaError::UnknownTable("nope".into()));
    }

    #[test]
    fn test_validate_row() {
        let schema = ReplicaSchema::from_config(config(json!([])), DEFAULT_CLIENTS_TABLE).unwrap();
        let issue = &schema.table("issue").unwrap().schema;
        assert!(issue
            .validate(&row_from_json(json!({"id": 1, "title": "a", "open": null})))
            .is_ok());
        assert!(issue.validate(&row_from_json(json!({"id": 1, "title": 5}))).is_err());
        assert!(issue.validate(&row_from_json(json!({"id": 1, "bogus": 5}))).is_err());
        assert!(issue.validate(&row_from_json(json!({"title": "a"}))).is_err());
    }

    #[test]
    fn test_projection_keeps_key() {
        let published = PublishedTable {
            schema: TableSchema::new("issue", &["id"]),
            columns: Some(BTreeSet::from([SmolStr::new("title")])),
            filter: None,
        };
        let row = published.project(row_from_json(json!({"id": 1, "title": "a", "body": "b"})));
        assert_eq!(row, row_from_json(json!({"id": 1, "title": "a"})));
    }
}
