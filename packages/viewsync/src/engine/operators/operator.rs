use super::predicate::Predicate;
use crate::engine::types::Path;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeSet;

/// Query AST as sent by clients in desired-query patches.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operator {
    Scan {
        table: SmolStr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Predicate>,
    },
    Filter {
        input: Box<Operator>,
        predicate: Predicate,
    },
    Join {
        left: Box<Operator>,
        right: Box<Operator>,
        on: JoinCondition,
        /// Column of the output row that holds the matched right row.
        alias: SmolStr,
        #[serde(default)]
        kind: JoinKind,
    },
    GroupBy {
        input: Box<Operator>,
        /// Relation name of the output rows.
        name: SmolStr,
        #[serde(default)]
        keys: Vec<GroupKey>,
        #[serde(default)]
        aggregates: Vec<Aggregate>,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinCondition {
    pub left_field: Path,
    pub right_field: Path,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Inner,
    /// Keeps unmatched left rows, with the alias column set to null.
    Left,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GroupKey {
    pub field: Path,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<SmolStr>,
}

impl GroupKey {
    pub fn column(&self) -> SmolStr {
        self.alias
            .clone()
            .or_else(|| self.field.last().cloned())
            .unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Count,
    Sum,
    Min,
    Max,
    Array,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Aggregate {
    #[serde(rename = "fn")]
    pub func: AggregateFn,
    /// Required by everything except `count`, which counts rows without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<Path>,
    pub alias: SmolStr,
}

impl Operator {
    /// Extract all table names referenced by this operator tree
    pub fn referenced_tables(&self) -> BTreeSet<SmolStr> {
        let mut tables = BTreeSet::new();
        self.collect_tables(&mut tables);
        tables
    }

    fn collect_tables(&self, out: &mut BTreeSet<SmolStr>) {
        match self {
            Operator::Scan { table, .. } => {
                out.insert(table.clone());
            }
            Operator::Filter { input, .. } | Operator::GroupBy { input, .. } => {
                input.collect_tables(out)
            }
            Operator::Join { left, right, .. } => {
                left.collect_tables(out);
                right.collect_tables(out);
            }
        }
    }

    /// Relation name carried by the identity of every output row.
    ///
    /// A join names both inputs and its alias. A group-by adds a hash of
    /// its whole subtree, so two queries reusing a name never share rows.
    pub fn relation_name(&self) -> SmolStr {
        match self {
            Operator::Scan { table, .. } => table.clone(),
            Operator::Filter { input, .. } => input.relation_name(),
            Operator::Join {
                left, right, alias, ..
            } => SmolStr::from(format!(
                "{}+{alias}:{}",
                left.relation_name(),
                right.relation_name()
            )),
            Operator::GroupBy { name, .. } => {
                let ast = serde_json::to_value(self).unwrap_or_default();
                SmolStr::from(format!("{name}#{}", viewsync_protocol::query_hash(&ast)))
            }
        }
    }

    /// Structural checks that do not need the schema.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match self {
            Operator::Scan { table, .. } => {
                if table.is_empty() {
                    return Err(PipelineError::InvalidQuery("scan without table".into()));
                }
            }
            Operator::Filter { input, .. } => input.validate()?,
            Operator::Join {
                left,
                right,
                on,
                alias,
                ..
            } => {
                if alias.is_empty() {
                    return Err(PipelineError::InvalidQuery("join without alias".into()));
                }
                if on.left_field.is_empty() || on.right_field.is_empty() {
                    return Err(PipelineError::InvalidQuery("join without fields".into()));
                }
                left.validate()?;
                right.validate()?;
            }
            Operator::GroupBy {
                input,
                name,
                keys,
                aggregates,
            } => {
                if name.is_empty() {
                    return Err(PipelineError::InvalidQuery("groupBy without name".into()));
                }
                let mut columns = BTreeSet::new();
                for key in keys {
                    if key.field.is_empty() || !columns.insert(key.column()) {
                        return Err(PipelineError::InvalidQuery(format!(
                            "bad group key `{}`",
                            key.field.as_str()
                        )));
                    }
                }
                for agg in aggregates {
                    if agg.field.is_none() && agg.func != AggregateFn::Count {
                        return Err(PipelineError::InvalidQuery(format!(
                            "aggregate `{}` needs a field",
                            agg.alias
                        )));
                    }
                    if !columns.insert(agg.alias.clone()) {
                        return Err(PipelineError::InvalidQuery(format!(
                            "duplicate column `{}`",
                            agg.alias
                        )));
                    }
                }
                input.validate()?;
            }
        }
        Ok(())
    }
}
