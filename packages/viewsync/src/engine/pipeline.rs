use super::nodes::{FilterNode, GroupByNode, JoinNode, SourceNode};
use super::operators::Operator;
use super::replica::Replica;
use super::types::{Change, FastMap, OutputRow, Row, RowChangeEvent, RowId, Weight};
use crate::error::PipelineError;
use crate::schema::ReplicaSchema;
use indexmap::IndexMap;
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::collections::BTreeSet;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Only,
    Left,
    Right,
}

type Parent = Option<(NodeId, Side)>;

#[derive(Debug)]
enum Node {
    Filter(FilterNode),
    Join(JoinNode),
    GroupBy(GroupByNode),
}

#[derive(Debug)]
struct Slot {
    node: Node,
    parent: Parent,
}

#[derive(Debug)]
struct SourceSlot {
    source: SourceNode,
    parent: Parent,
}

/// A query compiled into a tree of stateful operators.
///
/// Nodes live in an arena and point at their parent; sources are the
/// leaves. Changes enter at the sources and flow upward, and whatever
/// reaches the top is the query's output delta.
#[derive(Debug)]
pub struct Pipeline {
    nodes: Vec<Slot>,
    sources: Vec<SourceSlot>,
    by_table: FastMap<SmolStr, SmallVec<[usize; 2]>>,
    tables: BTreeSet<SmolStr>,
}

impl Pipeline {
    pub fn build(ast: &Operator, schema: &ReplicaSchema) -> Result<Self, PipelineError> {
        ast.validate()?;
        let mut pipeline = Pipeline {
            nodes: Vec::new(),
            sources: Vec::new(),
            by_table: FastMap::default(),
            tables: ast.referenced_tables(),
        };
        pipeline.add(ast, schema, None)?;
        for (i, slot) in pipeline.sources.iter().enumerate() {
            pipeline
                .by_table
                .entry(SmolStr::new(slot.source.table()))
                .or_default()
                .push(i);
        }
        Ok(pipeline)
    }

    fn add(&mut self, ast: &Operator, schema: &ReplicaSchema, parent: Parent) -> Result<(), PipelineError> {
        match ast {
            Operator::Scan { table, filter } => {
                let published = schema
                    .table(table)
                    .ok_or_else(|| PipelineError::UnknownTable(table.clone()))?;
                self.sources.push(SourceSlot {
                    source: SourceNode::new(published.schema.clone(), filter.clone()),
                    parent,
                });
            }
            Operator::Filter { input, predicate } => {
                let id = self.push_node(Node::Filter(FilterNode::new(predicate.clone())), parent);
                self.add(input, schema, Some((id, Side::Only)))?;
            }
            Operator::Join {
                left,
                right,
                on,
                alias,
                kind,
            } => {
                let node = JoinNode::new(
                    *kind,
                    ast.relation_name(),
                    alias.clone(),
                    on.left_field.clone(),
                    on.right_field.clone(),
                );
                let id = self.push_node(Node::Join(node), parent);
                self.add(left, schema, Some((id, Side::Left)))?;
                self.add(right, schema, Some((id, Side::Right)))?;
            }
            Operator::GroupBy {
                input,
                keys,
                aggregates,
                ..
            } => {
                let node = GroupByNode::new(ast.relation_name(), keys.clone(), aggregates.clone());
                let id = self.push_node(Node::GroupBy(node), parent);
                self.add(input, schema, Some((id, Side::Only)))?;
            }
        }
        Ok(())
    }

    fn push_node(&mut self, node: Node, parent: Parent) -> NodeId {
        self.nodes.push(Slot { node, parent });
        self.nodes.len() - 1
    }

    pub fn referenced_tables(&self) -> &BTreeSet<SmolStr> {
        &self.tables
    }

    pub fn reads(&self, table: &str) -> bool {
        self.by_table.contains_key(table)
    }

    /// Feed every replica row through a freshly built pipeline. Sources are
    /// loaded one after another, so a join sees its left input complete
    /// before any right row arrives.
    pub fn hydrate(&mut self, replica: &Replica) -> Result<Vec<Change>, PipelineError> {
        let mut out = Vec::new();
        for i in 0..self.sources.len() {
            let slot = &self.sources[i];
            let mut changes = Vec::new();
            for row in replica.rows(slot.source.table()) {
                slot.source.push_existing(row, &mut changes)?;
            }
            let parent = slot.parent;
            self.propagate(parent, changes, &mut out);
        }
        Ok(consolidate(out))
    }

    /// Push one batch of upstream changes through the pipeline and return
    /// the consolidated output delta.
    pub fn apply(&mut self, events: &[RowChangeEvent]) -> Result<Vec<Change>, PipelineError> {
        let mut out = Vec::new();
        for event in events {
            let Some(indices) = self.by_table.get(&event.table) else {
                continue;
            };
            let indices = indices.clone();
            for i in indices {
                let slot = &self.sources[i];
                let mut changes = Vec::new();
                slot.source.push(event, &mut changes)?;
                let parent = slot.parent;
                self.propagate(parent, changes, &mut out);
            }
        }
        Ok(consolidate(out))
    }

    fn propagate(&mut self, mut parent: Parent, mut batch: Vec<Change>, out: &mut Vec<Change>) {
        while let Some((id, side)) = parent {
            if batch.is_empty() {
                return;
            }
            let slot = &mut self.nodes[id];
            let mut next = Vec::with_capacity(batch.len());
            for change in batch {
                match (&mut slot.node, side) {
                    (Node::Filter(f), _) => f.push(change, &mut next),
                    (Node::GroupBy(g), _) => g.push(change, &mut next),
                    (Node::Join(j), Side::Right) => j.push_right(change, &mut next),
                    (Node::Join(j), _) => j.push_left(change, &mut next),
                }
            }
            batch = next;
            parent = slot.parent;
        }
        out.extend(batch);
    }
}

/// Net out a batch of changes per row identity and order all removals
/// before all additions.
///
/// A row removed and re-added with the same contents disappears from the
/// output, and an identity whose contents changed comes out as a removal of
/// the old row followed by an addition of the new one.
pub fn consolidate(changes: Vec<Change>) -> Vec<Change> {
    if changes.len() < 2 {
        return changes;
    }
    let mut net: IndexMap<RowId, SmallVec<[(Row, Weight); 2]>> = IndexMap::new();
    for change in changes {
        let weight = change.weight();
        let (Change::Add(row) | Change::Remove(row)) = change;
        let versions = net.entry(row.id).or_default();
        match versions.iter_mut().find(|(r, _)| *r == row.row) {
            Some((_, w)) => *w += weight,
            None => versions.push((row.row, weight)),
        }
    }

    let mut removals = Vec::new();
    let mut additions = Vec::new();
    for (id, versions) in net {
        for (row, weight) in versions {
            let target = if weight < 0 {
                &mut removals
            } else {
                &mut additions
            };
            for _ in 0..weight.unsigned_abs() {
                target.push(Change::with_weight(
                    OutputRow::new(id.clone(), row.clone()),
                    weight,
                ));
            }
        }
    }
    removals.extend(additions);
    removals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{row_from_json, RowKey};
    use serde_json::json;

    fn out_row(id: i64, title: &str) -> OutputRow {
        let row = row_from_json(json!({"id": id, "title": title}));
        let key = RowKey::from_row(&row, &[SmolStr::new("id")]).unwrap();
        OutputRow::new(RowId::new("issue", key), row)
    }

    #[test]
    fn test_consolidate_orders_removals_first() {
        let changes = vec![
            Change::Add(out_row(1, "b")),
            Change::Remove(out_row(1, "a")),
            Change::Add(out_row(2, "x")),
            Change::Remove(out_row(2, "x")),
        ];
        let out = consolidate(changes);
        assert_eq!(out, vec![Change::Remove(out_row(1, "a")), Change::Add(out_row(1, "b"))]);
    }

    #[test]
    fn test_consolidate_keeps_transient_free_sequence() {
        let changes = vec![
            Change::Remove(out_row(1, "a")),
            Change::Add(out_row(1, "b")),
            Change::Remove(out_row(1, "b")),
            Change::Add(out_row(1, "a")),
        ];
        assert!(consolidate(changes).is_empty());
    }
}
