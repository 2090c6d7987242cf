use crate::engine::operators::{Aggregate, AggregateFn, GroupKey};
use crate::engine::types::{Change, Datum, FastMap, OutputRow, Row, RowId, RowKey, Weight};
use smol_str::SmolStr;
use std::collections::BTreeMap;

#[derive(Debug)]
enum Accumulator {
    /// `count` without a field reads the group's row count instead.
    Count { non_null: Weight },
    /// Numeric contributions by row identity, added up in identity order so
    /// the total does not depend on the order changes arrived in.
    Sum(BTreeMap<RowId, (f64, Weight)>),
    /// Multiset of values, so min and max survive removals.
    Extremum(BTreeMap<Datum, Weight>),
    /// Values ordered by the identity of the row they came from.
    Array(BTreeMap<RowId, (Datum, Weight)>),
}

impl Accumulator {
    fn new(func: AggregateFn) -> Self {
        match func {
            AggregateFn::Count => Accumulator::Count { non_null: 0 },
            AggregateFn::Sum => Accumulator::Sum(BTreeMap::new()),
            AggregateFn::Min | AggregateFn::Max => Accumulator::Extremum(BTreeMap::new()),
            AggregateFn::Array => Accumulator::Array(BTreeMap::new()),
        }
    }

    fn apply(&mut self, value: Datum, id: &RowId, weight: Weight) {
        match self {
            Accumulator::Count { non_null } => {
                if !value.is_null() {
                    *non_null += weight;
                }
            }
            Accumulator::Sum(numbers) => {
                let Datum::Number(n) = value else {
                    return;
                };
                let entry = numbers.entry(id.clone()).or_insert((n, 0));
                if weight > 0 {
                    entry.0 = n;
                }
                entry.1 += weight;
                if entry.1 <= 0 {
                    numbers.remove(id);
                }
            }
            Accumulator::Extremum(values) => {
                if value.is_null() {
                    return;
                }
                let entry = values.entry(value.clone()).or_insert(0);
                *entry += weight;
                if *entry <= 0 {
                    values.remove(&value);
                }
            }
            Accumulator::Array(values) => {
                let entry = values.entry(id.clone()).or_insert((Datum::Null, 0));
                if weight > 0 {
                    entry.0 = value;
                }
                entry.1 += weight;
                if entry.1 <= 0 {
                    values.remove(id);
                }
            }
        }
    }

    fn value(&self, agg: &Aggregate, rows: Weight) -> Datum {
        match self {
            Accumulator::Count { non_null } => {
                let n = if agg.field.is_some() { *non_null } else { rows };
                Datum::Number(n as f64)
            }
            Accumulator::Sum(numbers) => {
                if numbers.is_empty() {
                    return Datum::Null;
                }
                let mut total = 0.0;
                for (n, count) in numbers.values() {
                    total += n * *count as f64;
                }
                Datum::Number(total)
            }
            Accumulator::Extremum(values) => {
                let picked = if agg.func == AggregateFn::Min {
                    values.keys().next()
                } else {
                    values.keys().next_back()
                };
                picked.cloned().unwrap_or(Datum::Null)
            }
            Accumulator::Array(values) => {
                let mut out = Vec::with_capacity(values.len());
                for (value, count) in values.values() {
                    for _ in 0..*count {
                        out.push(value.clone());
                    }
                }
                Datum::Array(out)
            }
        }
    }
}

#[derive(Debug)]
struct GroupState {
    rows: Weight,
    accumulators: Vec<Accumulator>,
}

/// Incremental group-by. Every change to a group is emitted as a removal of
/// the previous aggregate row followed by an addition of the new one; a
/// group with no rows has no output row at all.
#[derive(Debug)]
pub(crate) struct GroupByNode {
    relation: SmolStr,
    keys: Vec<GroupKey>,
    aggregates: Vec<Aggregate>,
    groups: FastMap<RowKey, GroupState>,
}

fn output_row(relation: &SmolStr, aggregates: &[Aggregate], key: &RowKey, state: &GroupState) -> OutputRow {
    let mut row = Row::new();
    for (col, value) in &key.0 {
        row.insert(col.clone(), value.clone());
    }
    for (agg, acc) in aggregates.iter().zip(&state.accumulators) {
        row.insert(agg.alias.clone(), acc.value(agg, state.rows));
    }
    OutputRow::new(RowId::new(relation.clone(), key.clone()), row)
}

impl GroupByNode {
    pub(crate) fn new(relation: SmolStr, keys: Vec<GroupKey>, aggregates: Vec<Aggregate>) -> Self {
        Self {
            relation,
            keys,
            aggregates,
            groups: FastMap::default(),
        }
    }

    fn group_key(&self, row: &Row) -> RowKey {
        let mut key = RowKey::new();
        for k in &self.keys {
            key.push(k.column(), k.field.resolve(row).cloned().unwrap_or_default());
        }
        key
    }

    pub(crate) fn push(&mut self, change: Change, out: &mut Vec<Change>) {
        let weight = change.weight();
        let input = change.output();
        let key = self.group_key(&input.row);

        let before = self
            .groups
            .get(&key)
            .map(|state| output_row(&self.relation, &self.aggregates, &key, state));

        let state = self.groups.entry(key.clone()).or_insert_with(|| GroupState {
            rows: 0,
            accumulators: self.aggregates.iter().map(|a| Accumulator::new(a.func)).collect(),
        });
        state.rows += weight;
        for (agg, acc) in self.aggregates.iter().zip(state.accumulators.iter_mut()) {
            let value = agg
                .field
                .as_ref()
                .and_then(|f| f.resolve(&input.row))
                .cloned()
                .unwrap_or_default();
            acc.apply(value, &input.id, weight);
        }

        let after = if state.rows > 0 {
            Some(output_row(&self.relation, &self.aggregates, &key, state))
        } else {
            None
        };
        if after.is_none() {
            self.groups.remove(&key);
        }

        if let Some(before) = before {
            out.push(Change::Remove(before));
        }
        if let Some(after) = after {
            out.push(Change::Add(after));
        }
    }
}
