use crate::engine::operators::JoinKind;
use crate::engine::types::{Change, Datum, FastMap, OutputRow, Path, Row, RowId};
use indexmap::IndexMap;
use smol_str::SmolStr;

/// Rows of one join input bucketed by join key, with multiplicities.
#[derive(Debug, Default)]
struct JoinIndex {
    buckets: FastMap<Datum, IndexMap<RowId, (OutputRow, u32)>>,
}

impl JoinIndex {
    fn insert(&mut self, key: Datum, row: OutputRow) {
        let bucket = self.buckets.entry(key).or_default();
        match bucket.get_mut(&row.id) {
            Some((stored, count)) => {
                *stored = row;
                *count += 1;
            }
            None => {
                bucket.insert(row.id.clone(), (row, 1));
            }
        }
    }

    fn remove(&mut self, key: &Datum, id: &RowId) -> bool {
        let Some(bucket) = self.buckets.get_mut(key) else {
            return false;
        };
        let Some((_, count)) = bucket.get_mut(id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            bucket.swap_remove(id);
            if bucket.is_empty() {
                self.buckets.remove(key);
            }
        }
        true
    }

    fn matches<'a>(&'a self, key: &Datum) -> impl Iterator<Item = &'a (OutputRow, u32)> + 'a {
        self.buckets
            .get(key)
            .into_iter()
            .flat_map(|bucket| bucket.values())
    }

    fn has_matches(&self, key: &Datum) -> bool {
        self.buckets.contains_key(key)
    }
}

/// Null or missing join keys never match anything.
#[inline]
fn join_key(path: &Path, row: &Row) -> Option<Datum> {
    match path.resolve(row) {
        None | Some(Datum::Null) => None,
        Some(v) => Some(v.clone()),
    }
}

/// Equi-join. Each output row is the left row with one extra column, named
/// by the alias, holding the matched right row. Output identities use the
/// relation name of the whole join and the keys of both sides. A left join emits unmatched
/// left rows with that column set to null, and retracts that row before the
/// first match is added.
#[derive(Debug)]
pub(crate) struct JoinNode {
    kind: JoinKind,
    relation: SmolStr,
    alias: SmolStr,
    left_field: Path,
    right_field: Path,
    left: JoinIndex,
    right: JoinIndex,
}

impl JoinNode {
    pub(crate) fn new(
        kind: JoinKind,
        relation: SmolStr,
        alias: SmolStr,
        left_field: Path,
        right_field: Path,
    ) -> Self {
        Self {
            kind,
            relation,
            alias,
            left_field,
            right_field,
            left: JoinIndex::default(),
            right: JoinIndex::default(),
        }
    }

    fn combine(&self, left: &OutputRow, right: Option<&OutputRow>) -> OutputRow {
        let mut key = left.id.key.clone();
        let mut row = left.row.clone();
        match right {
            Some(r) => {
                key.extend_qualified(&self.alias, &r.id.key);
                row.insert(self.alias.clone(), Datum::Object(r.row.clone()));
            }
            None => {
                key.push(self.alias.clone(), Datum::Null);
                row.insert(self.alias.clone(), Datum::Null);
            }
        }
        OutputRow::new(RowId::new(self.relation.clone(), key), row)
    }

    fn emit_for_left(&self, left: &OutputRow, key: Option<&Datum>, sign: i64, out: &mut Vec<Change>) {
        let mut matched = false;
        if let Some(key) = key {
            for (right, count) in self.right.matches(key) {
                matched = true;
                for _ in 0..*count {
                    out.push(Change::with_weight(self.combine(left, Some(right)), sign));
                }
            }
        }
        if !matched && self.kind == JoinKind::Left {
            out.push(Change::with_weight(self.combine(left, None), sign));
        }
    }

    pub(crate) fn push_left(&mut self, change: Change, out: &mut Vec<Change>) {
        let key = join_key(&self.left_field, change.row());
        match change {
            Change::Add(left) => {
                self.emit_for_left(&left, key.as_ref(), 1, out);
                if let Some(key) = key {
                    self.left.insert(key, left);
                }
            }
            Change::Remove(left) => {
                if let Some(key) = &key {
                    if !self.left.remove(key, &left.id) {
                        tracing::warn!(row = %left.id, "join: removing unknown left row");
                    }
                }
                self.emit_for_left(&left, key.as_ref(), -1, out);
            }
        }
    }

    pub(crate) fn push_right(&mut self, change: Change, out: &mut Vec<Change>) {
        let Some(key) = join_key(&self.right_field, change.row()) else {
            return;
        };
        let outer = self.kind == JoinKind::Left;
        match change {
            Change::Add(right) => {
                let first = !self.right.has_matches(&key);
                for (left, count) in self.left.matches(&key) {
                    for _ in 0..*count {
                        if first && outer {
                            out.push(Change::Remove(self.combine(left, None)));
                        }
                        out.push(Change::Add(self.combine(left, Some(&right))));
                    }
                }
                self.right.insert(key, right);
            }
            Change::Remove(right) => {
                if !self.right.remove(&key, &right.id) {
                    tracing::warn!(row = %right.id, "join: removing unknown right row");
                    return;
                }
                let last = !self.right.has_matches(&key);
                for (left, count) in self.left.matches(&key) {
                    for _ in 0..*count {
                        out.push(Change::Remove(self.combine(left, Some(&right))));
                        if last && outer {
                            out.push(Change::Add(self.combine(left, None)));
                        }
                    }
                }
            }
        }
    }
}
