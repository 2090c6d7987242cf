use super::patch::{Patch, PatchOp, PatchToVersion, RowRefs};
use super::types::{Cvr, QueryHash, QueryRefs, RowRecord};
use super::version::CvrVersion;
use crate::engine::pipeline::consolidate;
use crate::engine::types::{Change, OutputRow, Row, RowId, WeightTransition, ZSet, ZSetOps};
use std::collections::BTreeMap;

/// Fold pipeline output into the record and return the row patches it
/// implies, ordered by row identity.
///
/// A row is put when its contents differ from what the group was last sent
/// or when the set of queries referencing it changed, and deleted (leaving a
/// tombstone) when no query references it anymore. A row unchanged since it
/// was last sent produces no patch even if a different query now
/// produced it.
pub fn apply_results(
    cvr: &mut Cvr,
    results: &[(QueryHash, Vec<Change>)],
    version: &CvrVersion,
) -> Vec<PatchToVersion> {
    let mut touched: BTreeMap<RowId, Option<Row>> = BTreeMap::new();
    for (_, changes) in results {
        for change in changes {
            match change {
                Change::Add(out) => {
                    touched.insert(out.id.clone(), Some(out.row.clone()));
                }
                Change::Remove(out) => {
                    touched.entry(out.id.clone()).or_insert(None);
                }
            }
        }
    }
    if touched.is_empty() {
        return Vec::new();
    }

    let mut refs_before: BTreeMap<RowId, QueryRefs> = touched
        .keys()
        .map(|id| (id.clone(), cvr.refs(id)))
        .collect();

    for (hash, changes) in results {
        let Some(query) = cvr.queries.get_mut(hash) else {
            tracing::warn!(query = %hash, "results for unknown query");
            continue;
        };
        let mut weights = ZSet::default();
        for change in changes {
            weights.add_weight(change.id(), change.weight());
        }
        for (id, delta) in weights {
            let old = i64::from(query.rows.contains(&id));
            match WeightTransition::compute(old, old + delta) {
                WeightTransition::Inserted => {
                    query.rows.insert(id);
                }
                WeightTransition::Deleted => {
                    query.rows.remove(&id);
                }
                _ => {}
            }
        }
    }

    let mut patches = Vec::new();
    for (id, latest) in touched {
        let before = refs_before.remove(&id).unwrap_or_default();
        let after = cvr.refs(&id);
        let sent = cvr.rows.get(&id).and_then(|r| r.contents.clone());

        if !after.is_empty() {
            let Some(contents) = latest.or_else(|| sent.clone()) else {
                tracing::warn!(row = %id, "referenced row without contents");
                continue;
            };
            let contents_changed = sent.as_ref() != Some(&contents);
            if !contents_changed && before == after {
                continue;
            }
            cvr.rows.insert(
                id.clone(),
                RowRecord {
                    contents: Some(contents.clone()),
                    version: version.clone(),
                },
            );
            patches.push(PatchToVersion::new(
                Patch::Row {
                    op: PatchOp::Put,
                    id,
                    contents: Some(contents),
                    refs: RowRefs {
                        before,
                        after,
                        contents_changed,
                    },
                },
                version.clone(),
            ));
        } else if !before.is_empty() {
            cvr.rows.insert(
                id.clone(),
                RowRecord {
                    contents: None,
                    version: version.clone(),
                },
            );
            patches.push(PatchToVersion::new(
                Patch::Row {
                    op: PatchOp::Del,
                    id,
                    contents: None,
                    refs: RowRefs {
                        before,
                        after,
                        contents_changed: false,
                    },
                },
                version.clone(),
            ));
        }
    }
    patches
}

/// Turn a query's complete result into a delta against what the record
/// says the query contains, so rehydrating after a restart only patches
/// what actually changed.
pub fn result_as_delta(cvr: &Cvr, hash: &str, result: Vec<Change>) -> Vec<Change> {
    let mut delta = Vec::with_capacity(result.len());
    if let Some(query) = cvr.queries.get(hash) {
        for id in &query.rows {
            if let Some(contents) = cvr.rows.get(id).and_then(|r| r.contents.clone()) {
                delta.push(Change::Remove(OutputRow::new(id.clone(), contents)));
            }
        }
    }
    delta.extend(result);
    consolidate(delta)
}
