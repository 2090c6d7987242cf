use super::patch::{Patch, PatchOp, PatchToVersion, RowRefs};
use super::types::Cvr;
use super::version::{CvrVersion, NullableCvrVersion};

/// Everything a client at `since` is missing to reach the record's current
/// version, scoped to that client.
///
/// Rows are put when they changed after `since` or became visible through a
/// query the client started desiring after `since`. Rows the client cannot
/// see are deleted when they changed after `since`, or when the client
/// stopped desiring one of their queries after `since`. A client without a
/// cookie gets every visible row and no deletes.
pub fn catchup_patches(cvr: &Cvr, client_id: &str, since: &NullableCvrVersion) -> Vec<PatchToVersion> {
    let Some(client) = cvr.clients.get(client_id) else {
        return Vec::new();
    };
    let newer = |v: &CvrVersion| since.as_ref().map_or(true, |s| v > s);
    let mut patches = Vec::new();
    let scoped = |patch: Patch, v: &CvrVersion| PatchToVersion::scoped(patch, v.clone(), client_id);

    for other in cvr.clients.values().filter(|c| newer(&c.patch_version)) {
        patches.push(scoped(
            Patch::Client {
                op: PatchOp::Put,
                client_id: other.id.clone(),
            },
            &other.patch_version,
        ));
    }

    for query in cvr.queries.values().filter(|q| !q.internal) {
        if let Some(v) = query.patch_version.as_ref().filter(|v| newer(v)) {
            patches.push(scoped(
                Patch::Query {
                    op: PatchOp::Put,
                    hash: query.hash.clone(),
                    ast: Some(query.ast.clone()),
                    client_id: None,
                },
                v,
            ));
        }
    }
    if since.is_some() {
        for (hash, v) in cvr.removed_queries.iter().filter(|(_, v)| newer(v)) {
            patches.push(scoped(
                Patch::Query {
                    op: PatchOp::Del,
                    hash: hash.clone(),
                    ast: None,
                    client_id: None,
                },
                v,
            ));
        }
    }

    for other in cvr.clients.values() {
        for (hash, v) in other.desired_queries.iter().filter(|(_, v)| newer(v)) {
            let ast = cvr.queries.get(hash).map(|q| q.ast.clone());
            patches.push(scoped(
                Patch::Query {
                    op: PatchOp::Put,
                    hash: hash.clone(),
                    ast,
                    client_id: Some(other.id.clone()),
                },
                v,
            ));
        }
        if since.is_some() {
            for (hash, v) in other.undesired_queries.iter().filter(|(_, v)| newer(v)) {
                patches.push(scoped(
                    Patch::Query {
                        op: PatchOp::Del,
                        hash: hash.clone(),
                        ast: None,
                        client_id: Some(other.id.clone()),
                    },
                    v,
                ));
            }
        }
    }

    let newly_desired: Vec<&String> = client
        .desired_queries
        .iter()
        .filter(|(_, v)| newer(v))
        .map(|(h, _)| h)
        .collect();
    let newly_undesired: Vec<(&String, &CvrVersion)> = client
        .undesired_queries
        .iter()
        .filter(|(_, v)| newer(v))
        .collect();

    for (id, record) in &cvr.rows {
        let refs = cvr.refs(id);
        let visible = refs.iter().any(|h| cvr.client_sees(client, h));
        if visible {
            let through_new_query = refs.iter().find_map(|h| {
                newly_desired
                    .contains(&h)
                    .then(|| &client.desired_queries[h])
            });
            let to_version = if newer(&record.version) {
                Some(&record.version)
            } else {
                through_new_query
            };
            if let Some(v) = to_version {
                patches.push(scoped(
                    Patch::Row {
                        op: PatchOp::Put,
                        id: id.clone(),
                        contents: record.contents.clone(),
                        refs: RowRefs {
                            before: refs.clone(),
                            after: refs,
                            contents_changed: true,
                        },
                    },
                    v,
                ));
            }
            continue;
        }
        if since.is_none() {
            continue;
        }
        let to_version = if newer(&record.version) {
            Some(&record.version)
        } else {
            newly_undesired
                .iter()
                .find(|(h, _)| refs.contains(*h))
                .map(|(_, v)| *v)
        };
        if let Some(v) = to_version {
            patches.push(scoped(
                Patch::Row {
                    op: PatchOp::Del,
                    id: id.clone(),
                    contents: None,
                    refs: RowRefs {
                        before: refs.clone(),
                        after: refs,
                        contents_changed: false,
                    },
                },
                v,
            ));
        }
    }

    patches.sort_by(|a, b| a.to_version.cmp(&b.to_version));
    patches
}
