use super::types::{ClientId, QueryHash, QueryRefs};
use super::version::CvrVersion;
use crate::engine::operators::Operator;
use crate::engine::types::{Row, RowId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchOp {
    Put,
    Del,
}

/// Query membership of a row before and after a change. Client handlers use
/// it to decide whether the change is visible to their client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowRefs {
    pub before: QueryRefs,
    pub after: QueryRefs,
    pub contents_changed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Patch {
    Client {
        op: PatchOp,
        client_id: ClientId,
    },
    /// With `client_id` set this is a change to that client's desired
    /// queries; without it, to the queries materialized for the group.
    Query {
        op: PatchOp,
        hash: QueryHash,
        ast: Option<Operator>,
        client_id: Option<ClientId>,
    },
    Row {
        op: PatchOp,
        id: RowId,
        contents: Option<Row>,
        refs: RowRefs,
    },
}

/// A patch and the CVR version it brings a client to.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchToVersion {
    pub patch: Patch,
    pub to_version: CvrVersion,
    /// Only this client receives the patch, regardless of its visibility.
    pub scope: Option<ClientId>,
}

impl PatchToVersion {
    pub fn new(patch: Patch, to_version: CvrVersion) -> Self {
        Self {
            patch,
            to_version,
            scope: None,
        }
    }

    pub fn scoped(patch: Patch, to_version: CvrVersion, client_id: impl Into<ClientId>) -> Self {
        Self {
            patch,
            to_version,
            scope: Some(client_id.into()),
        }
    }

    pub fn is_row(&self) -> bool {
        matches!(self.patch, Patch::Row { .. })
    }
}
