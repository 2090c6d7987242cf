use smol_str::SmolStr;
use thiserror::Error;
use viewsync_protocol::{ErrorBody, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("primary key column `{0}` is missing")]
    Missing(SmolStr),
    #[error("primary key column `{0}` is null")]
    Null(SmolStr),
}

/// Failures while building or running a query pipeline. Any of these makes
/// the query unusable, and since a group commits all queries together it
/// also stops the group.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("unknown table `{0}`")]
    UnknownTable(SmolStr),
    #[error("malformed row in `{table}`: {reason}")]
    MalformedRow { table: SmolStr, reason: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("table `{table}` is published with conflicting column lists")]
    ConflictingColumns { table: SmolStr },
    #[error("publication references unknown table `{0}`")]
    UnknownTable(SmolStr),
    #[error("table `{0}` has no primary key")]
    MissingPrimaryKey(SmolStr),
    #[error("invalid schema: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplicaError {
    #[error("batch version {got} is not newer than replica version {current}")]
    StaleVersion { current: u64, got: u64 },
    #[error("change for unknown table `{0}`")]
    UnknownTable(SmolStr),
    #[error("change for `{table}` has no row")]
    MissingRow { table: SmolStr },
    #[error("bad key in `{table}`: {source}")]
    Key { table: SmolStr, source: KeyError },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("invalid lexi version `{0}`")]
    InvalidLexi(String),
    #[error("invalid cookie `{0}`")]
    InvalidCookie(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CvrError {
    /// Someone else committed this group since we loaded it.
    #[error("cvr for `{group}` was at {found}, expected {expected}")]
    Conflict {
        group: String,
        expected: String,
        found: String,
    },
    #[error("cvr store temporarily unavailable: {0}")]
    Transient(String),
    #[error("cvr storage error: {0}")]
    Storage(String),
    #[error("cvr encoding error: {0}")]
    Encoding(String),
}

impl CvrError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CvrError::Transient(_))
    }
}

/// Errors raised by a view syncer. Some only affect one connection and are
/// reported to that client; the rest stop the whole client group.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("protocol version {0} is not supported")]
    VersionNotSupported(u32),
    #[error("schema version {0} is not supported")]
    SchemaVersionNotSupported(u32),
    #[error("invalid base cookie: {0}")]
    InvalidBaseCookie(String),
    #[error("base cookie {base} is ahead of server version {current}")]
    BaseCookieAhead { base: String, current: String },
    #[error("invalid connection request: {0}")]
    InvalidConnectionRequest(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("client `{0}` is not connected")]
    ClientNotFound(String),
    #[error("query {query} failed: {source}")]
    Pipeline {
        query: String,
        #[source]
        source: PipelineError,
    },
    #[error(transparent)]
    Cvr(#[from] CvrError),
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: &'static str },
    #[error("replica is at {replica:?}, syncer is at {syncer:?}")]
    ReplicaMismatch {
        replica: Option<u64>,
        syncer: Option<u64>,
    },
    #[error("group is being rebalanced")]
    Rebalance,
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the group must stop, as opposed to rejecting one client.
    pub fn is_fatal_to_group(&self) -> bool {
        match self {
            SyncError::Pipeline { .. }
            | SyncError::InvalidState { .. }
            | SyncError::ReplicaMismatch { .. }
            | SyncError::Internal(_) => true,
            SyncError::Cvr(e) => !e.is_transient(),
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Cvr(e) if e.is_transient())
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            SyncError::VersionNotSupported(_) => ErrorKind::VersionNotSupported,
            SyncError::SchemaVersionNotSupported(_) => ErrorKind::SchemaVersionNotSupported,
            SyncError::InvalidBaseCookie(_) | SyncError::BaseCookieAhead { .. } => {
                ErrorKind::InvalidConnectionRequestBaseCookie
            }
            SyncError::InvalidConnectionRequest(_) => ErrorKind::InvalidConnectionRequest,
            SyncError::InvalidMessage(_) => ErrorKind::InvalidMessage,
            SyncError::ClientNotFound(_) => ErrorKind::ClientNotFound,
            SyncError::Rebalance => ErrorKind::Rebalance,
            SyncError::Cvr(e) if e.is_transient() => ErrorKind::Unavailable,
            SyncError::Pipeline { .. }
            | SyncError::Cvr(_)
            | SyncError::InvalidState { .. }
            | SyncError::ReplicaMismatch { .. }
            | SyncError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.error_kind(), self.to_string())
    }
}

impl From<VersionError> for SyncError {
    fn from(e: VersionError) -> Self {
        SyncError::InvalidConnectionRequest(e.to_string())
    }
}
