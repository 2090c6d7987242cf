//! Server-side view synchronization.
//!
//! Clients of a group declare queries over a replicated dataset. The
//! [`engine`] keeps each query's result up to date incrementally, the
//! [`cvr`] module records what every group has been sent, and a
//! [`syncer::ViewSyncer`] per group turns result changes into ordered,
//! resumable pokes through one [`client_handler::ClientHandler`] per
//! connection.

pub mod client_handler;
pub mod cvr;
pub mod engine;
pub mod error;
pub mod router;
pub mod schema;
mod serde_util;
pub mod syncer;

pub use client_handler::{ClientHandler, HandlerOptions, PokeHandler};
pub use cvr::{CvrStore, CvrVersion, MemoryCvrStore, RedbCvrStore};
pub use engine::{Operator, Pipeline, Predicate, Replica, VersionedBatch};
pub use error::{CvrError, PipelineError, ReplicaError, SchemaError, SyncError};
pub use router::Router;
pub use schema::{ReplicaSchema, SchemaConfig, TableSchema};
pub use syncer::{ConnectRequest, SyncerState, ViewSyncer};
