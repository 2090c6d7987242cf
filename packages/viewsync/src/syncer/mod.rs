//! The per-group orchestrator: drives query pipelines, commits the client
//! view record and pokes connected clients.

mod state;
mod view_syncer;

pub use state::SyncerState;
pub use view_syncer::{ConnectRequest, GroupSummary, ViewSyncer};
