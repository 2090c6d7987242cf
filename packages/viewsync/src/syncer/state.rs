use serde::Serialize;
use std::fmt;

/// Lifecycle of a view syncer.
///
/// `Idle -> Hydrating -> Streaming -> Draining -> Stopped`. A fatal error
/// from any state goes straight to `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncerState {
    /// Record loaded, queries not yet hydrated.
    Idle,
    Hydrating,
    /// Applying upstream batches as they arrive.
    Streaming,
    /// No new work is accepted. Stops once in-flight work is done.
    Draining,
    Stopped,
}

impl SyncerState {
    pub fn name(self) -> &'static str {
        match self {
            SyncerState::Idle => "idle",
            SyncerState::Hydrating => "hydrating",
            SyncerState::Streaming => "streaming",
            SyncerState::Draining => "draining",
            SyncerState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SyncerState::Stopped
    }
}

impl fmt::Display for SyncerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
