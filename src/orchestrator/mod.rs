//! Per-user run scheduling: debounce, single-flight, retry with backoff, suspension on auth
//! failure, and the polling fallback.

mod actor;
mod poller;
pub mod registry;

pub use actor::{OrchestratorMessage, SyncOrchestratorHandle};
pub use poller::{poll_once, spawn_poller};
pub use registry::{Effect, Phase, Registry, RetryPolicy, RunOutcome};

use crate::error::SyncError;
use crate::sync::SyncSummary;
use async_trait::async_trait;
use std::time::Duration;

/// One complete sync run for a user. The orchestrator guarantees runs of one user never overlap.
#[async_trait]
pub trait SyncRunner: Send + Sync + 'static {
    async fn run(&self, user_id: &str) -> Result<SyncSummary, SyncError>;

    /// Persist that the user's credential must be re-authorized.
    async fn mark_needs_reauth(&self, user_id: &str) -> Result<(), SyncError>;
}

/// Sink for debounced sync triggers.
pub trait SyncTrigger: Send + Sync {
    /// `None` uses the orchestrator's configured debounce.
    fn schedule_sync(&self, user_id: &str, debounce: Option<Duration>) -> Result<(), SyncError>;
}
