pub mod config;
pub mod db;
pub mod error;
pub mod oauth_utils;
pub mod orchestrator;
pub mod provider;
pub mod server;
pub mod sync;
mod utils;
pub mod watch;

pub use error::{ProviderError, SyncError};
pub use orchestrator::SyncOrchestratorHandle;
pub use sync::SyncService;
