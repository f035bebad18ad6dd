//! HTTP trigger surface.

pub mod guards;
pub mod router;
pub mod routes;

pub use router::{CareSyncState, caresync_router};
