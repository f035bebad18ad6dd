//! Bidirectional sync engine: change detection, event mapping, managed calendar upkeep, and the
//! push and pull passes that make up one run.

pub mod hash;
pub mod managed;
pub mod pull;
pub mod push;
pub mod service;
pub mod transform;
pub mod types;

pub use hash::{calculate_hash, event_id_for};
pub use managed::{ManagedCalendarManager, MigrationReport};
pub use pull::PullEngine;
pub use push::PushEngine;
pub use service::SyncService;
pub use transform::{apply_remote_update, back_reference, build_event_payload};
pub use types::{
    Appointment, AppointmentStatus, Bill, BillStatus, EntityKind, EntityStore, ErrorReport,
    ItemError, MAX_REPORTED_ERRORS, PullOptions, PullSummary, PushSummary, SyncEntity,
    SyncStatusSummary, SyncSummary,
};

use crate::config::CancellationPolicy;
use crate::error::SyncError;
use tracing::debug;

/// Local consequence of a remote event disappearing. Items are never hard-deleted.
pub(crate) async fn apply_cancellation(
    store: &dyn EntityStore,
    policy: CancellationPolicy,
    item_id: &str,
) -> Result<(), SyncError> {
    match policy {
        CancellationPolicy::Detach => Ok(()),
        CancellationPolicy::Cancel => match store.get_entity(item_id).await? {
            Some(entity) if !entity.is_cancelled() => store.cancel_entity(item_id).await,
            Some(_) => Ok(()),
            None => {
                debug!(item_id, "Item already gone; nothing to cancel");
                Ok(())
            }
        },
    }
}
