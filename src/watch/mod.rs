//! Push-notification channels: registration, renewal, retirement and inbound verification.

mod manager;
mod renewer;

pub use manager::{
    HANDSHAKE_STATE, Notification, NotificationOutcome, RenewalReport, WatchManager,
};
pub use renewer::spawn_renewer;
