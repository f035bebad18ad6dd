use crate::error::SyncError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Upper bound on per-item error entries carried in a run summary.
pub const MAX_REPORTED_ERRORS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Appointment,
    Bill,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Appointment => "appointment",
            EntityKind::Bill => "bill",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "appointment" => Some(EntityKind::Appointment),
            "bill" => Some(EntityKind::Bill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Pending,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Appointment {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Bill {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub amount_cents: i64,
    pub currency: String,
    pub due_date: NaiveDate,
    pub status: BillStatus,
    pub updated_at: DateTime<Utc>,
}

/// A local item that mirrors onto one calendar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEntity {
    Appointment(Appointment),
    Bill(Bill),
}

impl SyncEntity {
    pub fn id(&self) -> &str {
        match self {
            SyncEntity::Appointment(a) => &a.id,
            SyncEntity::Bill(b) => &b.id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            SyncEntity::Appointment(a) => &a.user_id,
            SyncEntity::Bill(b) => &b.user_id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            SyncEntity::Appointment(_) => EntityKind::Appointment,
            SyncEntity::Bill(_) => EntityKind::Bill,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            SyncEntity::Appointment(a) => &a.title,
            SyncEntity::Bill(b) => &b.title,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            SyncEntity::Appointment(a) => a.status == AppointmentStatus::Cancelled,
            SyncEntity::Bill(b) => b.status == BillStatus::Cancelled,
        }
    }

    /// Status as it is embedded in the remote event.
    pub fn status_str(&self) -> &'static str {
        match self {
            SyncEntity::Appointment(a) => match a.status {
                AppointmentStatus::Scheduled => "scheduled",
                AppointmentStatus::Completed => "completed",
                AppointmentStatus::Cancelled => "cancelled",
            },
            SyncEntity::Bill(b) => match b.status {
                BillStatus::Pending => "pending",
                BillStatus::Paid => "paid",
                BillStatus::Cancelled => "cancelled",
            },
        }
    }
}

/// Read/update-by-id access to the host's appointment and bill records.
///
/// Item ids are unique across kinds.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, item_id: &str) -> Result<Option<SyncEntity>, SyncError>;

    /// Every item of the user, cancelled ones included.
    async fn list_entities_for_user(&self, user_id: &str) -> Result<Vec<SyncEntity>, SyncError>;

    /// Overwrite the sync-owned fields of an existing item.
    async fn update_entity(&self, entity: SyncEntity) -> Result<(), SyncError>;

    async fn cancel_entity(&self, item_id: &str) -> Result<(), SyncError>;

    async fn upsert_entity(&self, entity: SyncEntity) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item_id: String,
    pub message: String,
}

/// Per-item errors, bounded to [`MAX_REPORTED_ERRORS`]; the total is always counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub total: usize,
    pub items: Vec<ItemError>,
}

impl ErrorReport {
    pub fn record(&mut self, item_id: impl Into<String>, message: impl Into<String>) {
        self.total += 1;
        if self.items.len() < MAX_REPORTED_ERRORS {
            self.items.push(ItemError {
                item_id: item_id.into(),
                message: message.into(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSummary {
    pub considered: usize,
    pub pushed: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
    pub errors: ErrorReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSummary {
    pub fetched: usize,
    pub applied: usize,
    pub cancelled: usize,
    pub linked: usize,
    pub repush_marked: usize,
    pub skipped: usize,
    pub full_resync: bool,
    pub recovered: bool,
    pub errors: ErrorReport,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PullOptions {
    pub force_full: bool,
}

/// Outcome of one push-then-pull run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub user_id: String,
    pub calendar_id: Option<String>,
    pub push: PushSummary,
    pub pull: PullSummary,
    pub migrated: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// User-visible sync health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusSummary {
    pub connected: bool,
    pub calendar_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_pending_count: i64,
    pub last_error: Option<String>,
    pub needs_reauth: bool,
}
