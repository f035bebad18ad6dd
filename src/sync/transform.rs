//! Local item <-> calendar event mapping.

use super::types::{EntityKind, SyncEntity};
use crate::error::SyncError;
use caresync_schema::{CalendarEvent, EventDateTime, EventStatus, ExtendedProperties};
use chrono::{DateTime, NaiveDate, Utc};

pub const PROP_KIND: &str = "caresyncKind";
pub const PROP_ID: &str = "caresyncId";
pub const PROP_STATUS: &str = "caresyncStatus";
pub const PROP_AMOUNT_CENTS: &str = "amountCents";
pub const PROP_CURRENCY: &str = "currency";

fn invalid(entity: &SyncEntity, message: impl Into<String>) -> SyncError {
    SyncError::Validation {
        item_id: entity.id().to_string(),
        message: message.into(),
    }
}

/// `4250` -> `42.50`.
fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Outbound representation of a local item.
pub fn build_event_payload(entity: &SyncEntity) -> Result<CalendarEvent, SyncError> {
    if entity.title().trim().is_empty() {
        return Err(invalid(entity, "title must not be empty"));
    }

    let mut private = std::collections::BTreeMap::new();
    private.insert(PROP_KIND.to_string(), entity.kind().as_str().to_string());
    private.insert(PROP_ID.to_string(), entity.id().to_string());
    private.insert(PROP_STATUS.to_string(), entity.status_str().to_string());

    let mut event = CalendarEvent {
        summary: Some(entity.title().to_string()),
        status: Some(EventStatus::Confirmed),
        ..Default::default()
    };

    match entity {
        SyncEntity::Appointment(a) => {
            if a.ends_at < a.starts_at {
                return Err(invalid(entity, "end is before start"));
            }
            if a.ends_at == a.starts_at {
                return Err(invalid(entity, "duration must be positive"));
            }
            // Patches leave omitted fields alone; an empty string clears them remotely.
            event.description = Some(a.notes.clone().unwrap_or_default());
            event.location = Some(a.location.clone().unwrap_or_default());
            event.start = Some(EventDateTime::timed(a.starts_at));
            event.end = Some(EventDateTime::timed(a.ends_at));
        }
        SyncEntity::Bill(b) => {
            if b.currency.trim().is_empty() {
                return Err(invalid(entity, "currency must not be empty"));
            }
            let next_day = b
                .due_date
                .succ_opt()
                .ok_or_else(|| invalid(entity, "due date out of range"))?;
            event.description = Some(format!(
                "Amount due: {} {}",
                format_amount(b.amount_cents),
                b.currency
            ));
            event.start = Some(EventDateTime::all_day(b.due_date));
            event.end = Some(EventDateTime::all_day(next_day));
            private.insert(PROP_AMOUNT_CENTS.to_string(), b.amount_cents.to_string());
            private.insert(PROP_CURRENCY.to_string(), b.currency.clone());
        }
    }

    event.extended_properties = Some(ExtendedProperties {
        private,
        ..Default::default()
    });
    Ok(event)
}

/// The local item an event was created for, if it carries our back-reference.
pub fn back_reference(event: &CalendarEvent) -> Option<(EntityKind, String)> {
    let kind = EntityKind::parse(event.private_property(PROP_KIND)?)?;
    let id = event.private_property(PROP_ID)?;
    (!id.is_empty()).then(|| (kind, id.to_string()))
}

fn instant(boundary: Option<&EventDateTime>) -> Option<DateTime<Utc>> {
    let boundary = boundary?;
    boundary.date_time.or_else(|| {
        boundary
            .date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    })
}

fn day(boundary: Option<&EventDateTime>) -> Option<NaiveDate> {
    boundary.and_then(EventDateTime::day)
}

/// Fold a remote edit into the local item. Only sync-owned fields are touched: ids, owner and
/// status stay local.
pub fn apply_remote_update(
    entity: &SyncEntity,
    remote: &CalendarEvent,
) -> Result<SyncEntity, SyncError> {
    let mut updated = entity.clone();
    let title = remote
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match &mut updated {
        SyncEntity::Appointment(a) => {
            if let Some(title) = title {
                a.title = title.to_string();
            }
            if let Some(start) = instant(remote.start.as_ref()) {
                a.starts_at = start;
            }
            if let Some(end) = instant(remote.end.as_ref()) {
                a.ends_at = end;
            }
            // The provider omits empty fields, so absence means cleared.
            a.location = remote.location.clone().filter(|s| !s.is_empty());
            a.notes = remote.description.clone().filter(|s| !s.is_empty());
            if a.ends_at <= a.starts_at {
                return Err(invalid(entity, "remote event ends before it starts"));
            }
        }
        SyncEntity::Bill(b) => {
            if let Some(title) = title {
                b.title = title.to_string();
            }
            if let Some(due) = day(remote.start.as_ref()) {
                b.due_date = due;
            }
            if let Some(amount) = remote
                .private_property(PROP_AMOUNT_CENTS)
                .and_then(|raw| raw.parse::<i64>().ok())
            {
                b.amount_cents = amount;
            }
            if let Some(currency) = remote
                .private_property(PROP_CURRENCY)
                .filter(|c| !c.trim().is_empty())
            {
                b.currency = currency.to_string();
            }
        }
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::{Appointment, AppointmentStatus, Bill, BillStatus};
    use chrono::TimeZone;

    fn appointment() -> SyncEntity {
        SyncEntity::Appointment(Appointment {
            id: "appt-1".into(),
            user_id: "u1".into(),
            title: "Cardiology".into(),
            starts_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
            ends_at: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
            location: Some("Clinic A".into()),
            notes: Some("Bring referral".into()),
            status: AppointmentStatus::Scheduled,
            updated_at: Utc::now(),
        })
    }

    fn bill() -> SyncEntity {
        SyncEntity::Bill(Bill {
            id: "bill-1".into(),
            user_id: "u1".into(),
            title: "Pharmacy".into(),
            amount_cents: 4_250,
            currency: "EUR".into(),
            due_date: NaiveDate::from_ymd_opt(2025, 4, 10).unwrap(),
            status: BillStatus::Pending,
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn appointment_becomes_timed_event_with_back_reference() {
        let event = build_event_payload(&appointment()).unwrap();
        assert_eq!(event.summary.as_deref(), Some("Cardiology"));
        assert_eq!(event.description.as_deref(), Some("Bring referral"));
        assert!(event.start.as_ref().unwrap().date_time.is_some());
        assert_eq!(event.private_property(PROP_STATUS), Some("scheduled"));
        assert_eq!(
            back_reference(&event),
            Some((EntityKind::Appointment, "appt-1".to_string()))
        );
    }

    #[test]
    fn bill_becomes_all_day_event_on_due_date() {
        let event = build_event_payload(&bill()).unwrap();
        let start = event.start.as_ref().unwrap();
        let end = event.end.as_ref().unwrap();
        assert_eq!(start.date, NaiveDate::from_ymd_opt(2025, 4, 10));
        assert_eq!(end.date, NaiveDate::from_ymd_opt(2025, 4, 11));
        assert_eq!(event.description.as_deref(), Some("Amount due: 42.50 EUR"));
        assert_eq!(event.private_property(PROP_AMOUNT_CENTS), Some("4250"));
    }

    #[test]
    fn invalid_items_are_rejected() {
        let SyncEntity::Appointment(mut a) = appointment() else {
            unreachable!()
        };
        a.ends_at = a.starts_at - chrono::Duration::minutes(5);
        let err = build_event_payload(&SyncEntity::Appointment(a.clone())).unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref item_id, .. } if item_id == "appt-1"));

        a.ends_at = a.starts_at;
        assert!(build_event_payload(&SyncEntity::Appointment(a.clone())).is_err());

        a.ends_at = a.starts_at + chrono::Duration::hours(1);
        a.title = "   ".into();
        assert!(build_event_payload(&SyncEntity::Appointment(a)).is_err());
    }

    #[test]
    fn remote_edit_touches_only_sync_owned_fields() {
        let local = appointment();
        let mut remote = build_event_payload(&local).unwrap();
        remote.summary = Some("Cardiology (moved)".into());
        remote.location = None;
        remote.start = Some(EventDateTime::timed(
            Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap(),
        ));
        remote.end = Some(EventDateTime::timed(
            Utc.with_ymd_and_hms(2025, 3, 2, 10, 0, 0).unwrap(),
        ));
        remote.status = Some(EventStatus::Tentative);

        let SyncEntity::Appointment(updated) = apply_remote_update(&local, &remote).unwrap() else {
            panic!("kind must not change");
        };
        assert_eq!(updated.title, "Cardiology (moved)");
        assert_eq!(updated.location, None);
        assert_eq!(updated.starts_at.to_rfc3339(), "2025-03-02T09:00:00+00:00");
        assert_eq!(updated.id, "appt-1");
        assert_eq!(updated.status, AppointmentStatus::Scheduled);
    }

    #[test]
    fn remote_bill_edit_reads_amount_from_private_block() {
        let local = bill();
        let mut remote = build_event_payload(&local).unwrap();
        remote
            .extended_properties
            .as_mut()
            .unwrap()
            .private
            .insert(PROP_AMOUNT_CENTS.into(), "5000".into());
        remote.start = Some(EventDateTime::all_day(NaiveDate::from_ymd_opt(2025, 4, 12).unwrap()));

        let SyncEntity::Bill(updated) = apply_remote_update(&local, &remote).unwrap() else {
            panic!("kind must not change");
        };
        assert_eq!(updated.amount_cents, 5_000);
        assert_eq!(updated.due_date, NaiveDate::from_ymd_opt(2025, 4, 12).unwrap());
        assert_eq!(updated.status, BillStatus::Pending);
    }

    #[test]
    fn foreign_events_have_no_back_reference() {
        let event = CalendarEvent {
            summary: Some("Lunch".into()),
            ..Default::default()
        };
        assert_eq!(back_reference(&event), None);
    }
}
