//! Change detection over the fields that reach the remote event.
//!
//! Each field is encoded as `u32` name length, name, a presence byte and, when present, a `u64`
//! value length and the value bytes. The digest is SHA-256, hex encoded.

use super::types::SyncEntity;
use sha2::{Digest, Sha256};

struct Canonical(Sha256);

impl Canonical {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn field(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        self.0.update((name.len() as u32).to_be_bytes());
        self.0.update(name.as_bytes());
        match value {
            Some(v) => {
                self.0.update([1u8]);
                self.0.update((v.len() as u64).to_be_bytes());
                self.0.update(v.as_bytes());
            }
            None => self.0.update([0u8]),
        }
        self
    }

    fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

pub fn calculate_hash(entity: &SyncEntity) -> String {
    let mut c = Canonical::new();
    match entity {
        SyncEntity::Appointment(a) => {
            c.field("kind", Some("appointment"))
                .field("title", Some(a.title.as_str()))
                .field("starts_at", Some(a.starts_at.timestamp_millis().to_string().as_str()))
                .field("ends_at", Some(a.ends_at.timestamp_millis().to_string().as_str()))
                .field("location", a.location.as_deref())
                .field("notes", a.notes.as_deref());
        }
        SyncEntity::Bill(b) => {
            c.field("kind", Some("bill"))
                .field("title", Some(b.title.as_str()))
                .field("amount_cents", Some(b.amount_cents.to_string().as_str()))
                .field("currency", Some(b.currency.as_str()))
                .field("due_date", Some(b.due_date.format("%Y-%m-%d").to_string().as_str()));
        }
    }
    c.field("status", Some(entity.status_str()));
    c.finish()
}

/// Client-assigned id for the item's event. It is stable per item, so a replayed insert collides
/// with the first one instead of creating a second event. Hex digits fall inside the provider's
/// base32hex id alphabet.
pub fn event_id_for(entity: &SyncEntity) -> String {
    let mut c = Canonical::new();
    c.field("kind", Some(entity.kind().as_str()))
        .field("owner", Some(entity.user_id()))
        .field("id", Some(entity.id()));
    let mut id = c.finish();
    id.truncate(32);
    id
}
