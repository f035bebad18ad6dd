//! Database module: models and schema for persistent storage.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `patch.rs`: credential upsert/patch payloads
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `entities.rs`: host item tables exposed through `EntityStore`

pub mod actor;
pub mod models;
pub mod patch;
pub mod schema;

mod entities;

pub use models::{
    Credential, LinkStats, ManagedCalendarState, SyncDirection, SyncLink, SyncStatus, WatchChannel,
};
pub use patch::{CredentialPatch, CredentialUpsert};
pub use schema::SQLITE_INIT;

pub use actor::{DbActorHandle, spawn};
