//! Wire types for the calendar provider REST surface.
//!
//! Only the provider boundary of `caresync` (de)serializes these; everything downstream works
//! with the typed values.

pub mod acl;
pub mod calendar;
pub mod channel;
pub mod error;
pub mod event;

pub use acl::{AclListPage, AclRule, AclScope, role_rank};
pub use calendar::{Calendar, CalendarListEntry, CalendarListPage};
pub use channel::{Channel, StopChannelRequest, WatchParams, WatchRequest};
pub use error::{ProviderErrorBody, ProviderErrorDetail, ProviderErrorObject};
pub use event::{CalendarEvent, EventDateTime, EventStatus, EventsPage, ExtendedProperties};
