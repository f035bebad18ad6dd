pub mod sync;
pub mod webhook;
