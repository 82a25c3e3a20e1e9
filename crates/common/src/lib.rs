//! Shared domain types for the event-distribution gateway.

pub mod event;
pub mod identity;

pub use event::Event;
pub use identity::{Identity, ROLE_TABLE};
