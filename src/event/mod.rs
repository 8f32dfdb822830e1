//! Contains the events and event handlers for command, SDAM, and connection-pool monitoring.
//!
//! Handlers are registered on [`ClientOptions`](crate::options::ClientOptions). Events are
//! passed to handlers by value; a handler must not retain references into an event past the
//! scope of a single call and should not block, as events are emitted from hot paths.

pub mod cmap;
pub mod command;
pub mod sdam;
