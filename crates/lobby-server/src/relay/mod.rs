//! Presence and relay: connection registry and message router.

pub mod broker;
pub mod registry;

pub use broker::{Delivery, MessageRouter};
pub use registry::{Client, ConnectionId, ConnectionRegistry, Inbox};
