//! Point-to-point message router.
//!
//! Delivers a directed message to a connected recipient, looked up in the
//! [`ConnectionRegistry`]. Best effort and at most once: an absent recipient
//! means the message is dropped and only logged; the sender never hears back.

use super::registry::ConnectionRegistry;
use lobby_core::messages::DeliveredMessage;
use lobby_core::{Identity, ServerEvent};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// What happened to a routed message. Never reported to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's connection.
    Delivered,
    /// Recipient not connected.
    RecipientAbsent,
    /// Recipient connected but its queue was full or closing.
    Dropped,
}

/// Routes messages between connected peers.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `{from: sender, type: kind, data}` to `recipient`.
    pub async fn route(
        &self,
        sender: &Identity,
        recipient: &Identity,
        kind: String,
        data: Value,
    ) -> Delivery {
        let event = ServerEvent::Message(DeliveredMessage {
            from: sender.clone(),
            kind,
            data,
        });

        match self.registry.with_client(recipient, |client| client.push(event)).await {
            Some(true) => {
                debug!(from = %sender, to = %recipient, "message delivered");
                Delivery::Delivered
            }
            Some(false) => Delivery::Dropped,
            None => {
                info!(from = %sender, to = %recipient, "message can't be delivered, no such client");
                Delivery::RecipientAbsent
            }
        }
    }

    /// Access the underlying registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}
