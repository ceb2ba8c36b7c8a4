//! Session id → live connection lookup, used to push turn results.

use super::messages::{ServerEnvelope, ServerEvent};
use crate::pipeline::{DeliverySink, TurnEvent};
use actix::Recipient;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

struct Connection {
    /// Distinguishes a reconnect from the connection it replaced
    id: Uuid,
    recipient: Recipient<ServerEvent>,
}

#[derive(Clone, Default)]
pub struct ConnectionHub {
    connections: Arc<RwLock<HashMap<String, Connection>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events for `session_id` to this connection, replacing any earlier one.
    pub fn register(&self, session_id: &str, connection_id: Uuid, recipient: Recipient<ServerEvent>) {
        let previous = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session_id.to_string(),
                Connection {
                    id: connection_id,
                    recipient,
                },
            );
        if let Some(previous) = previous {
            if previous.id != connection_id {
                debug!(session_id, old = %previous.id, new = %connection_id, "Session moved to a new connection");
            }
        }
    }

    /// Remove the route, but only if it still points at `connection_id`.
    pub fn unregister(&self, session_id: &str, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        match connections.get(session_id) {
            Some(connection) if connection.id == connection_id => {
                connections.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Push an envelope to the session's connection. Returns false when it
    /// could not be handed over.
    pub fn send(&self, envelope: ServerEnvelope) -> bool {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        let Some(connection) = connections.get(&envelope.session_id) else {
            debug!(session_id = %envelope.session_id, "No live connection for session");
            return false;
        };
        let session_id = envelope.session_id.clone();
        match connection.recipient.try_send(ServerEvent(envelope)) {
            Ok(()) => true,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Connection mailbox rejected event");
                false
            }
        }
    }
}

impl DeliverySink for ConnectionHub {
    fn deliver(&self, event: TurnEvent) {
        let session_id = event.session_id().to_string();
        if !self.send(ServerEnvelope::from_turn(event)) {
            warn!(session_id = %session_id, "Dropping turn result, caller is gone");
        }
    }
}
