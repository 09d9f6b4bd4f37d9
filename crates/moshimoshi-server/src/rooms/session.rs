use moshimoshi_protocol::{MediaKind, ServerMessage, TransportDirection};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One authenticated connection and its outbound push channel
#[derive(Debug)]
pub struct PeerSession {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    sender: mpsc::UnboundedSender<String>,
}

impl PeerSession {
    pub fn new(connection_id: Uuid, user_id: Uuid, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            connection_id,
            user_id,
            sender,
        }
    }

    /// Fire-and-forget; a closed channel only means the socket is going away
    pub fn send(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        if self.sender.send(json).is_err() {
            tracing::debug!(
                "Dropped message for closed connection {}",
                self.connection_id
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    pub id: String,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerHandle {
    pub id: String,
    pub kind: MediaKind,
    pub meeting_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub id: String,
    pub producer_id: String,
    pub meeting_id: Uuid,
}

/// Media objects a session currently owns, keyed by engine id
#[derive(Debug, Default)]
pub struct SessionMedia {
    pub transports: HashMap<String, TransportHandle>,
    pub producers: HashMap<String, ProducerHandle>,
    pub consumers: HashMap<String, ConsumerHandle>,
}

/// A consumer held by some session on a producer that is going away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedConsumer {
    pub connection_id: Uuid,
    pub consumer_id: String,
    pub producer_id: String,
}

/// Handles taken out of the registry, to be closed in the engine
#[derive(Debug, Default)]
pub struct DrainedMedia {
    pub consumers: Vec<ConsumerHandle>,
    pub producers: Vec<ProducerHandle>,
    pub transports: Vec<TransportHandle>,
    /// Consumers of other sessions on the drained producers
    pub orphans: Vec<OrphanedConsumer>,
}

impl DrainedMedia {
    pub fn extend(&mut self, other: DrainedMedia) {
        self.consumers.extend(other.consumers);
        self.producers.extend(other.producers);
        self.transports.extend(other.transports);
        self.orphans.extend(other.orphans);
    }
}
