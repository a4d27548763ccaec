//! In-memory transport
//!
//! Routes envelopes between nodes living in the same process. Detaching an
//! address makes it unreachable, which is how tests stop a node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::Transport;
use crate::replication::Envelope;
use crate::error::{Error, Result};

const INBOX_CAPACITY: usize = 1024;

type Inbox = mpsc::Sender<(String, Envelope)>;

/// Shared routing table of in-process nodes
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<RwLock<HashMap<String, Inbox>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an address and get its inbound channel
    pub async fn attach(&self, address: &str) -> mpsc::Receiver<(String, Envelope)> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.routes.write().await.insert(address.to_string(), tx);
        rx
    }

    /// Detach an address; later deliveries to it fail
    pub async fn detach(&self, address: &str) -> bool {
        self.routes.write().await.remove(address).is_some()
    }

    /// Check whether an address is attached
    pub async fn is_attached(&self, address: &str) -> bool {
        self.routes.read().await.contains_key(address)
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn deliver(&self, address: &str, envelope: Envelope) -> Result<()> {
        let inbox = self.routes.read().await.get(address).cloned();

        match inbox {
            Some(inbox) => inbox
                .send((envelope.from.address.clone(), envelope))
                .await
                .map_err(|_| Error::Unreachable(address.to_string())),
            None => Err(Error::Unreachable(address.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeIdentity;
    use crate::replication::Message;

    fn envelope() -> Envelope {
        Envelope {
            from: NodeIdentity::new("servidor_1", 1, "s1:5561"),
            clock: 1,
            message: Message::Ping,
        }
    }

    #[tokio::test]
    async fn test_deliver_to_attached() {
        let network = MemoryNetwork::new();
        let mut rx = network.attach("s2:5561").await;

        network.deliver("s2:5561", envelope()).await.unwrap();
        let (from_addr, received) = rx.recv().await.unwrap();
        assert_eq!(from_addr, "s1:5561");
        assert!(matches!(received.message, Message::Ping));
    }

    #[tokio::test]
    async fn test_detached_is_unreachable() {
        let network = MemoryNetwork::new();
        let _rx = network.attach("s2:5561").await;
        assert!(network.detach("s2:5561").await);
        assert!(!network.is_attached("s2:5561").await);

        let result = network.deliver("s2:5561", envelope()).await;
        assert!(matches!(result, Err(Error::Unreachable(_))));
    }
}
