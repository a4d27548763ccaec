//! Registry clients
//!
//! [`Registry`] is what a node talks to: [`RemoteRegistry`] reaches a
//! [`RegistryServer`](super::RegistryServer) over TCP, [`LocalRegistry`]
//! shares an in-process [`RegistryService`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::time::{Duration, Instant};

use super::protocol::{RegistryRequest, RegistryResponse, Stamped};
use super::{MembershipEntry, RegistryService};
use crate::network::NetworkClient;
use crate::error::{Error, Result};

/// Access to the membership registry
#[async_trait]
pub trait Registry: Send + Sync {
    /// Send one request and return the stamped response
    async fn call(&self, request: Stamped<RegistryRequest>) -> Result<Stamped<RegistryResponse>>;

    /// Register and return the assigned rank
    async fn register(&self, node_id: &str, address: &str, clock: u64) -> Result<Stamped<u64>> {
        let request = RegistryRequest::Register {
            node_id: node_id.to_string(),
            address: address.to_string(),
        };
        let response = self.call(Stamped::new(clock, request)).await?;
        match response.body {
            RegistryResponse::Registered { rank } => Ok(Stamped::new(response.clock, rank)),
            other => Err(unexpected(other)),
        }
    }

    /// Send a heartbeat; `false` means the registry does not know the node
    async fn heartbeat(&self, node_id: &str, clock: u64) -> Result<Stamped<bool>> {
        let request = RegistryRequest::Heartbeat {
            node_id: node_id.to_string(),
        };
        let response = self.call(Stamped::new(clock, request)).await?;
        match response.body {
            RegistryResponse::HeartbeatAck { known } => Ok(Stamped::new(response.clock, known)),
            other => Err(unexpected(other)),
        }
    }

    /// Leave the membership; `false` means the registry did not know the node
    async fn deregister(&self, node_id: &str, clock: u64) -> Result<Stamped<bool>> {
        let request = RegistryRequest::Deregister {
            node_id: node_id.to_string(),
        };
        let response = self.call(Stamped::new(clock, request)).await?;
        match response.body {
            RegistryResponse::Deregistered { known } => Ok(Stamped::new(response.clock, known)),
            other => Err(unexpected(other)),
        }
    }

    /// Active members, highest rank first
    async fn list_active(&self, clock: u64) -> Result<Stamped<Vec<MembershipEntry>>> {
        let response = self.call(Stamped::new(clock, RegistryRequest::ListActive)).await?;
        match response.body {
            RegistryResponse::Members { entries } => Ok(Stamped::new(response.clock, entries)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: RegistryResponse) -> Error {
    match response {
        RegistryResponse::Error { message } => Error::Registry(message),
        other => Error::Registry(format!("Unexpected response: {}", other.type_name())),
    }
}

/// Registry reached over TCP
pub struct RemoteRegistry {
    address: String,
    client: NetworkClient,
}

impl RemoteRegistry {
    /// Create a client for the registry at `address`
    pub fn new(address: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            client: NetworkClient::new(request_timeout, request_timeout),
        }
    }
}

#[async_trait]
impl Registry for RemoteRegistry {
    async fn call(&self, request: Stamped<RegistryRequest>) -> Result<Stamped<RegistryResponse>> {
        self.client.request(&self.address, &request).await
    }
}

/// Registry living in the same process
#[derive(Clone)]
pub struct LocalRegistry {
    service: Arc<Mutex<RegistryService>>,
}

impl LocalRegistry {
    /// Create a registry with its own empty table
    pub fn new(liveness_window: Duration) -> Self {
        Self::with_service(Arc::new(Mutex::new(RegistryService::new(liveness_window))))
    }

    /// Share an existing service
    pub fn with_service(service: Arc<Mutex<RegistryService>>) -> Self {
        Self { service }
    }

    /// Run a liveness sweep now
    pub fn sweep(&self) -> Vec<String> {
        self.service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sweep(Instant::now())
    }

    /// Current entry for a node
    pub fn entry(&self, node_id: &str) -> Option<MembershipEntry> {
        self.service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registry()
            .get(node_id)
            .cloned()
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn call(&self, request: Stamped<RegistryRequest>) -> Result<Stamped<RegistryResponse>> {
        let response = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle(request, Instant::now());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryServer;

    #[tokio::test]
    async fn test_local_registry_roundtrip() {
        let registry = LocalRegistry::new(Duration::from_secs(30));

        let first = registry.register("servidor_1", "s1:5561", 0).await.unwrap();
        let second = registry.register("servidor_2", "s2:5561", 0).await.unwrap();
        assert_eq!(first.body, 1);
        assert_eq!(second.body, 2);
        assert!(second.clock > first.clock);

        assert!(registry.heartbeat("servidor_1", 0).await.unwrap().body);
        assert!(!registry.heartbeat("ghost", 0).await.unwrap().body);

        let members = registry.list_active(0).await.unwrap().body;
        assert_eq!(members[0].node_id, "servidor_2");
    }

    #[tokio::test]
    async fn test_register_rejects_empty_id() {
        let registry = LocalRegistry::new(Duration::from_secs(30));
        let result = registry.register("", "s1:5561", 0).await;
        assert!(matches!(result, Err(Error::Registry(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_registry_expiry() {
        let registry = LocalRegistry::new(Duration::from_secs(30));
        registry.register("servidor_1", "s1:5561", 0).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.sweep(), vec!["servidor_1".to_string()]);
        assert!(!registry.entry("servidor_1").unwrap().active);
        assert!(registry.list_active(0).await.unwrap().body.is_empty());
    }

    #[tokio::test]
    async fn test_remote_registry_over_tcp() {
        let server = Arc::new(
            RegistryServer::bind("127.0.0.1:0", Duration::from_secs(30), Duration::from_secs(10))
                .await
                .unwrap(),
        );
        let address = server.local_addr().to_string();

        let serving = server.clone();
        tokio::spawn(async move { serving.run().await });

        let registry = RemoteRegistry::new(address, Duration::from_secs(2));
        let registered = registry.register("servidor_1", "127.0.0.1:5561", 7).await.unwrap();
        assert_eq!(registered.body, 1);
        // Registry merged our clock (7) before answering
        assert!(registered.clock >= 9);

        let members = registry.list_active(registered.clock).await.unwrap().body;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].address, "127.0.0.1:5561");

        server.stop();
    }
}
