//! Network Client
//!
//! TCP client for request/response calls and pooled fire-and-forget
//! delivery to peer nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{read_frame, write_frame, Transport};
use crate::replication::Envelope;
use crate::error::{Error, Result};

/// Network client for connecting to peers and the registry
#[derive(Clone)]
pub struct NetworkClient {
    /// Delivery connections: address -> write half
    pool: Arc<RwLock<HashMap<String, Arc<Mutex<OwnedWriteHalf>>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a request on a fresh connection and wait for the response
    pub async fn request<Req, Resp>(&self, address: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let result = timeout(self.request_timeout, async {
            let stream = self.connect(address).await?;
            let (mut reader, mut writer) = stream.into_split();
            write_frame(&mut writer, request).await?;
            read_frame::<Resp, _>(&mut reader).await
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Send without waiting for a response, reusing a pooled connection
    pub async fn send_async<T>(&self, address: &str, message: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        if let Some(entry) = self.get_connection(address).await {
            let mut writer = entry.lock().await;
            if write_frame(&mut *writer, message).await.is_ok() {
                return Ok(());
            }
            drop(writer);
            tracing::debug!("Pooled connection to {} is dead, reconnecting", address);
            self.remove_connection(address).await;
        }

        let stream = self.connect(address).await?;
        let (_reader, mut writer) = stream.into_split();
        write_frame(&mut writer, message).await?;
        self.store_connection(address.to_string(), writer).await;
        Ok(())
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<OwnedWriteHalf>>> {
        self.pool.read().await.get(address).cloned()
    }

    async fn store_connection(&self, address: String, writer: OwnedWriteHalf) {
        self.pool.write().await.insert(address, Arc::new(Mutex::new(writer)));
    }

    async fn remove_connection(&self, address: &str) {
        self.pool.write().await.remove(address);
    }

    /// Get pooled connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

#[async_trait]
impl Transport for NetworkClient {
    async fn deliver(&self, address: &str, envelope: Envelope) -> Result<()> {
        self.send_async(address, &envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkServer;
    use crate::registry::NodeIdentity;
    use crate::replication::Message;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_connection_failure() {
        let client = NetworkClient::new(Duration::from_millis(100), Duration::from_millis(500));

        // Nothing listens on port 1
        let result: Result<u64> = client.request("127.0.0.1:1", &1u64).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_deliver_reuses_connection() {
        let server = Arc::new(NetworkServer::bind("127.0.0.1:0").await.unwrap());
        let address = server.local_addr().to_string();
        let (tx, mut rx) = mpsc::channel(8);

        let serving = server.clone();
        tokio::spawn(async move { serving.serve_forwarding(tx).await });

        let client = NetworkClient::new(Duration::from_secs(1), Duration::from_secs(1));
        let from = NodeIdentity::new("servidor_1", 1, "127.0.0.1:1");
        for clock in [1, 2] {
            let envelope = Envelope { from: from.clone(), clock, message: Message::Ping };
            client.deliver(&address, envelope).await.unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().1.clock, 1);
        assert_eq!(rx.recv().await.unwrap().1.clock, 2);
        assert_eq!(client.connection_count().await, 1);

        server.stop();
    }
}
