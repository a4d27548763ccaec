//! Network Server
//!
//! TCP listener that either forwards envelopes to a node's inbound channel or
//! answers request frames through a handler (the registry).

use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{is_disconnect, read_frame, write_frame};
use crate::replication::Envelope;
use crate::error::Result;

/// Bound TCP listener
pub struct NetworkServer {
    /// Listening socket
    listener: TcpListener,
    /// Resolved local address
    local_addr: SocketAddr,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Bind the listener
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);

        tracing::info!("Network server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            shutdown,
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Forward every received envelope as `(peer_addr, envelope)`
    pub async fn serve_forwarding(&self, incoming_tx: mpsc::Sender<(String, Envelope)>) -> Result<()> {
        self.accept_loop(move |socket, peer_addr| {
            let incoming_tx = incoming_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = forward_connection(socket, &peer_addr, incoming_tx).await {
                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                }
            });
        })
        .await
    }

    /// Answer every request frame with the handler's response frame
    pub async fn serve_requests<Req, Resp, H>(&self, handler: Arc<H>) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        H: Fn(Req) -> Resp + Send + Sync + 'static,
    {
        self.accept_loop(move |socket, peer_addr| {
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = answer_connection(socket, &peer_addr, handler).await {
                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                }
            });
        })
        .await
    }

    async fn accept_loop<F>(&self, on_connection: F) -> Result<()>
    where
        F: Fn(TcpStream, String),
    {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let _ = socket.set_nodelay(true);
                            on_connection(socket, addr.to_string());
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server on {} stopped", self.local_addr);
        Ok(())
    }
}

async fn forward_connection(
    socket: TcpStream,
    peer_addr: &str,
    incoming_tx: mpsc::Sender<(String, Envelope)>,
) -> Result<()> {
    let (mut reader, _writer) = socket.into_split();

    loop {
        match read_frame::<Envelope, _>(&mut reader).await {
            Ok(envelope) => {
                tracing::trace!(
                    "Received {} from {} via {}",
                    envelope.message.type_name(),
                    envelope.from.node_id,
                    peer_addr
                );
                if incoming_tx.send((peer_addr.to_string(), envelope)).await.is_err() {
                    break;
                }
            }
            Err(ref e) if is_disconnect(e) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

async fn answer_connection<Req, Resp, H>(socket: TcpStream, peer_addr: &str, handler: Arc<H>) -> Result<()>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    H: Fn(Req) -> Resp,
{
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_frame::<Req, _>(&mut reader).await {
            Ok(request) => {
                let response = handler(request);
                write_frame(&mut writer, &response).await?;
            }
            Err(ref e) if is_disconnect(e) => {
                tracing::trace!("{} disconnected", peer_addr);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = NetworkServer::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_request_response() {
        let server = Arc::new(NetworkServer::bind("127.0.0.1:0").await.unwrap());
        let address = server.local_addr().to_string();

        let serving = server.clone();
        tokio::spawn(async move {
            let handler = Arc::new(|n: u64| n * 2);
            serving.serve_requests(handler).await
        });

        let client = NetworkClient::new(Duration::from_secs(1), Duration::from_secs(2));
        let doubled: u64 = client.request(&address, &21u64).await.unwrap();
        assert_eq!(doubled, 42);

        server.stop();
    }
}
