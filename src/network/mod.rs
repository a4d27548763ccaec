//! Network Module
//!
//! Framed TCP communication between nodes and with the registry, plus the
//! [`Transport`] seam the node uses to deliver coordination traffic.

mod server;
mod client;
mod memory;

pub use server::NetworkServer;
pub use client::NetworkClient;
pub use memory::MemoryNetwork;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::replication::{Envelope, FrameHeader, Message, MAX_FRAME_LEN};
use crate::error::{Error, Result};

/// Pending envelopes per destination before new ones are dropped
const LANE_CAPACITY: usize = 256;
/// Delivery attempts for one `Replicate`
const REPLICATE_ATTEMPTS: u32 = 4;
/// Base delay between attempts, multiplied by the attempt number
const RETRY_BACKOFF: Duration = Duration::from_millis(250);
/// A destination lane with no traffic for this long shuts down
const LANE_IDLE: Duration = Duration::from_secs(60);

/// Delivers envelopes to a peer address
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope, failing with [`Error::Unreachable`] or a
    /// connection error when the peer cannot take it
    async fn deliver(&self, address: &str, envelope: Envelope) -> Result<()>;
}

/// Read a framed value from a reader
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_LEN {
        return Err(Error::Network(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Frame checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed value to a writer
pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let body = bincode::serialize(value)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Whether an error only means the other side closed the connection
pub(crate) fn is_disconnect(error: &Error) -> bool {
    matches!(error, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

/// Drain the node's outgoing queue
///
/// Each destination gets its own worker so a slow or dead peer only delays
/// its own traffic. Envelopes to one peer keep their queue order. A
/// `Replicate` that cannot be delivered after its retries, or that finds its
/// lane full, is reported on `undelivered` with the destination address.
pub fn spawn_delivery(
    transport: Arc<dyn Transport>,
    mut outgoing_rx: mpsc::Receiver<(String, Envelope)>,
    undelivered: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lanes: HashMap<String, mpsc::Sender<Envelope>> = HashMap::new();

        while let Some((address, mut envelope)) = outgoing_rx.recv().await {
            // A lane that closed while idle is replaced once
            for _ in 0..2 {
                let lane = lanes.entry(address.clone()).or_insert_with(|| {
                    spawn_lane(transport.clone(), address.clone(), undelivered.clone())
                });

                match lane.try_send(envelope) {
                    Ok(()) => break,
                    Err(TrySendError::Full(dropped)) => {
                        tracing::warn!(
                            "Delivery queue to {} is full, dropping {}",
                            address,
                            dropped.message.type_name()
                        );
                        if matches!(dropped.message, Message::Replicate { .. }) {
                            let _ = undelivered.try_send(address.clone());
                        }
                        break;
                    }
                    Err(TrySendError::Closed(returned)) => {
                        lanes.remove(&address);
                        envelope = returned;
                    }
                }
            }
        }

        tracing::debug!("Delivery loop stopped");
    })
}

fn spawn_lane(
    transport: Arc<dyn Transport>,
    address: String,
    undelivered: mpsc::Sender<String>,
) -> mpsc::Sender<Envelope> {
    let (tx, mut rx) = mpsc::channel::<Envelope>(LANE_CAPACITY);

    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
                Ok(Some(envelope)) => {
                    deliver_one(transport.as_ref(), &address, envelope, &undelivered).await
                }
                Ok(None) => break,
                Err(_) => {
                    rx.close();
                    while let Ok(envelope) = rx.try_recv() {
                        deliver_one(transport.as_ref(), &address, envelope, &undelivered).await;
                    }
                    tracing::trace!("Delivery lane to {} idle, closing", address);
                    break;
                }
            }
        }
    });

    tx
}

async fn deliver_one(
    transport: &dyn Transport,
    address: &str,
    envelope: Envelope,
    undelivered: &mpsc::Sender<String>,
) {
    let kind = envelope.message.type_name();
    let replicate = matches!(envelope.message, Message::Replicate { .. });
    let attempts = if replicate { REPLICATE_ATTEMPTS } else { 1 };

    for attempt in 1..=attempts {
        match transport.deliver(address, envelope.clone()).await {
            Ok(()) => {
                tracing::trace!("Delivered {} to {}", kind, address);
                return;
            }
            Err(e) if attempt < attempts => {
                tracing::debug!("Delivery of {} to {} failed ({}), retrying", kind, address, e);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => tracing::debug!("Failed to deliver {} to {}: {}", kind, address, e),
        }
    }

    if replicate {
        tracing::warn!("Giving up on {} to {} after {} attempts", kind, address, attempts);
        let _ = undelivered.try_send(address.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeIdentity;
    use crate::replication::{Mutation, OperationRecord};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` deliveries, then forwards
    struct Flaky {
        inner: MemoryNetwork,
        failures: AtomicU32,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn deliver(&self, address: &str, envelope: Envelope) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::Unreachable(address.to_string()));
            }
            self.inner.deliver(address, envelope).await
        }
    }

    fn replicate(clock: u64) -> Envelope {
        let record = OperationRecord::new(
            "servidor_1",
            clock,
            Mutation::CreateUser { name: format!("u{}", clock) },
            chrono::Utc::now(),
        );
        Envelope {
            from: NodeIdentity::new("servidor_1", 1, "s1:5561"),
            clock,
            message: Message::Replicate { record },
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let envelope = Envelope {
            from: NodeIdentity::new("servidor_1", 1, "s1:5561"),
            clock: 4,
            message: Message::TimeRequest { round: 2 },
        };

        write_frame(&mut a, &envelope).await.unwrap();
        let received: Envelope = read_frame(&mut b).await.unwrap();

        assert_eq!(received.clock, 4);
        assert!(matches!(received.message, Message::TimeRequest { round: 2 }));
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = bincode::serialize(&Message::Ping).unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        let result: Result<Message> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let err = read_frame::<Message, _>(&mut b).await.unwrap_err();
        assert!(is_disconnect(&err));
    }

    #[tokio::test]
    async fn test_delivery_preserves_order_per_peer() {
        let network = MemoryNetwork::new();
        let mut inbound = network.attach("s2:5561").await;

        let (tx, rx) = mpsc::channel(16);
        let (undelivered_tx, _undelivered) = mpsc::channel(4);
        let _delivery = spawn_delivery(Arc::new(network.clone()), rx, undelivered_tx);

        let from = NodeIdentity::new("servidor_1", 1, "s1:5561");
        for clock in 1..=5 {
            let envelope = Envelope { from: from.clone(), clock, message: Message::Ping };
            tx.send(("s2:5561".to_string(), envelope)).await.unwrap();
        }

        for expected in 1..=5 {
            let (_, envelope) = inbound.recv().await.unwrap();
            assert_eq!(envelope.clock, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_retried_after_transient_failure() {
        let network = MemoryNetwork::new();
        let mut inbound = network.attach("s2:5561").await;
        let flaky = Flaky { inner: network.clone(), failures: AtomicU32::new(2) };

        let (tx, rx) = mpsc::channel(16);
        let (undelivered_tx, mut undelivered) = mpsc::channel(4);
        let _delivery = spawn_delivery(Arc::new(flaky), rx, undelivered_tx);

        tx.send(("s2:5561".to_string(), replicate(7))).await.unwrap();

        let (_, envelope) = inbound.recv().await.unwrap();
        assert_eq!(envelope.clock, 7);
        assert!(undelivered.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_replicate_reported() {
        let network = MemoryNetwork::new();

        let (tx, rx) = mpsc::channel(16);
        let (undelivered_tx, mut undelivered) = mpsc::channel(4);
        let _delivery = spawn_delivery(Arc::new(network.clone()), rx, undelivered_tx);

        // Pings are not retried or reported
        let ping = Envelope {
            from: NodeIdentity::new("servidor_1", 1, "s1:5561"),
            clock: 1,
            message: Message::Ping,
        };
        tx.send(("s9:5561".to_string(), ping)).await.unwrap();
        tx.send(("s9:5561".to_string(), replicate(8))).await.unwrap();

        assert_eq!(undelivered.recv().await.unwrap(), "s9:5561");
        assert!(undelivered.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_lane_replaced() {
        let network = MemoryNetwork::new();
        let mut inbound = network.attach("s2:5561").await;

        let (tx, rx) = mpsc::channel(16);
        let (undelivered_tx, _undelivered) = mpsc::channel(4);
        let _delivery = spawn_delivery(Arc::new(network.clone()), rx, undelivered_tx);

        tx.send(("s2:5561".to_string(), replicate(1))).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().1.clock, 1);

        tokio::time::sleep(LANE_IDLE * 2).await;

        tx.send(("s2:5561".to_string(), replicate(2))).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().1.clock, 2);
    }
}
