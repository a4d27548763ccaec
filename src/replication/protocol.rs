//! Coordination Protocol
//!
//! Defines the wire messages exchanged on the shared `servers` topic.

use serde::{Deserialize, Serialize};

use super::engine::Snapshot;
use super::record::OperationRecord;
use crate::registry::NodeIdentity;

/// Conventional name of the shared coordination topic
pub const COORDINATION_TOPIC: &str = "servers";

/// Largest frame body accepted from the network
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Messages carried on the coordination topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Bully Election ==========
    /// Election started by a lower-ranked node
    Election { from_rank: u64 },

    /// A higher-ranked node is alive and takes over the election
    Ok { from_rank: u64 },

    /// Election winner announcement
    Coordinator { node_id: String, rank: u64 },

    // ========== Failure Detection ==========
    /// Coordinator liveness check
    Ping,

    /// Liveness answer
    Pong,

    // ========== Berkeley Synchronization ==========
    /// Coordinator asks for the member's physical time
    TimeRequest { round: u64 },

    /// Member's physical time in milliseconds since the epoch
    TimeReply { round: u64, time_ms: i64 },

    /// Correction the member adds to its physical clock
    ClockAdjust { round: u64, delta_ms: i64 },

    // ========== Replication ==========
    /// Eager broadcast of one operation
    Replicate { record: OperationRecord },

    /// Bootstrap: ask a peer for its full state
    SnapshotRequest,

    /// Bootstrap: full dataset plus seen operation ids
    SnapshotReply { snapshot: Snapshot },
}

impl Message {
    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Election { .. } => "Election",
            Message::Ok { .. } => "Ok",
            Message::Coordinator { .. } => "Coordinator",
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::TimeRequest { .. } => "TimeRequest",
            Message::TimeReply { .. } => "TimeReply",
            Message::ClockAdjust { .. } => "ClockAdjust",
            Message::Replicate { .. } => "Replicate",
            Message::SnapshotRequest => "SnapshotRequest",
            Message::SnapshotReply { .. } => "SnapshotReply",
        }
    }
}

/// A message stamped with its sender and the sender's logical clock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node
    pub from: NodeIdentity,
    /// Sender's logical clock after the send tick
    pub clock: u64,
    /// Payload
    pub message: Message,
}

impl Envelope {
    /// Serialize envelope to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize envelope from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Where an outgoing message should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single peer
    Peer(NodeIdentity),
    /// Every other node in the local membership view
    Broadcast,
}

/// Messages produced while handling one event, stamped and sent afterwards
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<(Target, Message)>,
}

impl Outbox {
    /// Create an empty outbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for one peer
    pub fn send(&mut self, peer: &NodeIdentity, message: Message) {
        self.items.push((Target::Peer(peer.clone()), message));
    }

    /// Queue a message for every other node
    pub fn broadcast(&mut self, message: Message) {
        self.items.push((Target::Broadcast, message));
    }

    /// Take all queued messages
    pub fn drain(&mut self) -> Vec<(Target, Message)> {
        std::mem::take(&mut self.items)
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inspect queued messages without taking them
    pub fn iter(&self) -> impl Iterator<Item = &(Target, Message)> {
        self.items.iter()
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope {
            from: NodeIdentity::new("servidor_3", 3, "s3:5561"),
            clock: 17,
            message: Message::Coordinator {
                node_id: "servidor_3".to_string(),
                rank: 3,
            },
        };

        let bytes = envelope.serialize().unwrap();
        let restored = Envelope::deserialize(&bytes).unwrap();

        assert_eq!(restored.from, envelope.from);
        assert_eq!(restored.clock, 17);
        match restored.message {
            Message::Coordinator { node_id, rank } => {
                assert_eq!(node_id, "servidor_3");
                assert_eq!(rank, 3);
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_outbox_drain() {
        let peer = NodeIdentity::new("servidor_2", 2, "s2:5561");
        let mut outbox = Outbox::new();
        outbox.send(&peer, Message::Ok { from_rank: 3 });
        outbox.broadcast(Message::Ping);
        assert_eq!(outbox.len(), 2);

        let items = outbox.drain();
        assert!(outbox.is_empty());
        assert_eq!(items[0].0, Target::Peer(peer));
        assert_eq!(items[1].0, Target::Broadcast);
    }
}
