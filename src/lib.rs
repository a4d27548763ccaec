//! ChatMesh - Replicated Messaging Backend
//!
//! A cluster of independent server nodes that keep identical copies of the
//! messaging state (users, channels, private messages, channel publications)
//! without a central database.
//!
//! # Architecture
//!
//! Every node registers with a membership registry, which hands out a unique
//! rank. Ranks drive a Bully election that picks a coordinator; the
//! coordinator periodically aligns physical clocks using the Berkeley
//! algorithm. Every write is stamped with a Lamport clock, applied locally,
//! and eagerly broadcast to all other nodes, which apply it exactly once.
//!
//! # Features
//!
//! - Rank-based Bully election with ping-driven failure detection
//! - Berkeley physical clock averaging on a fixed operation cadence
//! - Lamport logical clocks on every message and record
//! - Idempotent eager replication with snapshot bootstrap for new nodes
//! - HTTP request/response API and a control CLI

pub mod config;
pub mod error;
pub mod clock;
pub mod registry;
pub mod state;
pub mod replication;
pub mod network;
pub mod node;
pub mod api;

pub use config::ChatMeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ChatMeshConfig;
    pub use crate::error::{Error, Result};
    pub use crate::clock::{LamportClock, PhysicalClock, ClockSynchronizer};
    pub use crate::registry::{MembershipEntry, MembershipRegistry, NodeIdentity, Registry};
    pub use crate::state::{ElectionManager, ElectionState, ReplicatedDataset};
    pub use crate::replication::{Envelope, Message, OperationRecord, ReplicationEngine};
    pub use crate::node::{Node, NodeHandle, ClientRequest, ClientResponse};
}
