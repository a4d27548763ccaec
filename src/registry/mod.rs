//! Membership Registry
//!
//! Assigns each node a unique, never-reused rank on registration and tracks
//! liveness through heartbeats. Runs as its own process
//! ([`RegistryServer`]); nodes reach it through the [`Registry`] trait.

mod membership;
pub mod protocol;
mod server;
mod client;

pub use membership::{MembershipRegistry, RegistryService};
pub use protocol::{RegistryRequest, RegistryResponse, Stamped};
pub use server::RegistryServer;
pub use client::{Registry, RemoteRegistry, LocalRegistry};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// Who a node is, as the rest of the cluster sees it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique node identifier
    pub node_id: String,
    /// Election priority assigned by the registry (higher wins)
    pub rank: u64,
    /// Address for coordination traffic (host:port)
    pub address: String,
}

impl NodeIdentity {
    /// Create a new identity
    pub fn new(node_id: impl Into<String>, rank: u64, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            rank,
            address: address.into(),
        }
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (rank {})", self.node_id, self.rank)
    }
}

/// Registry record for a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipEntry {
    /// Unique node identifier
    pub node_id: String,
    /// Assigned rank
    pub rank: u64,
    /// Node address (host:port)
    pub address: String,
    /// Wall-clock time of the last heartbeat
    pub last_heartbeat_at: chrono::DateTime<chrono::Utc>,
    /// Heartbeat received within the liveness window
    pub active: bool,
    /// Monotonic time of the last heartbeat (not serialized)
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl MembershipEntry {
    /// Create a fresh, active entry
    pub fn new(node_id: String, rank: u64, address: String, now: Instant) -> Self {
        Self {
            node_id,
            rank,
            address,
            last_heartbeat_at: chrono::Utc::now(),
            active: true,
            last_seen: Some(now),
        }
    }

    /// Identity view of this entry
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.node_id.clone(), self.rank, self.address.clone())
    }

    /// Check whether a heartbeat arrived within `window`
    pub fn is_live(&self, now: Instant, window: Duration) -> bool {
        match self.last_seen {
            Some(last) => now.saturating_duration_since(last) <= window,
            None => false,
        }
    }

    /// Record a heartbeat
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = Some(now);
        self.last_heartbeat_at = chrono::Utc::now();
        self.active = true;
    }
}
