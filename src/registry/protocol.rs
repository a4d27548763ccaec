//! Registry wire protocol

use serde::{Deserialize, Serialize};

use super::MembershipEntry;

/// A registry message together with the sender's logical clock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped<T> {
    /// Sender's Lamport clock
    pub clock: u64,
    /// Message body
    pub body: T,
}

impl<T> Stamped<T> {
    /// Wrap a body with a clock value
    pub fn new(clock: u64, body: T) -> Self {
        Self { clock, body }
    }
}

/// Requests a node sends to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryRequest {
    /// Obtain (or confirm) a rank
    Register { node_id: String, address: String },
    /// Keep the entry active
    Heartbeat { node_id: String },
    /// Leave the membership; the rank is retired
    Deregister { node_id: String },
    /// Active members, highest rank first
    ListActive,
    /// All members including inactive ones
    ListAll,
}

/// Registry answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryResponse {
    /// Rank for a Register request
    Registered { rank: u64 },
    /// `known == false` means the caller must register again
    HeartbeatAck { known: bool },
    /// `known == false` means there was nothing to remove
    Deregistered { known: bool },
    /// Membership listing
    Members { entries: Vec<MembershipEntry> },
    /// Request rejected
    Error { message: String },
}

impl RegistryResponse {
    /// Get the response type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            RegistryResponse::Registered { .. } => "Registered",
            RegistryResponse::HeartbeatAck { .. } => "HeartbeatAck",
            RegistryResponse::Deregistered { .. } => "Deregistered",
            RegistryResponse::Members { .. } => "Members",
            RegistryResponse::Error { .. } => "Error",
        }
    }
}
