//! Operation Records
//!
//! The immutable unit of replication: one client mutation stamped with its
//! origin and logical clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique operation id, `origin:clock`
///
/// Ordering is `(clock, origin)`, the display and audit order of records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    /// Origin's logical clock when the operation was applied
    pub clock: u64,
    /// Node that accepted the client request
    pub origin: String,
}

impl OpId {
    /// Create an operation id
    pub fn new(origin: impl Into<String>, clock: u64) -> Self {
        Self {
            clock,
            origin: origin.into(),
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.clock)
    }
}

/// State change carried by a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Add a user
    CreateUser { name: String },
    /// Add a channel
    CreateChannel { name: String },
    /// Private message from `src` to `dst`
    SendMessage { src: String, dst: String, message: String },
    /// Message published to a channel
    Publish { channel: String, user: String, message: String },
}

impl Mutation {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::CreateUser { .. } => "create_user",
            Mutation::CreateChannel { .. } => "create_channel",
            Mutation::SendMessage { .. } => "send_message",
            Mutation::Publish { .. } => "publish",
        }
    }
}

/// One replicated operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Unique id
    pub op_id: OpId,
    /// What changed
    pub mutation: Mutation,
    /// Same as `op_id.clock`
    pub logical_clock: u64,
    /// Origin's adjusted physical time
    pub applied_at: DateTime<Utc>,
}

impl OperationRecord {
    /// Build a record originated by `origin` at `clock`
    pub fn new(origin: &str, clock: u64, mutation: Mutation, applied_at: DateTime<Utc>) -> Self {
        Self {
            op_id: OpId::new(origin, clock),
            mutation,
            logical_clock: clock,
            applied_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_display() {
        assert_eq!(OpId::new("A", 1).to_string(), "A:1");
    }

    #[test]
    fn test_op_id_order() {
        let mut ids = vec![OpId::new("B", 2), OpId::new("C", 1), OpId::new("A", 2)];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        assert_eq!(rendered, vec!["C:1", "A:2", "B:2"]);
    }
}
