//! Replication Module
//!
//! Eager total replication: every accepted write becomes an
//! [`OperationRecord`] that is applied locally and broadcast to all other
//! nodes, which apply it exactly once.

pub mod protocol;
mod record;
mod engine;

pub use protocol::{Envelope, FrameHeader, Message, Outbox, Target, COORDINATION_TOPIC, MAX_FRAME_LEN};
pub use record::{Mutation, OpId, OperationRecord};
pub use engine::{ApplyOutcome, ReplicationEngine, Snapshot};
