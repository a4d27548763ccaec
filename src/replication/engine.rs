//! Replication Engine
//!
//! Applies local and remote operations exactly once and produces or merges
//! the snapshots used to bootstrap new nodes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{Mutation, OpId, OperationRecord};
use crate::clock::LamportClock;
use crate::state::ReplicatedDataset;
use crate::error::Result;

/// Full replicated state of a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The four collections
    pub dataset: ReplicatedDataset,
    /// Every operation id reflected in `dataset`
    pub seen: BTreeSet<OpId>,
    /// Highest logical clock the node had reached
    pub max_clock: u64,
}

/// Result of applying a remote record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First delivery, state changed
    Applied,
    /// Already seen, nothing changed
    Duplicate,
}

/// Per-node replication state
#[derive(Debug)]
pub struct ReplicationEngine {
    node_id: String,
    dataset: ReplicatedDataset,
    seen: BTreeSet<OpId>,
}

impl ReplicationEngine {
    /// Create an engine with empty state
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            dataset: ReplicatedDataset::default(),
            seen: BTreeSet::new(),
        }
    }

    /// Validate, stamp and apply a client mutation
    ///
    /// The returned record is what the caller broadcasts. A rejected
    /// mutation leaves the clock untouched.
    pub fn propose_local(
        &mut self,
        clock: &mut LamportClock,
        mutation: Mutation,
        applied_at: DateTime<Utc>,
    ) -> Result<OperationRecord> {
        self.dataset.validate(&mutation)?;

        let record = OperationRecord::new(&self.node_id, clock.tick(), mutation, applied_at);
        self.dataset.apply(&record);
        self.seen.insert(record.op_id.clone());

        tracing::debug!("Applied local {} as {}", record.mutation.kind(), record.op_id);
        Ok(record)
    }

    /// Apply a record received from another node
    pub fn apply_remote(&mut self, clock: &mut LamportClock, record: &OperationRecord) -> ApplyOutcome {
        if self.seen.contains(&record.op_id) {
            tracing::trace!("Ignoring duplicate {}", record.op_id);
            return ApplyOutcome::Duplicate;
        }

        clock.merge(record.logical_clock);
        self.dataset.apply(record);
        self.seen.insert(record.op_id.clone());

        tracing::debug!("Applied remote {} from {}", record.mutation.kind(), record.op_id);
        ApplyOutcome::Applied
    }

    /// Capture the current state
    pub fn snapshot(&self, clock: &LamportClock) -> Snapshot {
        Snapshot {
            dataset: self.dataset.clone(),
            seen: self.seen.clone(),
            max_clock: clock.value(),
        }
    }

    /// Union a snapshot into the local state; returns how many operations
    /// were new
    pub fn merge_snapshot(&mut self, clock: &mut LamportClock, snapshot: Snapshot) -> usize {
        let before = self.seen.len();

        self.dataset.merge(&snapshot.dataset);
        self.seen.extend(snapshot.seen);
        clock.merge(snapshot.max_clock);

        self.seen.len() - before
    }

    /// Whether an operation was already applied
    pub fn has_seen(&self, op_id: &OpId) -> bool {
        self.seen.contains(op_id)
    }

    /// Number of applied operations
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// The replicated collections
    pub fn dataset(&self) -> &ReplicatedDataset {
        &self.dataset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn create_user(name: &str) -> Mutation {
        Mutation::CreateUser { name: name.to_string() }
    }

    #[test]
    fn test_local_then_remote_apply() {
        let mut clock_a = LamportClock::new();
        let mut a = ReplicationEngine::new("A");
        let record = a.propose_local(&mut clock_a, create_user("alice"), Utc::now()).unwrap();
        assert_eq!(record.op_id.to_string(), "A:1");

        let mut clock_b = LamportClock::new();
        let mut b = ReplicationEngine::new("B");
        assert_eq!(b.apply_remote(&mut clock_b, &record), ApplyOutcome::Applied);
        assert_eq!(clock_b.value(), 2);

        // Redelivery is a no-op, clock included
        assert_eq!(b.apply_remote(&mut clock_b, &record), ApplyOutcome::Duplicate);
        assert_eq!(clock_b.value(), 2);
        assert_eq!(a.dataset(), b.dataset());
    }

    #[test]
    fn test_rejected_mutation_does_not_tick() {
        let mut clock = LamportClock::new();
        let mut engine = ReplicationEngine::new("A");
        engine.propose_local(&mut clock, create_user("alice"), Utc::now()).unwrap();

        let err = engine.propose_local(&mut clock, create_user("alice"), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(_)));
        assert_eq!(clock.value(), 1);
        assert_eq!(engine.seen_count(), 1);
    }

    #[test]
    fn test_interleavings_converge() {
        let mut clock_a = LamportClock::new();
        let mut clock_b = LamportClock::new();
        let mut a = ReplicationEngine::new("A");
        let mut b = ReplicationEngine::new("B");

        let r1 = a.propose_local(&mut clock_a, create_user("alice"), Utc::now()).unwrap();
        let r2 = b.propose_local(&mut clock_b, create_user("bob"), Utc::now()).unwrap();
        let r3 = a
            .propose_local(&mut clock_a, Mutation::CreateChannel { name: "general".into() }, Utc::now())
            .unwrap();

        let mut c = ReplicationEngine::new("C");
        let mut d = ReplicationEngine::new("D");
        let (mut clock_c, mut clock_d) = (LamportClock::new(), LamportClock::new());
        for r in [&r1, &r2, &r3] {
            c.apply_remote(&mut clock_c, r);
        }
        for r in [&r3, &r1, &r2, &r1] {
            d.apply_remote(&mut clock_d, r);
        }

        assert_eq!(c.dataset(), d.dataset());
        assert_eq!(c.seen_count(), 3);
    }

    #[test]
    fn test_concurrent_same_name_keeps_lowest_stamp() {
        let mut clock_a = LamportClock::new();
        let mut clock_b = LamportClock::new();
        let mut a = ReplicationEngine::new("A");
        let mut b = ReplicationEngine::new("B");

        let from_b = b.propose_local(&mut clock_b, create_user("carol"), Utc::now()).unwrap();
        clock_a.tick();
        let from_a = a.propose_local(&mut clock_a, create_user("carol"), Utc::now()).unwrap();
        assert_eq!(from_b.logical_clock, 1);
        assert_eq!(from_a.logical_clock, 2);

        a.apply_remote(&mut clock_a, &from_b);
        b.apply_remote(&mut clock_b, &from_a);

        assert_eq!(a.dataset(), b.dataset());
        assert_eq!(a.dataset().user("carol").unwrap().origin, "B");
    }

    #[test]
    fn test_snapshot_bootstrap() {
        let mut clock_a = LamportClock::new();
        let mut a = ReplicationEngine::new("A");
        let record = a.propose_local(&mut clock_a, create_user("alice"), Utc::now()).unwrap();
        a.propose_local(&mut clock_a, create_user("bob"), Utc::now()).unwrap();

        let mut clock_d = LamportClock::new();
        let mut d = ReplicationEngine::new("D");
        assert_eq!(d.merge_snapshot(&mut clock_d, a.snapshot(&clock_a)), 2);
        assert!(clock_d.value() > clock_a.value());
        assert!(d.has_seen(&record.op_id));

        // Replayed operation is ignored after bootstrap
        assert_eq!(d.apply_remote(&mut clock_d, &record), ApplyOutcome::Duplicate);
        assert_eq!(d.dataset(), a.dataset());

        // Merging the same snapshot again adds nothing
        assert_eq!(d.merge_snapshot(&mut clock_d, a.snapshot(&clock_a)), 0);
    }
}
