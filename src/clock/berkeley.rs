//! Berkeley Clock Synchronization
//!
//! Coordinator-side round bookkeeping. The coordinator samples every member's
//! physical time, averages the replies with its own reading and sends each
//! responder the correction that moves it onto the mean.

use std::collections::{BTreeMap, HashSet};
use tokio::time::{Duration, Instant};

use crate::registry::NodeIdentity;
use crate::replication::{Message, Outbox};

/// Synchronization cadence
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Client operations between rounds
    pub every_operations: u32,
    /// How long a round collects replies
    pub window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            every_operations: 10,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct SyncRound {
    id: u64,
    deadline: Instant,
    own_time_ms: i64,
    expected: HashSet<String>,
    replies: BTreeMap<String, (NodeIdentity, i64)>,
}

/// Clock synchronizer run by the coordinator
#[derive(Debug)]
pub struct ClockSynchronizer {
    config: SyncConfig,
    /// Operations since the last round
    operations: u32,
    /// Id of the next round
    next_round: u64,
    /// Round currently collecting replies
    round: Option<SyncRound>,
    rounds_started: u64,
    rounds_completed: u64,
}

impl ClockSynchronizer {
    /// Create a synchronizer
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            operations: 0,
            next_round: 1,
            round: None,
            rounds_started: 0,
            rounds_completed: 0,
        }
    }

    /// Count one processed client operation
    ///
    /// Returns true when a round is due, even if the previous round is still
    /// collecting replies. Nothing is counted while the node is not the
    /// coordinator.
    pub fn record_operation(&mut self, is_coordinator: bool) -> bool {
        if !is_coordinator {
            return false;
        }

        self.operations += 1;
        if self.operations < self.config.every_operations {
            return false;
        }
        self.operations = 0;
        true
    }

    /// Forget the cadence and any open round (coordinator changed)
    pub fn reset(&mut self) {
        if let Some(round) = self.round.take() {
            tracing::debug!("Abandoning clock sync round {}", round.id);
        }
        self.operations = 0;
    }

    /// Open a round and queue a `TimeRequest` for every other member
    pub fn start_round(
        &mut self,
        now: Instant,
        own_time_ms: i64,
        members: &[NodeIdentity],
        outbox: &mut Outbox,
    ) -> u64 {
        let id = self.next_round;
        self.next_round += 1;
        self.rounds_started += 1;

        for member in members {
            outbox.send(member, Message::TimeRequest { round: id });
        }

        tracing::debug!("Clock sync round {} started with {} member(s)", id, members.len());

        self.round = Some(SyncRound {
            id,
            deadline: now + self.config.window,
            own_time_ms,
            expected: members.iter().map(|m| m.node_id.clone()).collect(),
            replies: BTreeMap::new(),
        });
        id
    }

    /// Record a `TimeReply`; returns true once every member has answered
    pub fn on_reply(&mut self, round: u64, from: &NodeIdentity, time_ms: i64) -> bool {
        let Some(open) = self.round.as_mut() else {
            return false;
        };

        if open.id != round || !open.expected.contains(&from.node_id) {
            tracing::trace!("Ignoring time reply for round {} from {}", round, from);
            return false;
        }

        open.replies.insert(from.node_id.clone(), (from.clone(), time_ms));
        open.replies.len() == open.expected.len()
    }

    /// Whether the open round has every reply it waits for
    pub fn is_complete(&self) -> bool {
        self.round
            .as_ref()
            .map(|r| r.replies.len() == r.expected.len())
            .unwrap_or(false)
    }

    /// When the open round stops waiting
    pub fn deadline(&self) -> Option<Instant> {
        self.round.as_ref().map(|r| r.deadline)
    }

    /// Whether a round is open
    pub fn in_progress(&self) -> bool {
        self.round.is_some()
    }

    /// Close the round: queue a `ClockAdjust` per responder and return the
    /// coordinator's own correction
    pub fn finish(&mut self, outbox: &mut Outbox) -> Option<i64> {
        let round = self.round.take()?;
        self.rounds_completed += 1;

        let times: Vec<i64> = round.replies.values().map(|(_, t)| *t).collect();
        let (own_delta, deltas) = berkeley_deltas(round.own_time_ms, &times);

        for ((member, _), delta_ms) in round.replies.values().zip(deltas) {
            outbox.send(member, Message::ClockAdjust { round: round.id, delta_ms });
        }

        let missing = round.expected.len() - round.replies.len();
        if missing > 0 {
            tracing::debug!("Clock sync round {}: {} member(s) did not answer", round.id, missing);
        }
        tracing::info!(
            "Clock sync round {} averaged {} clock(s), local correction {} ms",
            round.id,
            round.replies.len() + 1,
            own_delta
        );

        Some(own_delta)
    }

    /// Rounds opened so far
    pub fn rounds_started(&self) -> u64 {
        self.rounds_started
    }

    /// Rounds closed so far
    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }
}

/// Plain mean of the coordinator's time and the replies
///
/// Returns the coordinator's correction and one correction per reply, each
/// `mean - time`.
pub fn berkeley_deltas(own_time_ms: i64, replies: &[i64]) -> (i64, Vec<i64>) {
    let count = replies.len() as i128 + 1;
    let sum: i128 = replies.iter().map(|t| *t as i128).sum::<i128>() + own_time_ms as i128;
    let mean = sum / count;

    let delta = |t: i64| (mean - t as i128) as i64;
    (delta(own_time_ms), replies.iter().map(|t| delta(*t)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Target;

    fn members() -> Vec<NodeIdentity> {
        vec![
            NodeIdentity::new("servidor_1", 1, "s1:5561"),
            NodeIdentity::new("servidor_2", 2, "s2:5561"),
        ]
    }

    #[test]
    fn test_deltas_move_everyone_to_mean() {
        let (own, deltas) = berkeley_deltas(1_000, &[1_300, 700, 1_400]);
        // mean = 1100
        assert_eq!(own, 100);
        assert_eq!(deltas, vec![-200, 400, -300]);
    }

    #[test]
    fn test_deltas_alone() {
        assert_eq!(berkeley_deltas(5_000, &[]), (0, vec![]));
    }

    #[test]
    fn test_cadence() {
        let mut sync = ClockSynchronizer::new(SyncConfig::default());

        for _ in 0..9 {
            assert!(!sync.record_operation(true));
        }
        assert!(sync.record_operation(true));

        // Counter restarted
        for _ in 0..9 {
            assert!(!sync.record_operation(true));
        }
        assert!(sync.record_operation(true));
    }

    #[test]
    fn test_no_counting_when_not_coordinator() {
        let mut sync = ClockSynchronizer::new(SyncConfig::default());
        for _ in 0..25 {
            assert!(!sync.record_operation(false));
        }
        for _ in 0..9 {
            assert!(!sync.record_operation(true));
        }
        assert!(sync.record_operation(true));
    }

    #[test]
    fn test_reset_restarts_cadence() {
        let mut sync = ClockSynchronizer::new(SyncConfig::default());
        for _ in 0..7 {
            sync.record_operation(true);
        }
        sync.reset();
        for _ in 0..9 {
            assert!(!sync.record_operation(true));
        }
        assert!(sync.record_operation(true));
    }

    #[test]
    fn test_due_while_round_open() {
        let mut sync = ClockSynchronizer::new(SyncConfig::default());
        let mut outbox = Outbox::new();
        sync.start_round(Instant::now(), 0, &members(), &mut outbox);

        for _ in 0..9 {
            assert!(!sync.record_operation(true));
        }
        assert!(sync.in_progress());
        assert!(sync.record_operation(true));
    }

    #[test]
    fn test_round_with_partial_replies() {
        let now = Instant::now();
        let mut sync = ClockSynchronizer::new(SyncConfig::default());
        let mut outbox = Outbox::new();
        let members = members();

        let round = sync.start_round(now, 10_000, &members, &mut outbox);
        assert_eq!(outbox.drain().len(), 2);
        assert_eq!(sync.deadline(), Some(now + Duration::from_secs(1)));

        // Stale round id and strangers are ignored
        assert!(!sync.on_reply(round + 1, &members[0], 1));
        assert!(!sync.on_reply(round, &NodeIdentity::new("x", 9, "x:1"), 1));

        assert!(!sync.on_reply(round, &members[0], 10_400));
        let own = sync.finish(&mut outbox).unwrap();
        assert_eq!(own, 200);

        let adjusts = outbox.drain();
        assert_eq!(adjusts.len(), 1);
        match &adjusts[0] {
            (Target::Peer(peer), Message::ClockAdjust { delta_ms, .. }) => {
                assert_eq!(peer.node_id, "servidor_1");
                assert_eq!(*delta_ms, -200);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!sync.in_progress());
        assert_eq!(sync.rounds_completed(), 1);
    }

    #[test]
    fn test_round_completes_early() {
        let mut sync = ClockSynchronizer::new(SyncConfig::default());
        let mut outbox = Outbox::new();
        let members = members();

        let round = sync.start_round(Instant::now(), 0, &members, &mut outbox);
        assert!(!sync.on_reply(round, &members[0], 30));
        assert!(sync.on_reply(round, &members[1], 60));
        assert!(sync.is_complete());
    }
}
