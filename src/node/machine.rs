//! Node Core
//!
//! Everything one node knows and decides: clocks, election, clock
//! synchronization, replication and its view of the cluster. The dispatch
//! loop owns a single `NodeCore`; every handler runs to completion before
//! the next event is looked at, and side effects are collected for the
//! loop to flush afterwards.

use std::collections::VecDeque;

use serde_json::{json, Value};
use tokio::time::{Duration, Instant};

use super::service::{ClientRequest, ClientResponse, Delivery, NodeStatus, ServiceCall};
use super::{MembershipEvent, NodeSettings};
use crate::clock::{ClockSynchronizer, LamportClock, PhysicalClock};
use crate::registry::NodeIdentity;
use crate::replication::{
    ApplyOutcome, Envelope, Message, Mutation, OperationRecord, Outbox, ReplicationEngine, Snapshot,
    Target,
};
use crate::state::{ElectionManager, ElectionState, PeerView, PersistedState, ReplicatedDataset, SnapshotFile};
use crate::error::{Error, Result};

/// Bootstrap sync progress
#[derive(Debug)]
enum Bootstrap {
    /// Waiting for a snapshot from `current`
    Syncing {
        current: NodeIdentity,
        remaining: VecDeque<NodeIdentity>,
        deadline: Instant,
    },
    /// Caught up; serving clients
    Ready,
}

/// Mutable state of one node
pub struct NodeCore {
    identity: NodeIdentity,
    clock: LamportClock,
    physical: PhysicalClock,
    election: ElectionManager,
    sync: ClockSynchronizer,
    engine: ReplicationEngine,
    view: PeerView,
    bootstrap: Bootstrap,
    /// Records received while bootstrapping
    buffered: Vec<OperationRecord>,
    outbox: Outbox,
    deliveries: Vec<Delivery>,
    snapshot_file: Option<SnapshotFile>,
    bootstrap_timeout: Duration,
}

impl NodeCore {
    /// Create the core for a node that registered with `rank`
    pub fn new(settings: &NodeSettings, rank: u64) -> Self {
        let identity = NodeIdentity::new(settings.node_id.clone(), rank, settings.address.clone());

        Self {
            clock: LamportClock::new(),
            physical: PhysicalClock::with_offset(settings.initial_offset_ms),
            election: ElectionManager::new(identity.clone(), settings.election.clone()),
            sync: ClockSynchronizer::new(settings.sync.clone()),
            engine: ReplicationEngine::new(settings.node_id.clone()),
            view: PeerView::new(settings.node_id.clone()),
            bootstrap: Bootstrap::Ready,
            buffered: Vec::new(),
            outbox: Outbox::new(),
            deliveries: Vec::new(),
            snapshot_file: settings
                .snapshot_dir
                .as_ref()
                .map(|dir| SnapshotFile::new(dir, &settings.node_id)),
            bootstrap_timeout: settings.bootstrap_timeout,
            identity,
        }
    }

    /// Merge the registry's clock seen during registration
    pub fn observe_clock(&mut self, clock: u64) {
        self.clock.merge(clock);
    }

    /// Restore local state, begin bootstrap sync and start the election
    pub fn start(&mut self, now: Instant, peers: Vec<NodeIdentity>, restored: Option<Snapshot>) {
        if let Some(snapshot) = restored {
            let restored_ops = self.engine.merge_snapshot(&mut self.clock, snapshot);
            tracing::info!("Restored {} operation(s) from local snapshot", restored_ops);
        }

        self.view.replace(peers);
        let candidates: VecDeque<NodeIdentity> = self.view.by_rank_desc().into();
        self.request_snapshot(now, candidates);

        let previous = self.coordinator_id();
        self.election.start_election(now, &self.view, &mut self.outbox);
        self.after_election_step(previous);
    }

    // ========== Event handlers ==========

    /// Handle one coordination-topic envelope
    pub fn handle_envelope(&mut self, now: Instant, envelope: Envelope) {
        let Envelope { from, clock, message } = envelope;
        if from.node_id == self.identity.node_id {
            return;
        }

        self.clock.merge(clock);
        let reappeared = self.view.observe(&from);
        let exchanging = matches!(message, Message::SnapshotRequest | Message::SnapshotReply { .. });
        let previous = self.coordinator_id();

        match message {
            Message::Election { .. } => {
                self.election.on_election(now, &from, &self.view, &mut self.outbox);
            }
            Message::Ok { .. } => self.election.on_ok(now, &from),
            Message::Coordinator { node_id, rank } => {
                let announced = if node_id == from.node_id {
                    NodeIdentity::new(node_id, rank, from.address.clone())
                } else {
                    let address = self
                        .view
                        .get(&node_id)
                        .map(|peer| peer.address.clone())
                        .unwrap_or_else(|| from.address.clone());
                    NodeIdentity::new(node_id, rank, address)
                };
                if let Err(e) = self.election.on_coordinator(now, announced, &self.view, &mut self.outbox) {
                    tracing::debug!("{}", e);
                }
            }
            Message::Ping => self.outbox.send(&from, Message::Pong),
            Message::Pong => self.election.on_pong(&from),
            Message::TimeRequest { round } => {
                let time_ms = self.physical.now_ms();
                self.outbox.send(&from, Message::TimeReply { round, time_ms });
            }
            Message::TimeReply { round, time_ms } => {
                if self.sync.on_reply(round, &from, time_ms) {
                    self.finish_sync_round();
                }
            }
            Message::ClockAdjust { round, delta_ms } => {
                if previous.as_deref() == Some(from.node_id.as_str()) {
                    self.physical.adjust(delta_ms);
                    tracing::debug!("Clock adjusted by {} ms (round {})", delta_ms, round);
                } else {
                    tracing::debug!("Ignoring clock adjustment from non-coordinator {}", from);
                }
            }
            Message::Replicate { record } => self.on_replicate(record),
            Message::SnapshotRequest => self.on_snapshot_request(&from),
            Message::SnapshotReply { snapshot } => self.on_snapshot_reply(&from, snapshot),
        }

        if reappeared && !exchanging && self.is_ready() {
            self.reconcile(&from);
        }
        self.after_election_step(previous);
    }

    /// Handle a client request
    pub fn handle_client(&mut self, now: Instant, request: ClientRequest) -> ClientResponse {
        self.clock.merge(request.logical_clock);

        let result = self.serve(now, &request);
        let clock = self.clock.tick();

        match result {
            Ok(payload) => ClientResponse::ok(&request.service, payload, clock),
            Err(e) => {
                if !e.is_client_facing() {
                    tracing::warn!("Request '{}' failed: {}", request.service, e);
                }
                ClientResponse::error(&request.service, &e, clock)
            }
        }
    }

    /// Handle a registry update from the heartbeat task
    pub fn handle_membership(&mut self, now: Instant, event: MembershipEvent) {
        let previous = self.coordinator_id();

        match event {
            MembershipEvent::View { peers, clock } => {
                self.clock.merge(clock);
                let joined: Vec<NodeIdentity> = peers
                    .iter()
                    .filter(|peer| {
                        peer.node_id != self.identity.node_id && !self.view.contains(&peer.node_id)
                    })
                    .cloned()
                    .collect();

                if self.view.replace(peers) {
                    tracing::debug!("Membership view now has {} peer(s)", self.view.len());
                    self.election.on_view_changed(now, &self.view, &mut self.outbox);
                }
                if self.is_ready() {
                    for peer in &joined {
                        self.reconcile(peer);
                    }
                }

                // A suspected peer that answers is reconciled on its pong
                for node_id in self.view.suspected() {
                    if let Some(peer) = self.view.get(&node_id).cloned() {
                        self.outbox.send(&peer, Message::Ping);
                    }
                }
            }
            MembershipEvent::Reregistered { rank, clock } => {
                self.clock.merge(clock);
                if rank != self.identity.rank {
                    self.identity.rank = rank;
                    self.election.rerank(now, rank, &self.view, &mut self.outbox);
                }
            }
        }

        self.after_election_step(previous);
    }

    /// A `Replicate` to `address` was given up on
    pub fn handle_undelivered(&mut self, address: &str) {
        if let Some(node_id) = self.view.by_address(address).map(|peer| peer.node_id.clone()) {
            self.view.suspect(&node_id);
        }
    }

    /// Act on every deadline that has passed
    pub fn poll(&mut self, now: Instant) {
        let previous = self.coordinator_id();
        self.election.poll(now, &mut self.view, &mut self.outbox);
        self.after_election_step(previous);

        if self.sync.deadline().map(|d| d <= now).unwrap_or(false) {
            self.finish_sync_round();
        }

        let bootstrap_expired = matches!(&self.bootstrap, Bootstrap::Syncing { deadline, .. } if *deadline <= now);
        if bootstrap_expired {
            if let Bootstrap::Syncing { current, remaining, .. } =
                std::mem::replace(&mut self.bootstrap, Bootstrap::Ready)
            {
                tracing::warn!("No snapshot from {} within {:?}", current, self.bootstrap_timeout);
                self.request_snapshot(now, remaining);
            }
        }
    }

    /// Earliest pending deadline across all state machines
    pub fn next_deadline(&self) -> Option<Instant> {
        let bootstrap = match &self.bootstrap {
            Bootstrap::Syncing { deadline, .. } => Some(*deadline),
            Bootstrap::Ready => None,
        };

        [self.election.next_deadline(), self.sync.deadline(), bootstrap]
            .into_iter()
            .flatten()
            .min()
    }

    // ========== Side effects ==========

    /// Stamp queued messages and resolve their recipients
    ///
    /// Each queued message is one send and ticks the clock once, a
    /// broadcast included.
    pub fn take_outgoing(&mut self) -> Vec<(String, Envelope)> {
        let mut outgoing = Vec::new();

        for (target, message) in self.outbox.drain() {
            let recipients = match target {
                Target::Peer(peer) => vec![peer],
                Target::Broadcast => self.view.others(),
            };
            if recipients.is_empty() {
                continue;
            }

            let envelope = Envelope {
                from: self.identity.clone(),
                clock: self.clock.tick(),
                message,
            };
            for peer in recipients {
                outgoing.push((peer.address, envelope.clone()));
            }
        }

        outgoing
    }

    /// Fan-out deliveries produced since the last call
    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }

    // ========== Reporting ==========

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn logical_clock(&self) -> u64 {
        self.clock.value()
    }

    pub fn physical_offset_ms(&self) -> i64 {
        self.physical.offset_ms()
    }

    pub fn election_state(&self) -> ElectionState {
        self.election.state()
    }

    /// Node id of the current coordinator
    pub fn coordinator_id(&self) -> Option<String> {
        self.election.coordinator().map(|c| c.node_id.clone())
    }

    /// Bootstrap sync finished
    pub fn is_ready(&self) -> bool {
        matches!(self.bootstrap, Bootstrap::Ready)
    }

    pub fn dataset(&self) -> &ReplicatedDataset {
        self.engine.dataset()
    }

    pub fn sync_rounds(&self) -> u64 {
        self.sync.rounds_started()
    }

    /// Dataset in its reporting shape
    pub fn state(&self) -> PersistedState {
        self.engine.dataset().export()
    }

    /// Coordination status report
    pub fn status(&self) -> NodeStatus {
        let dataset = self.engine.dataset();

        NodeStatus {
            node_id: self.identity.node_id.clone(),
            rank: self.identity.rank,
            address: self.identity.address.clone(),
            state: self.election.state(),
            coordinator: self.election.coordinator().cloned(),
            logical_clock: self.clock.value(),
            physical_time: self.physical.now(),
            physical_offset_ms: self.physical.offset_ms(),
            ready: self.is_ready(),
            users: dataset.users().len(),
            channels: dataset.channels().len(),
            messages: dataset.messages().len(),
            publications: dataset.publications().len(),
            operations: self.engine.seen_count(),
            elections_started: self.election.elections_started(),
            sync_rounds: self.sync.rounds_started(),
            peers: self.view.by_rank_desc(),
            suspected: self.view.suspected(),
        }
    }

    // ========== Internals ==========

    fn serve(&mut self, now: Instant, request: &ClientRequest) -> Result<Value> {
        let call = ServiceCall::parse(request)?;

        if call == ServiceCall::WhoCoordinator {
            return Ok(self.coordinator_payload());
        }
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        let result = self.execute(call);

        if self.sync.record_operation(self.election.is_coordinator()) {
            self.start_sync_round(now);
        }
        result
    }

    fn execute(&mut self, call: ServiceCall) -> Result<Value> {
        match call {
            ServiceCall::Users => Ok(json!({ "users": self.engine.dataset().users() })),
            ServiceCall::Channels => Ok(json!({ "channels": self.engine.dataset().channels() })),
            ServiceCall::WhoCoordinator => Ok(self.coordinator_payload()),
            write => match write.into_mutation() {
                Some(mutation) => self.write(mutation),
                None => Err(Error::Internal("service has no mutation".into())),
            },
        }
    }

    fn write(&mut self, mutation: Mutation) -> Result<Value> {
        let record = self
            .engine
            .propose_local(&mut self.clock, mutation, self.physical.now())?;

        if let Some(delivery) = Delivery::for_record(&record) {
            self.deliveries.push(delivery);
        }

        let payload = json!({
            "opId": record.op_id.to_string(),
            "logicalClock": record.logical_clock,
        });
        self.outbox.broadcast(Message::Replicate { record });
        self.persist();
        Ok(payload)
    }

    fn coordinator_payload(&self) -> Value {
        let coordinator = self.election.coordinator();
        json!({
            "coordinator": coordinator.map(|c| c.node_id.clone()),
            "rank": coordinator.map(|c| c.rank),
            "state": self.election.state(),
        })
    }

    fn on_replicate(&mut self, record: OperationRecord) {
        if !self.is_ready() {
            if !self.engine.has_seen(&record.op_id) {
                tracing::debug!("Buffering {} until bootstrap completes", record.op_id);
                self.buffered.push(record);
            }
            return;
        }

        if self.engine.apply_remote(&mut self.clock, &record) == ApplyOutcome::Applied {
            self.persist();
        }
    }

    /// Answered from current state, even mid-bootstrap
    fn on_snapshot_request(&mut self, from: &NodeIdentity) {
        let snapshot = self.engine.snapshot(&self.clock);
        tracing::info!("Sending snapshot ({} operations) to {}", snapshot.seen.len(), from);
        self.outbox.send(from, Message::SnapshotReply { snapshot });
    }

    fn on_snapshot_reply(&mut self, from: &NodeIdentity, snapshot: Snapshot) {
        let added = self.engine.merge_snapshot(&mut self.clock, snapshot);

        if self.is_ready() {
            tracing::debug!("Merged late snapshot from {} ({} new operations)", from, added);
            if added > 0 {
                self.persist();
            }
            return;
        }

        tracing::info!("Bootstrapped from {} ({} operations)", from, added);
        self.finish_bootstrap();
    }

    /// Swap snapshots with a peer that just joined or came back
    fn reconcile(&mut self, peer: &NodeIdentity) {
        tracing::info!("Reconciling state with {}", peer);
        let snapshot = self.engine.snapshot(&self.clock);
        self.outbox.send(peer, Message::SnapshotRequest);
        self.outbox.send(peer, Message::SnapshotReply { snapshot });
    }

    fn request_snapshot(&mut self, now: Instant, mut candidates: VecDeque<NodeIdentity>) {
        match candidates.pop_front() {
            Some(peer) => {
                tracing::info!("Requesting bootstrap snapshot from {}", peer);
                self.outbox.send(&peer, Message::SnapshotRequest);
                self.bootstrap = Bootstrap::Syncing {
                    current: peer,
                    remaining: candidates,
                    deadline: now + self.bootstrap_timeout,
                };
            }
            None => {
                tracing::info!("No peer to bootstrap from, serving local state");
                self.finish_bootstrap();
            }
        }
    }

    fn finish_bootstrap(&mut self) {
        self.bootstrap = Bootstrap::Ready;

        let buffered = std::mem::take(&mut self.buffered);
        let replayed = buffered.len();
        for record in buffered {
            self.engine.apply_remote(&mut self.clock, &record);
        }
        if replayed > 0 {
            tracing::debug!("Replayed {} buffered record(s)", replayed);
        }

        self.persist();
    }

    fn start_sync_round(&mut self, now: Instant) {
        if self.sync.in_progress() {
            tracing::debug!("Closing open clock sync round early, next one is due");
            self.finish_sync_round();
        }

        let members = self.view.trusted();
        self.sync
            .start_round(now, self.physical.now_ms(), &members, &mut self.outbox);
        if self.sync.is_complete() {
            self.finish_sync_round();
        }
    }

    fn finish_sync_round(&mut self) {
        if let Some(delta_ms) = self.sync.finish(&mut self.outbox) {
            self.physical.adjust(delta_ms);
        }
    }

    fn after_election_step(&mut self, previous: Option<String>) {
        let current = self.coordinator_id();
        if current != previous {
            tracing::info!(
                "{}: coordinator {} -> {}",
                self.identity.node_id,
                previous.as_deref().unwrap_or("none"),
                current.as_deref().unwrap_or("none")
            );
            self.sync.reset();
        }
    }

    fn persist(&self) {
        if let Some(file) = &self.snapshot_file {
            if let Err(e) = file.save(&self.engine.snapshot(&self.clock)) {
                tracing::warn!("Failed to persist snapshot to {}: {}", file.path().display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(id: &str) -> NodeSettings {
        NodeSettings::new(id, format!("{}:5561", id))
    }

    fn core(id: &str, rank: u64) -> NodeCore {
        NodeCore::new(&settings(id), rank)
    }

    fn login(user: &str) -> ClientRequest {
        ClientRequest::new("login", json!({ "user": user }), 0)
    }

    /// Deliver queued envelopes between cores until nothing is left
    fn pump(now: Instant, cores: &mut [&mut NodeCore]) {
        for _ in 0..100 {
            let mut pending = Vec::new();
            for core in cores.iter_mut() {
                pending.extend(core.take_outgoing());
            }
            if pending.is_empty() {
                return;
            }
            for (address, envelope) in pending {
                if let Some(target) = cores.iter_mut().find(|c| c.identity().address == address) {
                    target.handle_envelope(now, envelope);
                }
            }
        }
        panic!("message storm");
    }

    /// B (rank 2) alone, then A (rank 1) joins and bootstraps from B
    fn pair(now: Instant) -> (NodeCore, NodeCore) {
        let mut b = core("b", 2);
        b.start(now, vec![], None);
        let mut a = core("a", 1);
        a.start(now, vec![b.identity().clone()], None);
        pump(now, &mut [&mut a, &mut b]);
        (a, b)
    }

    #[test]
    fn test_single_node_is_ready_coordinator() {
        let mut node = core("a", 1);
        node.start(Instant::now(), vec![], None);

        assert!(node.is_ready());
        assert_eq!(node.election_state(), ElectionState::Coordinator);
        // Broadcast with no peers produces nothing
        assert!(node.take_outgoing().is_empty());
    }

    #[test]
    fn test_pair_agrees_on_higher_rank() {
        let (a, b) = pair(Instant::now());
        assert!(a.is_ready());
        assert_eq!(a.coordinator_id().as_deref(), Some("b"));
        assert_eq!(b.coordinator_id().as_deref(), Some("b"));
        assert_eq!(a.election_state(), ElectionState::Idle);
    }

    #[test]
    fn test_client_write_replicates() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        let response = a.handle_client(now, login("alice"));
        assert!(response.is_ok(), "{:?}", response);
        pump(now, &mut [&mut a, &mut b]);
        assert_eq!(b.dataset().users(), vec!["alice"]);

        let duplicate = b.handle_client(now, login("alice"));
        assert_eq!(duplicate.error_code(), Some("duplicate_registration"));
    }

    #[test]
    fn test_response_clock_exceeds_request_clock() {
        let mut node = core("a", 1);
        node.start(Instant::now(), vec![], None);

        let request = ClientRequest::new("users", Value::Null, 50);
        let response = node.handle_client(Instant::now(), request);
        assert!(response.logical_clock > 50);
    }

    #[test]
    fn test_not_ready_until_bootstrapped() {
        let now = Instant::now();
        let mut a = core("a", 1);
        a.start(now, vec![NodeIdentity::new("b", 2, "b:5561")], None);
        assert!(!a.is_ready());

        let response = a.handle_client(now, login("alice"));
        assert_eq!(response.error_code(), Some("not_ready"));

        let who = a.handle_client(now, ClientRequest::new("who_coordinator", Value::Null, 0));
        assert!(who.is_ok());
    }

    #[test]
    fn test_bootstrap_times_out_to_sole_node() {
        let now = Instant::now();
        let mut a = core("a", 1);
        a.start(now, vec![NodeIdentity::new("b", 2, "b:5561")], None);

        a.poll(now + Duration::from_secs(3));
        assert!(a.is_ready());
    }

    #[test]
    fn test_replicate_buffered_during_bootstrap() {
        let now = Instant::now();
        let mut b = core("b", 2);
        b.start(now, vec![], None);
        b.handle_client(now, login("alice"));

        let mut a = core("a", 1);
        a.start(now, vec![b.identity().clone()], None);
        let to_b = a.take_outgoing();

        // A record arrives before the snapshot
        let record = OperationRecord::new("c", 9, Mutation::CreateUser { name: "carol".into() }, chrono::Utc::now());
        a.handle_envelope(now, Envelope {
            from: NodeIdentity::new("c", 3, "c:5561"),
            clock: 9,
            message: Message::Replicate { record },
        });
        assert!(a.dataset().users().is_empty());

        for (_, envelope) in to_b {
            b.handle_envelope(now, envelope);
        }
        pump(now, &mut [&mut a, &mut b]);

        assert!(a.is_ready());
        assert_eq!(a.dataset().users(), vec!["alice", "carol"]);
    }

    #[test]
    fn test_berkeley_cadence_on_coordinator_only() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        for i in 0..20 {
            a.handle_client(now, login(&format!("a{}", i)));
        }
        assert_eq!(a.sync_rounds(), 0);

        for i in 0..9 {
            b.handle_client(now, login(&format!("b{}", i)));
        }
        assert_eq!(b.sync_rounds(), 0);
        b.handle_client(now, login("b9"));
        assert_eq!(b.sync_rounds(), 1);
    }

    #[test]
    fn test_berkeley_round_due_inside_open_window() {
        let now = Instant::now();
        let mut b = core("b", 2);
        b.start(now, vec![], None);
        // Silent peer keeps every round open until its window ends
        b.handle_envelope(now, Envelope {
            from: NodeIdentity::new("a", 1, "a:5561"),
            clock: 1,
            message: Message::Pong,
        });
        b.take_outgoing();

        for i in 0..20 {
            assert!(b.handle_client(now, login(&format!("u{}", i))).is_ok());
        }
        assert_eq!(b.sync_rounds(), 2);
        assert!(b.sync.in_progress());
        assert_eq!(b.sync.rounds_completed(), 1);
    }

    #[test]
    fn test_berkeley_round_aligns_offsets() {
        let now = Instant::now();
        let mut b = NodeCore::new(&settings("b"), 2);
        b.start(now, vec![], None);
        let mut skewed = settings("a");
        skewed.initial_offset_ms = 1_000;
        let mut a = NodeCore::new(&skewed, 1);
        a.start(now, vec![b.identity().clone()], None);
        pump(now, &mut [&mut a, &mut b]);

        for i in 0..10 {
            b.handle_client(now, login(&format!("u{}", i)));
        }
        pump(now, &mut [&mut a, &mut b]);

        assert!(!b.sync.in_progress());
        assert!((a.physical_offset_ms() - 500).abs() < 50, "a offset {}", a.physical_offset_ms());
        assert!((b.physical_offset_ms() - 500).abs() < 50, "b offset {}", b.physical_offset_ms());
    }

    #[test]
    fn test_clock_adjust_from_non_coordinator_ignored() {
        let now = Instant::now();
        let (mut a, _b) = pair(now);

        a.handle_envelope(now, Envelope {
            from: NodeIdentity::new("c", 0, "c:5561"),
            clock: 1,
            message: Message::ClockAdjust { round: 1, delta_ms: 10_000 },
        });
        assert_eq!(a.physical_offset_ms(), 0);
    }

    #[test]
    fn test_deliveries_only_at_origin() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        a.handle_client(now, login("alice"));
        a.handle_client(now, ClientRequest::new("channel", json!({ "channel": "geral" }), 0));
        a.take_deliveries();

        let publish = ClientRequest::new(
            "publish",
            json!({ "user": "alice", "channel": "geral", "message": "ola" }),
            0,
        );
        assert!(a.handle_client(now, publish).is_ok());
        pump(now, &mut [&mut a, &mut b]);

        let deliveries = a.take_deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].topic(), "geral");
        assert!(b.take_deliveries().is_empty());
        assert_eq!(b.dataset().publications().len(), 1);
    }

    /// State a node would have persisted after serving one login alone
    fn saved(id: &str, rank: u64, user: &str) -> Snapshot {
        let mut node = core(id, rank);
        node.start(Instant::now(), vec![], None);
        node.handle_client(Instant::now(), login(user));
        node.engine.snapshot(&node.clock)
    }

    fn sorted_users(node: &NodeCore) -> Vec<String> {
        let mut users = node.dataset().users();
        users.sort();
        users
    }

    #[test]
    fn test_simultaneous_restart_converges() {
        let now = Instant::now();
        let mut a = core("a", 1);
        let mut b = core("b", 2);
        let (a_id, b_id) = (a.identity().clone(), b.identity().clone());

        a.start(now, vec![b_id], Some(saved("a", 1, "alice")));
        b.start(now, vec![a_id], Some(saved("b", 2, "bob")));
        assert!(!a.is_ready() && !b.is_ready());
        pump(now, &mut [&mut a, &mut b]);

        let later = now + Duration::from_secs(5);
        a.poll(later);
        b.poll(later);
        pump(later, &mut [&mut a, &mut b]);

        assert!(a.is_ready() && b.is_ready());
        assert_eq!(sorted_users(&a), vec!["alice", "bob"]);
        assert_eq!(sorted_users(&b), vec!["alice", "bob"]);
    }

    #[test]
    fn test_isolated_nodes_reconcile_when_listed() {
        let now = Instant::now();
        let mut a = core("a", 1);
        let mut b = core("b", 2);
        a.start(now, vec![], Some(saved("a", 1, "alice")));
        b.start(now, vec![], Some(saved("b", 2, "bob")));
        assert!(a.is_ready() && b.is_ready());

        let peers = vec![a.identity().clone(), b.identity().clone()];
        a.handle_membership(now, MembershipEvent::View { peers, clock: 0 });
        pump(now, &mut [&mut a, &mut b]);

        assert_eq!(sorted_users(&a), vec!["alice", "bob"]);
        assert_eq!(sorted_users(&b), vec!["alice", "bob"]);
        assert_eq!(a.coordinator_id().as_deref(), Some("b"));
    }

    #[test]
    fn test_lost_replicate_recovered_after_suspicion() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        // b's delivery gives up on the write to a
        assert!(b.handle_client(now, login("carol")).is_ok());
        b.take_outgoing();
        b.handle_undelivered("a:5561");
        assert_eq!(b.status().suspected, vec!["a"]);
        assert!(a.dataset().users().is_empty());

        // The next listing pings a, whose pong triggers the exchange
        let peers = vec![a.identity().clone(), b.identity().clone()];
        b.handle_membership(now, MembershipEvent::View { peers, clock: 0 });
        pump(now, &mut [&mut a, &mut b]);

        assert!(b.status().suspected.is_empty());
        assert_eq!(a.dataset().users(), vec!["carol"]);
    }
}
