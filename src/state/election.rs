//! Leader Election
//!
//! Bully election over registry ranks. The manager is a plain state
//! machine: every handler takes the current time and queues outgoing
//! messages in an [`Outbox`]; the node's dispatch loop sleeps until
//! [`next_deadline`](ElectionManager::next_deadline) and calls
//! [`poll`](ElectionManager::poll).

use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use super::view::PeerView;
use crate::registry::NodeIdentity;
use crate::replication::{Message, Outbox};
use crate::error::{Error, Result};

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionState {
    /// Following a known coordinator
    Idle,
    /// Sent Election, waiting for an Ok
    Electing,
    /// Got an Ok, waiting for the announcement
    WaitingCoordinator,
    /// This node is the coordinator
    Coordinator,
}

/// Election timing
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Wait for an Ok after sending Election (also the pong timeout)
    pub ok_timeout: Duration,
    /// Wait for Coordinator after receiving an Ok
    pub coordinator_timeout: Duration,
    /// Interval between coordinator pings
    pub ping_interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            ok_timeout: Duration::from_secs(2),
            coordinator_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
        }
    }
}

/// Per-node Bully state machine
#[derive(Debug)]
pub struct ElectionManager {
    identity: NodeIdentity,
    config: ElectionConfig,
    state: ElectionState,
    coordinator: Option<NodeIdentity>,
    /// Higher-ranked nodes that have not answered the current Election
    awaiting: BTreeSet<String>,
    ok_deadline: Option<Instant>,
    coordinator_deadline: Option<Instant>,
    next_ping: Option<Instant>,
    pong_deadline: Option<Instant>,
    elections_started: u64,
}

impl ElectionManager {
    /// Create a manager; no election runs until [`start_election`](Self::start_election)
    pub fn new(identity: NodeIdentity, config: ElectionConfig) -> Self {
        Self {
            identity,
            config,
            state: ElectionState::Idle,
            coordinator: None,
            awaiting: BTreeSet::new(),
            ok_deadline: None,
            coordinator_deadline: None,
            next_ping: None,
            pong_deadline: None,
            elections_started: 0,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn coordinator(&self) -> Option<&NodeIdentity> {
        self.coordinator.as_ref()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Check if this node is the coordinator
    pub fn is_coordinator(&self) -> bool {
        self.state == ElectionState::Coordinator
    }

    pub fn elections_started(&self) -> u64 {
        self.elections_started
    }

    /// Start an election
    pub fn start_election(&mut self, now: Instant, view: &PeerView, outbox: &mut Outbox) {
        self.elections_started += 1;
        self.state = ElectionState::Electing;
        self.coordinator = None;
        self.coordinator_deadline = None;
        self.next_ping = None;
        self.pong_deadline = None;

        let higher = view.higher_trusted_than(self.identity.rank);
        if higher.is_empty() {
            tracing::info!("Election started by {}: no higher-ranked node", self.identity);
            self.become_coordinator(outbox);
            return;
        }

        tracing::info!(
            "Election started by {}, asking {} higher-ranked node(s)",
            self.identity,
            higher.len()
        );

        for peer in &higher {
            outbox.send(peer, Message::Election { from_rank: self.identity.rank });
        }
        self.awaiting = higher.into_iter().map(|p| p.node_id).collect();
        self.ok_deadline = Some(now + self.config.ok_timeout);
    }

    /// Handle an Election from another node
    pub fn on_election(&mut self, now: Instant, from: &NodeIdentity, view: &PeerView, outbox: &mut Outbox) {
        outbox.send(from, Message::Ok { from_rank: self.identity.rank });

        if self.state != ElectionState::Electing {
            tracing::debug!("Election from {}, taking over", from);
            self.start_election(now, view, outbox);
        }
    }

    /// Handle an Ok from a higher-ranked node
    pub fn on_ok(&mut self, now: Instant, from: &NodeIdentity) {
        self.awaiting.remove(&from.node_id);

        if self.state == ElectionState::Electing {
            tracing::debug!("Ok from {}, waiting for coordinator", from);
            self.state = ElectionState::WaitingCoordinator;
            self.coordinator_deadline = Some(now + self.config.coordinator_timeout);
        }
    }

    /// Handle a Coordinator announcement
    ///
    /// An announcement from a node ranked below the highest trusted rank is
    /// rejected and triggers a new election unless one is already running.
    pub fn on_coordinator(
        &mut self,
        now: Instant,
        announced: NodeIdentity,
        view: &PeerView,
        outbox: &mut Outbox,
    ) -> Result<()> {
        if announced.node_id == self.identity.node_id {
            return Ok(());
        }

        let known = view.highest_trusted_rank(self.identity.rank);
        if announced.rank < known {
            tracing::warn!(
                "Rejecting coordinator announcement from {}: rank {} is active",
                announced,
                known
            );
            // An election of our own already in flight resolves through its deadlines
            if matches!(self.state, ElectionState::Idle | ElectionState::Coordinator) {
                self.start_election(now, view, outbox);
            }
            return Err(Error::StaleCoordinator {
                announced: announced.rank,
                known,
            });
        }

        tracing::info!("{} adopted {} as coordinator", self.identity.node_id, announced);
        self.coordinator = Some(announced);
        self.state = ElectionState::Idle;
        self.awaiting.clear();
        self.ok_deadline = None;
        self.coordinator_deadline = None;
        self.pong_deadline = None;
        self.next_ping = Some(now + self.config.ping_interval);
        Ok(())
    }

    /// Handle a liveness answer
    pub fn on_pong(&mut self, from: &NodeIdentity) {
        if self.coordinator.as_ref().map(|c| c.node_id == from.node_id).unwrap_or(false) {
            self.pong_deadline = None;
        }
    }

    /// React to a new membership view
    pub fn on_view_changed(&mut self, now: Instant, view: &PeerView, outbox: &mut Outbox) {
        if self.state != ElectionState::Idle {
            return;
        }

        match &self.coordinator {
            Some(coordinator) if !view.contains(&coordinator.node_id) => {
                tracing::warn!("Coordinator {} left the membership", coordinator);
                self.start_election(now, view, outbox);
            }
            Some(_) => {}
            None => self.start_election(now, view, outbox),
        }
    }

    /// Act on every deadline that has passed
    pub fn poll(&mut self, now: Instant, view: &mut PeerView, outbox: &mut Outbox) {
        if expired(self.ok_deadline, now) {
            self.ok_deadline = None;
            for node_id in std::mem::take(&mut self.awaiting) {
                view.suspect(&node_id);
            }
            if self.state == ElectionState::Electing {
                tracing::info!("No Ok within {:?}", self.config.ok_timeout);
                self.become_coordinator(outbox);
                return;
            }
        }

        match self.state {
            ElectionState::WaitingCoordinator if expired(self.coordinator_deadline, now) => {
                tracing::warn!("No coordinator announced within {:?}, restarting election", self.config.coordinator_timeout);
                self.start_election(now, view, outbox);
            }
            ElectionState::Idle => self.poll_liveness(now, view, outbox),
            _ => {}
        }
    }

    fn poll_liveness(&mut self, now: Instant, view: &mut PeerView, outbox: &mut Outbox) {
        let Some(coordinator) = self.coordinator.clone() else {
            self.start_election(now, view, outbox);
            return;
        };

        if expired(self.pong_deadline, now) {
            tracing::warn!("Coordinator {} did not answer ping", coordinator);
            view.suspect(&coordinator.node_id);
            self.start_election(now, view, outbox);
            return;
        }

        if expired(self.next_ping, now) {
            outbox.send(&coordinator, Message::Ping);
            self.next_ping = Some(now + self.config.ping_interval);
            if self.pong_deadline.is_none() {
                self.pong_deadline = Some(now + self.config.ok_timeout);
            }
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = vec![self.ok_deadline];
        match self.state {
            ElectionState::WaitingCoordinator => deadlines.push(self.coordinator_deadline),
            ElectionState::Idle => {
                deadlines.push(self.next_ping);
                deadlines.push(self.pong_deadline);
            }
            _ => {}
        }
        deadlines.into_iter().flatten().min()
    }

    /// Take a new rank (after re-registration) and re-run the election
    pub fn rerank(&mut self, now: Instant, rank: u64, view: &PeerView, outbox: &mut Outbox) {
        tracing::info!("{} now has rank {}", self.identity.node_id, rank);
        self.identity.rank = rank;
        self.start_election(now, view, outbox);
    }

    fn become_coordinator(&mut self, outbox: &mut Outbox) {
        self.state = ElectionState::Coordinator;
        self.coordinator = Some(self.identity.clone());
        self.awaiting.clear();
        self.ok_deadline = None;
        self.coordinator_deadline = None;

        tracing::info!("{} is the coordinator", self.identity);
        outbox.broadcast(Message::Coordinator {
            node_id: self.identity.node_id.clone(),
            rank: self.identity.rank,
        });
    }
}

fn expired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.map(|d| d <= now).unwrap_or(false)
}
