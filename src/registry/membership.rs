//! Registry State
//!
//! Rank assignment, heartbeat bookkeeping and the liveness sweep.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use super::protocol::{RegistryRequest, RegistryResponse, Stamped};
use super::MembershipEntry;
use crate::clock::LamportClock;

/// Authoritative membership table
pub struct MembershipRegistry {
    /// Current entry per node id
    entries: HashMap<String, MembershipEntry>,
    /// Entries superseded by a re-registration under a new rank
    history: Vec<MembershipEntry>,
    /// Next rank to hand out
    next_rank: u64,
    /// Heartbeat silence after which a member is inactive
    liveness_window: Duration,
}

impl MembershipRegistry {
    /// Create an empty registry
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            history: Vec::new(),
            next_rank: 1,
            liveness_window,
        }
    }

    /// Register a node and return its rank
    ///
    /// A node that is still active keeps its rank. A node whose entry went
    /// inactive gets a fresh rank; ranks are never handed out twice.
    pub fn register(&mut self, node_id: &str, address: &str, now: Instant) -> u64 {
        if let Some(entry) = self.entries.get_mut(node_id) {
            if entry.is_live(now, self.liveness_window) {
                entry.address = address.to_string();
                entry.touch(now);
                tracing::debug!("Node '{}' re-registered with rank {}", node_id, entry.rank);
                return entry.rank;
            }
        }

        let rank = self.next_rank;
        self.next_rank += 1;

        let entry = MembershipEntry::new(node_id.to_string(), rank, address.to_string(), now);
        if let Some(mut previous) = self.entries.insert(node_id.to_string(), entry) {
            previous.active = false;
            self.history.push(previous);
        }

        tracing::info!("Node '{}' registered at {} with rank {}", node_id, address, rank);
        rank
    }

    /// Refresh a node's heartbeat; returns false for unknown nodes
    pub fn heartbeat(&mut self, node_id: &str, now: Instant) -> bool {
        match self.entries.get_mut(node_id) {
            Some(entry) => {
                if !entry.active {
                    tracing::info!("Node '{}' is active again", node_id);
                }
                entry.touch(now);
                true
            }
            None => {
                tracing::warn!("Heartbeat from unregistered node '{}'", node_id);
                false
            }
        }
    }

    /// Remove a node's entry, keeping it in the history
    ///
    /// A later heartbeat from the node is answered as unknown, and its next
    /// registration gets a fresh rank.
    pub fn deregister(&mut self, node_id: &str) -> bool {
        match self.entries.remove(node_id) {
            Some(mut entry) => {
                entry.active = false;
                tracing::info!("Node '{}' (rank {}) left the membership", node_id, entry.rank);
                self.history.push(entry);
                true
            }
            None => false,
        }
    }

    /// Mark stale entries inactive, returning the ids that just went inactive
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();

        for (id, entry) in self.entries.iter_mut() {
            if entry.active && !entry.is_live(now, self.liveness_window) {
                entry.active = false;
                expired.push(id.clone());
            }
        }

        for id in &expired {
            tracing::info!("Node '{}' marked inactive (no heartbeat)", id);
        }

        expired
    }

    /// Active members ordered by rank, highest first
    pub fn list_active(&mut self, now: Instant) -> Vec<MembershipEntry> {
        self.sweep(now);

        let mut active: Vec<MembershipEntry> = self
            .entries
            .values()
            .filter(|e| e.active)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.rank.cmp(&a.rank));
        active
    }

    /// Every current entry, including inactive ones, highest rank first
    pub fn list_all(&self) -> Vec<MembershipEntry> {
        let mut all: Vec<MembershipEntry> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| b.rank.cmp(&a.rank));
        all
    }

    /// Entries replaced by re-registration
    pub fn history(&self) -> &[MembershipEntry] {
        &self.history
    }

    /// Get a node's current entry
    pub fn get(&self, node_id: &str) -> Option<&MembershipEntry> {
        self.entries.get(node_id)
    }
}

/// Registry table plus the registry's own Lamport clock
///
/// Both the TCP server and [`LocalRegistry`](super::LocalRegistry) answer
/// requests through [`handle`](Self::handle).
pub struct RegistryService {
    registry: MembershipRegistry,
    clock: LamportClock,
}

impl RegistryService {
    /// Create a service with an empty table
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            registry: MembershipRegistry::new(liveness_window),
            clock: LamportClock::new(),
        }
    }

    /// Answer one request
    pub fn handle(&mut self, request: Stamped<RegistryRequest>, now: Instant) -> Stamped<RegistryResponse> {
        self.clock.merge(request.clock);

        let body = match request.body {
            RegistryRequest::Register { node_id, address } => {
                if node_id.is_empty() || address.is_empty() {
                    RegistryResponse::Error {
                        message: "node_id and address are required".into(),
                    }
                } else {
                    RegistryResponse::Registered {
                        rank: self.registry.register(&node_id, &address, now),
                    }
                }
            }
            RegistryRequest::Heartbeat { node_id } => RegistryResponse::HeartbeatAck {
                known: self.registry.heartbeat(&node_id, now),
            },
            RegistryRequest::Deregister { node_id } => RegistryResponse::Deregistered {
                known: self.registry.deregister(&node_id),
            },
            RegistryRequest::ListActive => RegistryResponse::Members {
                entries: self.registry.list_active(now),
            },
            RegistryRequest::ListAll => RegistryResponse::Members {
                entries: self.registry.list_all(),
            },
        };

        Stamped {
            clock: self.clock.tick(),
            body,
        }
    }

    /// Run the periodic liveness sweep
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        self.registry.sweep(now)
    }

    /// Access the membership table
    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> Duration {
        Duration::from_secs(30)
    }

    #[test]
    fn test_ranks_increase() {
        let now = Instant::now();
        let mut registry = MembershipRegistry::new(window());

        assert_eq!(registry.register("servidor_1", "s1:5561", now), 1);
        assert_eq!(registry.register("servidor_2", "s2:5561", now), 2);
        assert_eq!(registry.register("servidor_3", "s3:5561", now), 3);

        // Retry while active keeps the rank
        assert_eq!(registry.register("servidor_2", "s2:5561", now), 2);
    }

    #[test]
    fn test_rank_not_reused_after_inactivity() {
        let start = Instant::now();
        let mut registry = MembershipRegistry::new(window());

        assert_eq!(registry.register("servidor_1", "s1:5561", start), 1);
        assert_eq!(registry.register("servidor_2", "s2:5561", start), 2);

        let later = start + Duration::from_secs(31);
        registry.heartbeat("servidor_2", later);
        assert_eq!(registry.register("servidor_1", "s1:5561", later), 3);
        assert_eq!(registry.history().len(), 1);
        assert_eq!(registry.history()[0].rank, 1);
    }

    #[test]
    fn test_heartbeat_unknown_node() {
        let mut registry = MembershipRegistry::new(window());
        assert!(!registry.heartbeat("ghost", Instant::now()));
    }

    #[test]
    fn test_deregister_retires_rank() {
        let now = Instant::now();
        let mut registry = MembershipRegistry::new(window());
        registry.register("servidor_1", "s1:5561", now);
        registry.register("servidor_2", "s2:5561", now);

        assert!(registry.deregister("servidor_1"));
        assert!(!registry.deregister("servidor_1"));
        assert!(!registry.heartbeat("servidor_1", now));
        assert_eq!(registry.list_active(now).len(), 1);
        assert_eq!(registry.history()[0].rank, 1);

        assert_eq!(registry.register("servidor_1", "s1:5561", now), 3);
    }

    #[test]
    fn test_liveness_window() {
        let start = Instant::now();
        let mut registry = MembershipRegistry::new(window());
        registry.register("servidor_1", "s1:5561", start);
        registry.register("servidor_2", "s2:5561", start);

        let t20 = start + Duration::from_secs(20);
        registry.heartbeat("servidor_2", t20);

        let t31 = start + Duration::from_secs(31);
        let active = registry.list_active(t31);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id, "servidor_2");

        // Inactive entries are retained
        assert_eq!(registry.list_all().len(), 2);
        assert!(!registry.get("servidor_1").unwrap().active);

        // A fresh heartbeat brings the node back with its old rank
        registry.heartbeat("servidor_1", t31);
        let active = registry.list_active(t31);
        assert_eq!(active.len(), 2);
        assert_eq!(registry.get("servidor_1").unwrap().rank, 1);
    }

    #[test]
    fn test_list_active_ordered_by_rank_desc() {
        let now = Instant::now();
        let mut registry = MembershipRegistry::new(window());
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            registry.register(id, &format!("{}:{}", id, 5561 + i), now);
        }

        let ranks: Vec<u64> = registry.list_active(now).iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_sweep_reports_once() {
        let start = Instant::now();
        let mut registry = MembershipRegistry::new(window());
        registry.register("servidor_1", "s1:5561", start);

        let later = start + Duration::from_secs(40);
        assert_eq!(registry.sweep(later), vec!["servidor_1".to_string()]);
        assert!(registry.sweep(later).is_empty());
    }

    #[test]
    fn test_service_merges_clock() {
        let mut service = RegistryService::new(window());
        let response = service.handle(
            Stamped {
                clock: 41,
                body: RegistryRequest::Register {
                    node_id: "servidor_1".into(),
                    address: "s1:5561".into(),
                },
            },
            Instant::now(),
        );

        assert_eq!(response.clock, 43);
        assert!(matches!(response.body, RegistryResponse::Registered { rank: 1 }));
    }
}
