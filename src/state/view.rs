//! Local membership view
//!
//! What a node believes about its peers: the registry's active list, plus
//! anyone it has heard from directly, minus nothing. Suspicion is tracked
//! separately and cleared by any message from the suspected node.

use std::collections::{BTreeMap, BTreeSet};

use crate::registry::NodeIdentity;

/// Peers known to one node (never includes the node itself)
#[derive(Debug, Clone)]
pub struct PeerView {
    self_id: String,
    members: BTreeMap<String, NodeIdentity>,
    suspected: BTreeSet<String>,
}

impl PeerView {
    /// Create an empty view for `self_id`
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            members: BTreeMap::new(),
            suspected: BTreeSet::new(),
        }
    }

    /// Replace the members with a fresh registry listing
    ///
    /// Returns true when the set of members changed.
    pub fn replace(&mut self, entries: impl IntoIterator<Item = NodeIdentity>) -> bool {
        let members: BTreeMap<String, NodeIdentity> = entries
            .into_iter()
            .filter(|identity| identity.node_id != self.self_id)
            .map(|identity| (identity.node_id.clone(), identity))
            .collect();

        let changed = members != self.members;
        if changed {
            self.suspected.retain(|id| members.contains_key(id));
            self.members = members;
        }
        changed
    }

    /// Record direct contact from a peer
    ///
    /// Returns true when the peer was unknown or suspected until now.
    pub fn observe(&mut self, identity: &NodeIdentity) -> bool {
        if identity.node_id == self.self_id {
            return false;
        }
        let recovered = self.suspected.remove(&identity.node_id);
        if recovered {
            tracing::info!("{} is reachable again", identity);
        }
        let unknown = self
            .members
            .insert(identity.node_id.clone(), identity.clone())
            .is_none();
        recovered || unknown
    }

    /// Mark a peer as presumed failed
    pub fn suspect(&mut self, node_id: &str) {
        if self.members.contains_key(node_id) && self.suspected.insert(node_id.to_string()) {
            tracing::warn!("Suspecting '{}' is down", node_id);
        }
    }

    /// Whether a peer is presumed failed
    pub fn is_suspected(&self, node_id: &str) -> bool {
        self.suspected.contains(node_id)
    }

    /// Unsuspected peers with rank strictly above `rank`
    pub fn higher_trusted_than(&self, rank: u64) -> Vec<NodeIdentity> {
        self.trusted().into_iter().filter(|m| m.rank > rank).collect()
    }

    /// All peers
    pub fn others(&self) -> Vec<NodeIdentity> {
        self.members.values().cloned().collect()
    }

    /// Peers not currently suspected
    pub fn trusted(&self) -> Vec<NodeIdentity> {
        self.members
            .values()
            .filter(|m| !self.suspected.contains(&m.node_id))
            .cloned()
            .collect()
    }

    /// Highest rank among trusted peers and the node itself
    pub fn highest_trusted_rank(&self, own_rank: u64) -> u64 {
        self.trusted().iter().map(|m| m.rank).fold(own_rank, u64::max)
    }

    /// Peers ordered by rank, highest first
    pub fn by_rank_desc(&self) -> Vec<NodeIdentity> {
        let mut peers = self.others();
        peers.sort_by(|a, b| b.rank.cmp(&a.rank));
        peers
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeIdentity> {
        self.members.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.members.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Peer listening at `address`
    pub fn by_address(&self, address: &str) -> Option<&NodeIdentity> {
        self.members.values().find(|m| m.address == address)
    }

    /// Ids of suspected peers
    pub fn suspected(&self) -> Vec<String> {
        self.suspected.iter().cloned().collect()
    }
}
