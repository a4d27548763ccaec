//! Node State Store
//!
//! The four replicated collections. Keyed sets (users, channels) keep the
//! lowest `(logical_clock, origin)` stamp when two origins create the same
//! name, so every node converges on the same element.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::replication::{Mutation, OpId, OperationRecord};
use crate::error::{Error, Result};

/// Where an element came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// Originating logical clock
    pub logical_clock: u64,
    /// Originating node
    pub origin: String,
    /// Origin's physical time
    pub timestamp: DateTime<Utc>,
}

impl Stamp {
    fn from_record(record: &OperationRecord) -> Self {
        Self {
            logical_clock: record.logical_clock,
            origin: record.op_id.origin.clone(),
            timestamp: record.applied_at,
        }
    }

    fn precedes(&self, other: &Stamp) -> bool {
        (self.logical_clock, &self.origin) < (other.logical_clock, &other.origin)
    }
}

/// A private message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub op_id: OpId,
    pub src: String,
    pub dst: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A channel publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub op_id: OpId,
    pub channel: String,
    pub user: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Users, channels, messages and publications
///
/// Messages and publications are kept sorted by operation id, which makes
/// re-insertion a no-op and gives every node the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedDataset {
    users: BTreeMap<String, Stamp>,
    channels: BTreeMap<String, Stamp>,
    messages: Vec<MessageEntry>,
    publications: Vec<Publication>,
}

impl ReplicatedDataset {
    /// Check a client mutation against the local state
    pub fn validate(&self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::CreateUser { name } => {
                require("user", name)?;
                if self.users.contains_key(name) {
                    return Err(Error::DuplicateRegistration(format!("user '{}'", name)));
                }
            }
            Mutation::CreateChannel { name } => {
                require("channel", name)?;
                if self.channels.contains_key(name) {
                    return Err(Error::DuplicateRegistration(format!("channel '{}'", name)));
                }
            }
            Mutation::SendMessage { dst, message, .. } => {
                require("dst", dst)?;
                require("message", message)?;
                if !self.users.contains_key(dst) {
                    return Err(Error::NotFound(format!("user '{}'", dst)));
                }
            }
            Mutation::Publish { channel, message, .. } => {
                require("channel", channel)?;
                require("message", message)?;
                if !self.channels.contains_key(channel) {
                    return Err(Error::NotFound(format!("channel '{}'", channel)));
                }
            }
        }
        Ok(())
    }

    /// Apply a record; returns false when it changed nothing
    ///
    /// No validation happens here: the origin already accepted the
    /// operation, and replicas must follow it.
    pub fn apply(&mut self, record: &OperationRecord) -> bool {
        match &record.mutation {
            Mutation::CreateUser { name } => {
                insert_keyed(&mut self.users, name, Stamp::from_record(record))
            }
            Mutation::CreateChannel { name } => {
                insert_keyed(&mut self.channels, name, Stamp::from_record(record))
            }
            Mutation::SendMessage { src, dst, message } => insert_sorted(
                &mut self.messages,
                MessageEntry {
                    op_id: record.op_id.clone(),
                    src: src.clone(),
                    dst: dst.clone(),
                    message: message.clone(),
                    timestamp: record.applied_at,
                },
                |m| &m.op_id,
            ),
            Mutation::Publish { channel, user, message } => insert_sorted(
                &mut self.publications,
                Publication {
                    op_id: record.op_id.clone(),
                    channel: channel.clone(),
                    user: user.clone(),
                    message: message.clone(),
                    timestamp: record.applied_at,
                },
                |p| &p.op_id,
            ),
        }
    }

    /// Union another dataset into this one
    pub fn merge(&mut self, other: &ReplicatedDataset) {
        for (name, stamp) in &other.users {
            insert_keyed(&mut self.users, name, stamp.clone());
        }
        for (name, stamp) in &other.channels {
            insert_keyed(&mut self.channels, name, stamp.clone());
        }
        for entry in &other.messages {
            insert_sorted(&mut self.messages, entry.clone(), |m| &m.op_id);
        }
        for publication in &other.publications {
            insert_sorted(&mut self.publications, publication.clone(), |p| &p.op_id);
        }
    }

    /// User names in creation order
    pub fn users(&self) -> Vec<String> {
        by_stamp(&self.users)
    }

    /// Channel names in creation order
    pub fn channels(&self) -> Vec<String> {
        by_stamp(&self.channels)
    }

    /// Stamp of one user
    pub fn user(&self, name: &str) -> Option<&Stamp> {
        self.users.get(name)
    }

    /// Stamp of one channel
    pub fn channel(&self, name: &str) -> Option<&Stamp> {
        self.channels.get(name)
    }

    /// Login audit: every user creation with its origin time
    pub fn logins(&self) -> Vec<PersistedLogin> {
        by_stamp(&self.users)
            .into_iter()
            .filter_map(|user| {
                self.users.get(&user).map(|stamp| PersistedLogin {
                    logical_clock: stamp.logical_clock,
                    timestamp: stamp.timestamp,
                    user,
                })
            })
            .collect()
    }

    pub fn messages(&self) -> &[MessageEntry] {
        &self.messages
    }

    pub fn publications(&self) -> &[Publication] {
        &self.publications
    }

    /// Export in the persisted/reporting shape
    pub fn export(&self) -> PersistedState {
        PersistedState {
            users: self.users(),
            channels: self.channels(),
            logins: self.logins(),
            messages: self
                .messages
                .iter()
                .map(|m| PersistedMessage {
                    src: m.src.clone(),
                    dst: m.dst.clone(),
                    message: m.message.clone(),
                    logical_clock: m.op_id.clock,
                    timestamp: m.timestamp,
                })
                .collect(),
            publications: self
                .publications
                .iter()
                .map(|p| PersistedPublication {
                    channel: p.channel.clone(),
                    user: p.user.clone(),
                    message: p.message.clone(),
                    logical_clock: p.op_id.clock,
                    timestamp: p.timestamp,
                })
                .collect(),
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("'{}' is required", field)));
    }
    Ok(())
}

fn insert_keyed(set: &mut BTreeMap<String, Stamp>, name: &str, stamp: Stamp) -> bool {
    match set.get_mut(name) {
        Some(existing) => {
            if !stamp.precedes(existing) {
                return false;
            }
            tracing::debug!(
                "'{}' created concurrently by {} and {}, keeping {}",
                name,
                existing.origin,
                stamp.origin,
                stamp.origin
            );
            *existing = stamp;
            true
        }
        None => {
            set.insert(name.to_string(), stamp);
            true
        }
    }
}

fn insert_sorted<T>(items: &mut Vec<T>, item: T, key: impl Fn(&T) -> &OpId) -> bool {
    match items.binary_search_by(|existing| key(existing).cmp(key(&item))) {
        Ok(_) => false,
        Err(pos) => {
            items.insert(pos, item);
            true
        }
    }
}

fn by_stamp(set: &BTreeMap<String, Stamp>) -> Vec<String> {
    let mut names: Vec<(&String, &Stamp)> = set.iter().collect();
    names.sort_by(|a, b| (a.1.logical_clock, &a.1.origin).cmp(&(b.1.logical_clock, &b.1.origin)));
    names.into_iter().map(|(name, _)| name.clone()).collect()
}

/// Reporting shape of the dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub users: Vec<String>,
    pub channels: Vec<String>,
    pub logins: Vec<PersistedLogin>,
    pub messages: Vec<PersistedMessage>,
    pub publications: Vec<PersistedPublication>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedLogin {
    pub user: String,
    pub logical_clock: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub src: String,
    pub dst: String,
    pub message: String,
    pub logical_clock: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPublication {
    pub channel: String,
    pub user: String,
    pub message: String,
    pub logical_clock: u64,
    pub timestamp: DateTime<Utc>,
}
