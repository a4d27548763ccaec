//! Client Contract
//!
//! Request/response shapes of the client-facing services, the typed
//! service calls they parse into, and the fan-out deliveries emitted by the
//! origin node.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::registry::NodeIdentity;
use crate::replication::{Mutation, OperationRecord};
use crate::state::ElectionState;
use crate::error::{Error, Result};

/// Incoming client request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    /// Service name (`login`, `users`, `channel`, ...)
    pub service: String,
    /// Service arguments
    #[serde(default)]
    pub payload: Value,
    /// Client's logical clock
    #[serde(default)]
    pub logical_clock: u64,
}

impl ClientRequest {
    /// Build a request
    pub fn new(service: impl Into<String>, payload: Value, logical_clock: u64) -> Self {
        Self {
            service: service.into(),
            payload,
            logical_clock,
        }
    }
}

/// Outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Answer to a client request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse {
    /// Echo of the request's service
    pub service: String,
    /// ok or error
    pub status: ResponseStatus,
    /// Service result, or `{code, description}` on error
    pub payload: Value,
    /// Node's logical clock after answering
    pub logical_clock: u64,
}

impl ClientResponse {
    /// Successful response
    pub fn ok(service: &str, payload: Value, logical_clock: u64) -> Self {
        Self {
            service: service.to_string(),
            status: ResponseStatus::Ok,
            payload,
            logical_clock,
        }
    }

    /// Error response carrying the error's code and message
    pub fn error(service: &str, error: &Error, logical_clock: u64) -> Self {
        Self {
            service: service.to_string(),
            status: ResponseStatus::Error,
            payload: json!({
                "code": error.code(),
                "description": error.to_string(),
            }),
            logical_clock,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Error code of a failed response
    pub fn error_code(&self) -> Option<&str> {
        match self.status {
            ResponseStatus::Ok => None,
            ResponseStatus::Error => self.payload.get("code").and_then(Value::as_str),
        }
    }
}

#[derive(Deserialize)]
struct LoginArgs {
    user: String,
}

#[derive(Deserialize)]
struct ChannelArgs {
    channel: String,
}

#[derive(Deserialize)]
struct PublishArgs {
    #[serde(default)]
    user: String,
    channel: String,
    message: String,
}

#[derive(Deserialize)]
struct MessageArgs {
    #[serde(default)]
    src: String,
    dst: String,
    message: String,
}

/// A parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    Login { user: String },
    Users,
    Channel { channel: String },
    Channels,
    Publish { user: String, channel: String, message: String },
    Message { src: String, dst: String, message: String },
    WhoCoordinator,
}

impl ServiceCall {
    /// Parse a request's service name and payload
    pub fn parse(request: &ClientRequest) -> Result<Self> {
        let call = match request.service.as_str() {
            "login" => {
                let args: LoginArgs = args(&request.payload)?;
                ServiceCall::Login { user: args.user }
            }
            "users" => ServiceCall::Users,
            "channel" => {
                let args: ChannelArgs = args(&request.payload)?;
                ServiceCall::Channel { channel: args.channel }
            }
            "channels" => ServiceCall::Channels,
            "publish" => {
                let args: PublishArgs = args(&request.payload)?;
                ServiceCall::Publish {
                    user: args.user,
                    channel: args.channel,
                    message: args.message,
                }
            }
            "message" => {
                let args: MessageArgs = args(&request.payload)?;
                ServiceCall::Message {
                    src: args.src,
                    dst: args.dst,
                    message: args.message,
                }
            }
            "who_coordinator" => ServiceCall::WhoCoordinator,
            other => return Err(Error::UnknownService(other.to_string())),
        };
        Ok(call)
    }

    /// Mutation for write services, `None` for reads
    pub fn into_mutation(self) -> Option<Mutation> {
        match self {
            ServiceCall::Login { user } => Some(Mutation::CreateUser { name: user }),
            ServiceCall::Channel { channel } => Some(Mutation::CreateChannel { name: channel }),
            ServiceCall::Publish { user, channel, message } => {
                Some(Mutation::Publish { channel, user, message })
            }
            ServiceCall::Message { src, dst, message } => {
                Some(Mutation::SendMessage { src, dst, message })
            }
            ServiceCall::Users | ServiceCall::Channels | ServiceCall::WhoCoordinator => None,
        }
    }
}

fn args<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| Error::InvalidRequest(e.to_string()))
}

/// Message handed to the publish/subscribe fan-out layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delivery {
    /// Publication on a channel's topic
    Publication {
        channel: String,
        user: String,
        message: String,
        #[serde(rename = "logicalClock")]
        logical_clock: u64,
        timestamp: DateTime<Utc>,
    },
    /// Private message on the recipient's topic
    Private {
        src: String,
        dst: String,
        message: String,
        #[serde(rename = "logicalClock")]
        logical_clock: u64,
        timestamp: DateTime<Utc>,
    },
}

impl Delivery {
    /// Topic the fan-out layer publishes on
    pub fn topic(&self) -> &str {
        match self {
            Delivery::Publication { channel, .. } => channel,
            Delivery::Private { dst, .. } => dst,
        }
    }

    /// Delivery owed for a record, if its kind fans out
    pub fn for_record(record: &OperationRecord) -> Option<Self> {
        match &record.mutation {
            Mutation::Publish { channel, user, message } => Some(Delivery::Publication {
                channel: channel.clone(),
                user: user.clone(),
                message: message.clone(),
                logical_clock: record.logical_clock,
                timestamp: record.applied_at,
            }),
            Mutation::SendMessage { src, dst, message } => Some(Delivery::Private {
                src: src.clone(),
                dst: dst.clone(),
                message: message.clone(),
                logical_clock: record.logical_clock,
                timestamp: record.applied_at,
            }),
            Mutation::CreateUser { .. } | Mutation::CreateChannel { .. } => None,
        }
    }
}

/// Snapshot of a node's coordination state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub rank: u64,
    pub address: String,
    pub state: ElectionState,
    pub coordinator: Option<NodeIdentity>,
    pub logical_clock: u64,
    pub physical_time: DateTime<Utc>,
    pub physical_offset_ms: i64,
    /// Bootstrap sync finished
    pub ready: bool,
    pub users: usize,
    pub channels: usize,
    pub messages: usize,
    pub publications: usize,
    /// Operations applied (local and remote)
    pub operations: usize,
    pub elections_started: u64,
    pub sync_rounds: u64,
    pub peers: Vec<NodeIdentity>,
    pub suspected: Vec<String>,
}
