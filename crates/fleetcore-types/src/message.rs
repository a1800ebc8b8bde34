use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids::{AgentId, SessionId};

/// Delivery status of a routed message (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Read,
}

/// Open set of ingress origins. Known values are exposed as associated
/// constants; anything else round-trips as an opaque string, since
/// `spec.md` §3 lists the set as `{internal, slack, email, webhook,
/// heartbeat, …}` — extensible by ingress handlers this crate never sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageSource(pub String);

impl MessageSource {
    pub const INTERNAL: &'static str = "internal";
    pub const SLACK: &'static str = "slack";
    pub const EMAIL: &'static str = "email";
    pub const WEBHOOK: &'static str = "webhook";
    pub const HEARTBEAT: &'static str = "heartbeat";

    pub fn internal() -> Self {
        Self(Self::INTERNAL.to_string())
    }

    pub fn heartbeat() -> Self {
        Self(Self::HEARTBEAT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageSource {
    fn default() -> Self {
        Self::internal()
    }
}

/// Immutable-once-routed message record (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub from: String,
    pub path: String,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: MessageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// Which recipient table a persisted copy belongs to — only used to pick
/// the right file layout (`agent--…` vs `session--…--…`), never serialized
/// as part of the message itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientKind {
    Agent,
    Session,
}

/// One recipient's durable copy of a message (`spec.md` §3/§6): the base
/// message plus delivery bookkeeping that is *not* part of the immutable
/// record and may be rewritten in place (status) or is fixed at write time
/// (`handled`, `handled_by`, `_delivered_to`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientMessage {
    #[serde(flatten)]
    pub message: Message,
    /// Set on agent copies: true iff some session-level subscription of
    /// this agent also matched the routed path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handled_by: Vec<SessionRef>,
    /// Agent copies only: the full set of agent IDs this route delivered
    /// to, for audit (`spec.md` §6 message log line schema).
    #[serde(
        default,
        rename = "_deliveredTo",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub delivered_to: Vec<AgentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionRef {
    pub agent_id: AgentId,
    pub session_id: SessionId,
}
