use chrono::{DateTime, Utc};
use fleetcore_types::ids::AgentId;
use fleetcore_types::message::{MessageSource, SessionRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arguments to `route()`/`send()`/`broadcast()` (`spec.md` §4.2).
#[derive(Debug, Clone, Default)]
pub struct RouteInput {
    pub command: String,
    pub payload: Value,
    pub source: Option<MessageSource>,
    pub external_id: Option<String>,
}

/// The outcome of one `route()` call (`spec.md` §4.2 steps 4-6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RouteResult {
    pub delivered: bool,
    pub unmatched: bool,
    pub delivered_to: Vec<AgentId>,
    pub delivered_to_sessions: Vec<SessionRef>,
}

/// Filters accepted by `history`/`sessionHistory` (`spec.md` §4.2).
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    pub limit: Option<usize>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
}

pub(crate) fn auto_subscription_pattern(agent_id: &AgentId) -> String {
    format!("agent/{agent_id}")
}
