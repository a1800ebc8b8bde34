use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids::{AgentId, SessionId};

/// Terminal/non-terminal states of an "ask-user" round trip (`spec.md` §3).
/// Transitions are monotonic: `pending -> {answered, answered_late, timed_out}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Pending,
    Answered,
    AnsweredLate,
    TimedOut,
}

/// An "ask-user" request (`spec.md` §3/§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub question_id: Uuid,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub status: QuestionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

impl PendingQuestion {
    pub fn new(
        agent_id: AgentId,
        session_id: SessionId,
        question: String,
        options: Option<Vec<String>>,
        context: Option<Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            question_id: Uuid::new_v4(),
            agent_id,
            session_id,
            question,
            options,
            context,
            status: QuestionStatus::Pending,
            created_at: now,
            answered_at: None,
        }
    }
}
