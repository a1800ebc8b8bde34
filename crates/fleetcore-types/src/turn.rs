use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The auto-turn record triple appended to a session's conversation log on
/// every automatic turn (`spec.md` §3 "Auto-turn record"): a system marker,
/// then exactly one of a result or an error line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConversationLogLine {
    AutoTurn {
        message_ids: Vec<Uuid>,
    },
    AutoTurnResult {
        message_ids: Vec<Uuid>,
        markdown: String,
        duration_ms: u64,
    },
    AutoTurnError {
        message_ids: Vec<Uuid>,
        error: String,
        duration_ms: u64,
    },
}

impl ConversationLogLine {
    pub fn marker(message_ids: Vec<Uuid>) -> Self {
        ConversationLogLine::AutoTurn { message_ids }
    }

    pub fn result(message_ids: Vec<Uuid>, markdown: String, duration_ms: u64) -> Self {
        ConversationLogLine::AutoTurnResult {
            message_ids,
            markdown,
            duration_ms,
        }
    }

    pub fn error(message_ids: Vec<Uuid>, error: String, duration_ms: u64) -> Self {
        ConversationLogLine::AutoTurnError {
            message_ids,
            error,
            duration_ms,
        }
    }
}
