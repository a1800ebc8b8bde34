//! Append-only per-session conversation logs (`spec.md` §3 "conversation
//! log", `<sid>.jsonl`). Each line is one JSON value; the file is never
//! rewritten, only appended to.

use std::fs::OpenOptions;
use std::io::Write;

use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::turn::ConversationLogLine;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::layout;

fn append_line(path: &std::path::Path, line: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Append any serializable value as one JSONL line. Used directly by the
/// control surface for recipient message fan-out mirroring into a
/// session's conversation log, separately from the typed auto-turn helper
/// below.
pub fn append_conversation_line<T: Serialize>(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
    value: &T,
) -> Result<(), StoreError> {
    let path = layout::session_log_path(root, agent_id, session_id)?;
    append_line(&path, &serde_json::to_string(value)?)
}

/// Append the marker line for a freshly-dispatched automatic turn
/// (`spec.md` §4.4 "Execution stage begins").
pub fn append_turn_marker(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
    message_ids: Vec<Uuid>,
) -> Result<(), StoreError> {
    append_conversation_line(
        root,
        agent_id,
        session_id,
        &ConversationLogLine::marker(message_ids),
    )
}

/// Append the result line once the LLM-CLI turn completes successfully.
pub fn append_turn_result(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
    message_ids: Vec<Uuid>,
    markdown: String,
    duration_ms: u64,
) -> Result<(), StoreError> {
    append_conversation_line(
        root,
        agent_id,
        session_id,
        &ConversationLogLine::result(message_ids, markdown, duration_ms),
    )
}

/// Append the error line when an automatic turn fails (timeout, adapter
/// crash, non-zero exit).
pub fn append_turn_error(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
    message_ids: Vec<Uuid>,
    error: String,
    duration_ms: u64,
) -> Result<(), StoreError> {
    append_conversation_line(
        root,
        agent_id,
        session_id,
        &ConversationLogLine::error(message_ids, error, duration_ms),
    )
}

/// Read back every line of a session's conversation log, in order.
/// Malformed trailing lines (a crash mid-`write`) are skipped rather than
/// failing the whole read.
pub fn read_conversation_log(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<Vec<ConversationLogLine>, StoreError> {
    let path = layout::session_log_path(root, agent_id, session_id)?;
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_turn_triple() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = AgentId::new("researcher").unwrap();
        let session_id = SessionId::main();
        let mid = Uuid::new_v4();

        append_turn_marker(tmp.path(), &agent_id, &session_id, vec![mid]).unwrap();
        append_turn_result(
            tmp.path(),
            &agent_id,
            &session_id,
            vec![mid],
            "done".to_string(),
            42,
        )
        .unwrap();

        let lines = read_conversation_log(tmp.path(), &agent_id, &session_id).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(matches!(lines[0], ConversationLogLine::AutoTurn { .. }));
        assert!(matches!(lines[1], ConversationLogLine::AutoTurnResult { .. }));
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = AgentId::new("researcher").unwrap();
        let lines = read_conversation_log(tmp.path(), &agent_id, &SessionId::main()).unwrap();
        assert!(lines.is_empty());
    }
}
