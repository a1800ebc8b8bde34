//! Durable per-recipient JSONL files under `.messages/` (`spec.md` §6).
//!
//! Single-writer whole-file rewrite for `receive*`, as `spec.md` §9
//! acknowledges as a redesign candidate for a future append-only-journal
//! scheme; noted in `DESIGN.md`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fleetcore_core::encode::{agent_log_filename, session_log_filename};
use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::message::{Message, MessageStatus, RecipientMessage};
use serde_json::Value;

use crate::error::BrokerError;
use crate::types::HistoryOptions;

fn messages_dir(root: &Path) -> PathBuf {
    root.join(".messages")
}

pub fn agent_log_path(root: &Path, agent_id: &AgentId) -> PathBuf {
    messages_dir(root).join(agent_log_filename(agent_id.as_str()))
}

pub fn session_log_path(root: &Path, agent_id: &AgentId, session_id: &SessionId) -> PathBuf {
    messages_dir(root).join(session_log_filename(agent_id.as_str(), session_id.as_str()))
}

pub fn dead_letter_path(root: &Path) -> PathBuf {
    messages_dir(root).join("broker-unmatched.jsonl")
}

fn append_json_line(path: &Path, value: &impl serde::Serialize) -> Result<(), BrokerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(value)?)?;
    Ok(())
}

pub fn append_recipient_message(
    path: &Path,
    message: &RecipientMessage,
) -> Result<(), BrokerError> {
    append_json_line(path, message)
}

/// Malformed trailing lines are skipped, never fatal (`spec.md` §7 "Data
/// corruption").
fn read_all(path: &Path) -> Result<Vec<RecipientMessage>, BrokerError> {
    let raw = match fs::read_to_string(path) {
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

fn write_all(path: &Path, messages: &[RecipientMessage]) -> Result<(), BrokerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = String::new();
    for message in messages {
        body.push_str(&serde_json::to_string(message)?);
        body.push('\n');
    }
    fs::write(path, body)?;
    Ok(())
}

/// Flip every `pending` entry to `delivered`, rewrite the file, and return
/// the entries that were flipped (`spec.md` §4.2 `receive*`).
pub fn receive_pending(path: &Path) -> Result<Vec<RecipientMessage>, BrokerError> {
    let mut all = read_all(path)?;
    let mut delivered = Vec::new();
    for entry in all.iter_mut() {
        if entry.message.status == MessageStatus::Pending {
            entry.message.status = MessageStatus::Delivered;
            delivered.push(entry.clone());
        }
    }
    write_all(path, &all)?;
    Ok(delivered)
}

pub fn history(path: &Path, opts: &HistoryOptions) -> Result<Vec<RecipientMessage>, BrokerError> {
    let all = read_all(path)?;
    let in_range = |ts: DateTime<Utc>| {
        opts.from_time.is_none_or(|from| ts >= from) && opts.to_time.is_none_or(|to| ts <= to)
    };
    let mut filtered: Vec<RecipientMessage> = all
        .into_iter()
        .filter(|m| in_range(m.message.timestamp))
        .collect();
    if let Some(limit) = opts.limit {
        if filtered.len() > limit {
            filtered = filtered.split_off(filtered.len() - limit);
        }
    }
    Ok(filtered)
}

pub fn append_dead_letter(
    root: &Path,
    message: &Message,
    reason: &str,
) -> Result<(), BrokerError> {
    let entry = serde_json::json!({
        "message": message,
        "reason": reason,
    });
    append_json_line(&dead_letter_path(root), &entry)
}

pub fn get_unmatched(root: &Path) -> Result<Vec<Value>, BrokerError> {
    let path = dead_letter_path(root);
    let raw = match fs::read_to_string(&path) {
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

pub fn clear_unmatched(root: &Path) -> Result<(), BrokerError> {
    let path = dead_letter_path(root);
    if path.exists() {
        fs::write(path, "")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcore_types::ids::AgentId;
    use uuid::Uuid;

    fn sample(status: MessageStatus, ts: DateTime<Utc>) -> RecipientMessage {
        RecipientMessage {
            message: Message {
                id: Uuid::new_v4(),
                from: "main".to_string(),
                path: "agent/main".to_string(),
                command: "notify".to_string(),
                payload: serde_json::json!({}),
                status,
                timestamp: ts,
                source: Default::default(),
                external_id: None,
            },
            handled: None,
            handled_by: Vec::new(),
            delivered_to: Vec::new(),
        }
    }

    #[test]
    fn receive_flips_pending_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = AgentId::new("main").unwrap();
        let path = agent_log_path(tmp.path(), &agent_id);
        append_recipient_message(&path, &sample(MessageStatus::Pending, Utc::now())).unwrap();

        let delivered = receive_pending(&path).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message.status, MessageStatus::Delivered);

        let second_call = receive_pending(&path).unwrap();
        assert!(second_call.is_empty());
    }

    #[test]
    fn history_respects_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = AgentId::new("main").unwrap();
        let path = agent_log_path(tmp.path(), &agent_id);
        for _ in 0..5 {
            append_recipient_message(&path, &sample(MessageStatus::Delivered, Utc::now())).unwrap();
        }
        let opts = HistoryOptions {
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(history(&path, &opts).unwrap().len(), 2);
    }

    #[test]
    fn dead_letter_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let msg = sample(MessageStatus::Pending, Utc::now()).message;
        append_dead_letter(tmp.path(), &msg, "no_subscribers").unwrap();
        let entries = get_unmatched(tmp.path()).unwrap();
        assert_eq!(entries.len(), 1);
        clear_unmatched(tmp.path()).unwrap();
        assert!(get_unmatched(tmp.path()).unwrap().is_empty());
    }
}
