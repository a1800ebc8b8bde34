//! "Ask-user" question persistence (`spec.md` §4.6, invariant 9). A pending
//! question is one JSON file under `.questions/`, mutated in place as its
//! status transitions; a late answer (one that arrives after the asking
//! turn gave up waiting) is appended to its session's `late-answers.jsonl`
//! for the next `session.start`/`session.continue` to recover and delete.

use std::path::Path;

use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::question::PendingQuestion;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::layout;

pub fn save_question(root: &Path, question: &PendingQuestion) -> Result<(), StoreError> {
    let dir = layout::questions_dir(root);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(layout::question_path(root, &question.question_id), serde_json::to_vec_pretty(question)?)?;
    Ok(())
}

pub fn load_question(root: &Path, question_id: &Uuid) -> Result<Option<PendingQuestion>, StoreError> {
    match std::fs::read(layout::question_path(root, question_id)) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// One recovered answer, as it's replayed into a resumed session's prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LateAnswer {
    pub question: String,
    pub answer: String,
}

pub fn append_late_answer(root: &Path, agent_id: &AgentId, session_id: &SessionId, entry: &LateAnswer) -> Result<(), StoreError> {
    use std::io::Write;
    let path = layout::session_late_answers_path(root, agent_id, session_id)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Reads and removes the session's recovered answers in one step, per
/// `spec.md` invariant 9 ("the file is removed" once consumed).
pub fn take_late_answers(root: &Path, agent_id: &AgentId, session_id: &SessionId) -> Result<Vec<LateAnswer>, StoreError> {
    let path = layout::session_late_answers_path(root, agent_id, session_id)?;
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let entries = raw.lines().filter_map(|line| serde_json::from_str(line).ok()).collect();
    let _ = std::fs::remove_file(&path);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn round_trips_a_saved_question() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = AgentId::new("main").unwrap();
        let session_id = SessionId::new("main").unwrap();
        let question = PendingQuestion::new(agent_id, session_id, "ok?".to_string(), None, None, Utc::now());
        save_question(tmp.path(), &question).unwrap();
        let loaded = load_question(tmp.path(), &question.question_id).unwrap().unwrap();
        assert_eq!(loaded.question, "ok?");
    }

    #[test]
    fn late_answers_are_consumed_once() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = AgentId::new("main").unwrap();
        let session_id = SessionId::new("main").unwrap();
        append_late_answer(
            tmp.path(),
            &agent_id,
            &session_id,
            &LateAnswer {
                question: "deploy?".to_string(),
                answer: "yes".to_string(),
            },
        )
        .unwrap();
        let recovered = take_late_answers(tmp.path(), &agent_id, &session_id).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].answer, "yes");
        let empty = take_late_answers(tmp.path(), &agent_id, &session_id).unwrap();
        assert!(empty.is_empty());
    }
}
