//! The "ask-user" callback tools call through (`spec.md` §4.6/§4.7,
//! invariant 9): mint a question, persist it, broadcast it to every
//! connected control-surface client, and wait up to five minutes for a
//! reply. A reply that arrives after the wait gives up is salvaged into
//! the session's late-answers file instead of lost, for the next turn on
//! that session to recover.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use fleetcore_store::questions::{self, LateAnswer};
use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::question::{PendingQuestion, QuestionStatus};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

const ASK_USER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A frame pushed to every authenticated control-surface client.
pub type Broadcast = Value;

#[derive(Default)]
struct PendingState {
    waiters: HashMap<Uuid, oneshot::Sender<String>>,
}

/// Shared across every connection the control surface serves — one
/// question is visible to (and answerable by) any authenticated client,
/// not just the one whose turn asked it.
pub struct AskUserHandle {
    project_root: PathBuf,
    state: Mutex<PendingState>,
    clients: Mutex<Vec<mpsc::UnboundedSender<Broadcast>>>,
}

impl AskUserHandle {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            state: Mutex::new(PendingState::default()),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Adds a connection's outbound sender to the broadcast fan-out. The
    /// caller is responsible for dropping its own sender (or letting the
    /// `send` failures below prune it) when the connection closes.
    pub async fn register_client(&self, outbound: mpsc::UnboundedSender<Broadcast>) {
        self.clients.lock().await.push(outbound);
    }

    async fn broadcast(&self, frame: Broadcast) {
        let mut clients = self.clients.lock().await;
        clients.retain(|tx| tx.send(frame.clone()).is_ok());
    }

    /// Returns `None` on timeout. The question's index entry is left
    /// `timed_out`, not deleted, so a late `answer()` can still salvage it.
    pub async fn ask(
        &self,
        agent_id: AgentId,
        session_id: SessionId,
        question: String,
        options: Option<Vec<String>>,
        context: Option<Value>,
    ) -> Option<String> {
        let pending = PendingQuestion::new(agent_id, session_id, question, options, context, Utc::now());
        let question_id = pending.question_id;
        if questions::save_question(&self.project_root, &pending).is_err() {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        self.state.lock().await.waiters.insert(question_id, tx);

        self.broadcast(serde_json::json!({
            "type": "ask-user",
            "questionId": pending.question_id,
            "agentId": pending.agent_id.to_string(),
            "sessionId": pending.session_id.to_string(),
            "question": pending.question,
            "options": pending.options,
            "context": pending.context,
        }))
        .await;

        match tokio::time::timeout(ASK_USER_TIMEOUT, rx).await {
            Ok(Ok(answer)) => {
                let mut resolved = pending;
                resolved.status = QuestionStatus::Answered;
                resolved.answered_at = Some(Utc::now());
                let _ = questions::save_question(&self.project_root, &resolved);
                Some(answer)
            }
            _ => {
                self.state.lock().await.waiters.remove(&question_id);
                let mut timed_out = pending;
                timed_out.status = QuestionStatus::TimedOut;
                let _ = questions::save_question(&self.project_root, &timed_out);
                None
            }
        }
    }

    /// Resolves a waiting `ask()` call, or — if its asker already gave up —
    /// salvages the answer into the question's session late-answers file.
    pub async fn answer(&self, question_id: Uuid, answer: String) {
        if let Some(tx) = self.state.lock().await.waiters.remove(&question_id) {
            let _ = tx.send(answer);
            return;
        }
        let Ok(Some(mut question)) = questions::load_question(&self.project_root, &question_id) else {
            return;
        };
        if question.status != QuestionStatus::TimedOut {
            return;
        }
        question.status = QuestionStatus::AnsweredLate;
        question.answered_at = Some(Utc::now());
        let _ = questions::append_late_answer(
            &self.project_root,
            &question.agent_id,
            &question.session_id,
            &LateAnswer {
                question: question.question.clone(),
                answer,
            },
        );
        let _ = questions::save_question(&self.project_root, &question);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_resolves_a_waiting_ask() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = std::sync::Arc::new(AskUserHandle::new(tmp.path()));
        let agent_id = AgentId::new("main").unwrap();
        let session_id = SessionId::new("main").unwrap();

        let asker = {
            let handle = handle.clone();
            let agent_id = agent_id.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { handle.ask(agent_id, session_id, "deploy?".to_string(), None, None).await })
        };

        // give the asker task a chance to register before we answer it
        let question_id = loop {
            if let Some(id) = handle.state.lock().await.waiters.keys().next().copied() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        handle.answer(question_id, "yes".to_string()).await;

        assert_eq!(asker.await.unwrap(), Some("yes".to_string()));
    }

    #[tokio::test]
    async fn late_answer_is_salvaged_after_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = AskUserHandle::new(tmp.path());
        let agent_id = AgentId::new("main").unwrap();
        let session_id = SessionId::new("main").unwrap();
        let pending = PendingQuestion::new(agent_id.clone(), session_id.clone(), "q?".to_string(), None, None, Utc::now());
        let mut timed_out = pending.clone();
        timed_out.status = QuestionStatus::TimedOut;
        questions::save_question(tmp.path(), &timed_out).unwrap();

        handle.answer(pending.question_id, "late yes".to_string()).await;

        let saved = questions::load_question(tmp.path(), &pending.question_id).unwrap().unwrap();
        assert_eq!(saved.status, QuestionStatus::AnsweredLate);
        let recovered = questions::take_late_answers(tmp.path(), &agent_id, &session_id).unwrap();
        assert_eq!(recovered[0].answer, "late yes");
    }
}
