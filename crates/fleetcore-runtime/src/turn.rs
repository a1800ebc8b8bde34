//! The turn manager (`spec.md` §4.4): debounces deliveries per
//! `(agentId, sessionId)`, serializes at most one turn in flight per key,
//! and drives a two-stage triage/execution pipeline against the LLM-CLI.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use fleetcore_broker::{Broker, RouteResult};
use fleetcore_llmcli::{CliAdapter, TriageClient, TriageVerdict, TurnRequest};
use fleetcore_store::{conversation, memory, session, AgentStore};
use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::message::{MessageSource, RecipientMessage, SessionRef};
use serde_json::Value;

use crate::autorun::{self, EffectiveAutoRun};

/// Running counters surfaced for tests and, eventually, a status tool
/// (`spec.md` §8 testable properties 6-8).
#[derive(Debug, Default)]
pub struct TurnStats {
    pub triage_count: AtomicU64,
    pub triage_accepted: AtomicU64,
    pub triage_rejected: AtomicU64,
    pub triage_errors: AtomicU64,
    pub turns_executed: AtomicU64,
    pub turns_failed: AtomicU64,
}

struct DebounceEntry {
    generation: u64,
    count: usize,
}

struct Scheduling {
    debounce: HashMap<SessionRef, DebounceEntry>,
    active: HashSet<SessionRef>,
    needs_rerun: HashSet<SessionRef>,
}

impl Scheduling {
    fn new() -> Self {
        Self {
            debounce: HashMap::new(),
            active: HashSet::new(),
            needs_rerun: HashSet::new(),
        }
    }
}

pub struct TurnManager {
    store: AgentStore,
    broker: Arc<Broker>,
    adapter: CliAdapter,
    triage_client: Option<TriageClient>,
    scheduling: StdMutex<Scheduling>,
    stats: TurnStats,
}

impl TurnManager {
    pub fn new(store: AgentStore, broker: Arc<Broker>, adapter: CliAdapter, triage_client: Option<TriageClient>) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            adapter,
            triage_client,
            scheduling: StdMutex::new(Scheduling::new()),
            stats: TurnStats::default(),
        })
    }

    pub fn stats(&self) -> &TurnStats {
        &self.stats
    }

    /// Registers this manager as a `Broker::on_route` observer. Call once
    /// at startup after both the broker and the manager exist.
    pub async fn install(self: &Arc<Self>, broker: &Broker) {
        let manager = self.clone();
        broker
            .on_route(move |result: &RouteResult| {
                manager.on_route_result(result);
            })
            .await;
    }

    /// Keys touched by one `route()` call: every matched session directly,
    /// plus every matched agent with no session-level match attributed to
    /// that agent's `main` session (`spec.md` §4.4 "agent-only deliveries").
    fn on_route_result(self: &Arc<Self>, result: &RouteResult) {
        if !result.delivered {
            return;
        }
        let mut keys: Vec<SessionRef> = result.delivered_to_sessions.clone();
        for agent_id in &result.delivered_to {
            let handled = result.delivered_to_sessions.iter().any(|s| &s.agent_id == agent_id);
            if !handled {
                keys.push(SessionRef {
                    agent_id: agent_id.clone(),
                    session_id: SessionId::main(),
                });
            }
        }
        for key in keys {
            self.enqueue(key);
        }
    }

    fn enqueue(self: &Arc<Self>, key: SessionRef) {
        let Ok(agent) = self.store.get_agent(&key.agent_id) else {
            return;
        };
        let Ok(session_meta) = session::get_session(self.store.root(), &key.agent_id, &key.session_id) else {
            return;
        };
        let effective = autorun::resolve(&agent, &session_meta);
        if !effective.enabled {
            return;
        }

        let generation = {
            let mut scheduling = self.scheduling.lock().unwrap();
            let entry = scheduling.debounce.entry(key.clone()).or_insert(DebounceEntry {
                generation: 0,
                count: 0,
            });
            entry.generation += 1;
            entry.count += 1;
            if entry.count >= effective.max_batch_size {
                entry.count = 0;
                None
            } else {
                Some(entry.generation)
            }
        };

        let manager = self.clone();
        match generation {
            None => {
                tokio::spawn(async move {
                    manager.maybe_flush(key).await;
                });
            }
            Some(generation) => {
                let debounce_ms = effective.debounce_ms;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
                    let fires = {
                        let scheduling = manager.scheduling.lock().unwrap();
                        scheduling
                            .debounce
                            .get(&key)
                            .map(|e| e.generation == generation)
                            .unwrap_or(false)
                    };
                    if fires {
                        manager.maybe_flush(key).await;
                    }
                });
            }
        }
    }

    /// Runs the key's turn unless one is already active, in which case the
    /// delivery is folded into the rerun flag and picked up once the
    /// active turn finishes (`spec.md` §4.4 "rerun buffer").
    async fn maybe_flush(self: &Arc<Self>, key: SessionRef) {
        let should_run = {
            let mut scheduling = self.scheduling.lock().unwrap();
            scheduling.debounce.remove(&key);
            if scheduling.active.contains(&key) {
                scheduling.needs_rerun.insert(key.clone());
                false
            } else {
                scheduling.active.insert(key.clone());
                true
            }
        };
        if !should_run {
            return;
        }

        self.run_turn(&key, false).await;

        let rerun = {
            let mut scheduling = self.scheduling.lock().unwrap();
            scheduling.active.remove(&key);
            scheduling.needs_rerun.remove(&key)
        };
        if rerun {
            let manager = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                manager.maybe_flush(key).await;
            });
        }
    }

    /// Manual-trigger path (`spec.md` §4.4 `triggerTurn`): bypasses triage
    /// but still respects the one-turn-per-key guard.
    pub async fn trigger_turn(self: &Arc<Self>, agent_id: &AgentId, session_id: &SessionId) {
        let key = SessionRef {
            agent_id: agent_id.clone(),
            session_id: session_id.clone(),
        };
        let should_run = {
            let mut scheduling = self.scheduling.lock().unwrap();
            if scheduling.active.contains(&key) {
                scheduling.needs_rerun.insert(key.clone());
                false
            } else {
                scheduling.active.insert(key.clone());
                true
            }
        };
        if !should_run {
            return;
        }
        self.run_turn(&key, true).await;
        let mut scheduling = self.scheduling.lock().unwrap();
        scheduling.active.remove(&key);
    }

    async fn run_turn(&self, key: &SessionRef, skip_triage: bool) {
        let mut messages = match self.broker.receive_session(&key.agent_id, &key.session_id) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("turn manager: failed reading pending messages for {key:?}: {e}");
                return;
            }
        };
        // Direct `send`/`broadcast`/agent-custom-subscription deliveries and
        // heartbeats are persisted to the agent log, not any session log
        // (`broker::route`). `on_route_result` attributes them to this same
        // agent's `main` session when no session subscription also matched,
        // so draining only the session log would silently drop them here
        // (`spec.md` §4.4 "attribute the turn to that agent's main session").
        if key.session_id.is_main() {
            match self.broker.receive(&key.agent_id) {
                Ok(agent_messages) => messages.extend(agent_messages),
                Err(e) => {
                    log::warn!("turn manager: failed reading pending agent messages for {key:?}: {e}");
                    return;
                }
            }
        }
        if messages.is_empty() {
            return;
        }

        let Ok(agent) = self.store.get_agent(&key.agent_id) else {
            return;
        };
        let Ok(session_meta) = session::get_session(self.store.root(), &key.agent_id, &key.session_id) else {
            return;
        };
        let effective = autorun::resolve(&agent, &session_meta);
        let is_singleton_heartbeat = messages.len() == 1
            && messages[0].message.source.as_str() == MessageSource::HEARTBEAT;

        if !skip_triage && !is_singleton_heartbeat {
            let accepted = self.triage(key, &agent, &session_meta, &effective, &messages).await;
            if !accepted {
                return;
            }
        }

        self.execute(key, &agent, &session_meta, &effective, &messages, is_singleton_heartbeat)
            .await;
    }

    async fn triage(
        &self,
        key: &SessionRef,
        agent: &fleetcore_types::agent::AgentConfig,
        session_meta: &fleetcore_types::session::SessionMeta,
        effective: &EffectiveAutoRun,
        messages: &[RecipientMessage],
    ) -> bool {
        self.stats.triage_count.fetch_add(1, Ordering::Relaxed);
        let prompt = triage_prompt(&key.agent_id, agent, &key.session_id, messages);
        let model = effective.triage_model(session_meta, agent);
        let timeout = Duration::from_millis(effective.triage_timeout_ms);

        // Any failure here (timeout, non-zero exit, bad response shape)
        // defaults to acceptance (`spec.md` §4.4 "fail open").
        let verdict: Option<TriageVerdict> = if let Some(client) = &self.triage_client {
            tokio::time::timeout(timeout, client.triage(&prompt, model))
                .await
                .ok()
                .and_then(Result::ok)
        } else {
            let mut req = TurnRequest::new(prompt, timeout);
            req.no_session_persistence = true;
            tokio::time::timeout(timeout, self.adapter.query(&req))
                .await
                .ok()
                .and_then(Result::ok)
                .map(|result| {
                    let first_line = result.lines().next().unwrap_or("").trim();
                    if first_line.starts_with("NO") {
                        TriageVerdict::Reject
                    } else {
                        TriageVerdict::Accept
                    }
                })
        };

        match verdict {
            Some(TriageVerdict::Accept) => {
                self.stats.triage_accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(TriageVerdict::Reject) => {
                self.stats.triage_rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => {
                self.stats.triage_errors.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    async fn execute(
        &self,
        key: &SessionRef,
        agent: &fleetcore_types::agent::AgentConfig,
        session_meta: &fleetcore_types::session::SessionMeta,
        effective: &EffectiveAutoRun,
        messages: &[RecipientMessage],
        is_singleton_heartbeat: bool,
    ) {
        let message_ids: Vec<uuid::Uuid> = messages.iter().map(|m| m.message.id).collect();
        let root = self.store.root().to_path_buf();
        if let Err(e) = conversation::append_turn_marker(&root, &key.agent_id, &key.session_id, message_ids.clone()) {
            log::warn!("turn manager: failed to append turn marker: {e}");
        }

        let prompt = if is_singleton_heartbeat {
            heartbeat_prompt(&key.agent_id, agent)
        } else {
            execution_prompt(messages)
        };
        let system_prompt = memory::assemble_system_prompt(&root, &key.agent_id, &key.session_id).unwrap_or_default();
        let additional_dirs = additional_dirs(&root, &key.agent_id, &key.session_id, agent, session_meta);

        let mut req = TurnRequest::new(prompt, Duration::from_millis(effective.execution_timeout_ms));
        req.system_prompt = Some(system_prompt);
        req.resume_session_id = Some(key.session_id.as_str().to_string());
        req.additional_dirs = additional_dirs;

        let start = std::time::Instant::now();
        let outcome = self.adapter.run_streaming(&req, |_event| {}).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(outcome) => {
                self.stats.turns_executed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = conversation::append_turn_result(
                    &root,
                    &key.agent_id,
                    &key.session_id,
                    message_ids,
                    outcome.markdown,
                    duration_ms,
                ) {
                    log::warn!("turn manager: failed to append turn result: {e}");
                }
            }
            Err(e) => {
                self.stats.turns_failed.fetch_add(1, Ordering::Relaxed);
                if let Err(log_err) =
                    conversation::append_turn_error(&root, &key.agent_id, &key.session_id, message_ids, e.to_string(), duration_ms)
                {
                    log::warn!("turn manager: failed to append turn error: {log_err}");
                }
            }
        }

        let mut meta = session_meta.clone();
        meta.touch(chrono::Utc::now());
        if let Err(e) = session::save_session(&root, &key.agent_id, &meta) {
            log::warn!("turn manager: failed to touch session: {e}");
        }
    }
}

fn summarize_payload(payload: &Value) -> String {
    serde_json::to_string(payload).unwrap_or_default()
}

fn triage_prompt(
    agent_id: &AgentId,
    agent: &fleetcore_types::agent::AgentConfig,
    session_id: &SessionId,
    messages: &[RecipientMessage],
) -> String {
    let mut body = format!(
        "Agent: {agent_id}\nDescription: {}\nSession: {session_id}\nPending messages:\n",
        agent.description
    );
    for m in messages {
        body.push_str(&format!(
            "- from={} command={} payload={}\n",
            m.message.from,
            m.message.command,
            summarize_payload(&m.message.payload)
        ));
    }
    body.push_str("\nShould this agent act on these messages now? Reply YES or NO on the first line.");
    body
}

fn execution_prompt(messages: &[RecipientMessage]) -> String {
    let mut body = String::from("New messages:\n");
    for m in messages {
        body.push_str(&format!(
            "- from={} command={} payload={}\n",
            m.message.from,
            m.message.command,
            summarize_payload(&m.message.payload)
        ));
    }
    body
}

fn heartbeat_prompt(agent_id: &AgentId, agent: &fleetcore_types::agent::AgentConfig) -> String {
    format!(
        "Scheduled heartbeat fired for {agent_id} ({}). Review your responsibilities and act if anything needs attention.",
        agent.description
    )
}

fn additional_dirs(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
    agent: &fleetcore_types::agent::AgentConfig,
    session_meta: &fleetcore_types::session::SessionMeta,
) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(dir) = fleetcore_store::layout::session_workspace_dir(root, agent_id, session_id) {
        dirs.push(dir);
    }
    if let Ok(dir) = fleetcore_store::layout::agent_workspace_dir(root, agent_id) {
        dirs.push(dir);
    }
    dirs.extend(agent.work_directories.clone());
    dirs.extend(session_meta.work_directories.clone());
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcore_store::AgentCreateOptions;

    fn make_store_without_autorun(tmp: &std::path::Path, agent_id: &AgentId) -> AgentStore {
        let store = AgentStore::new(tmp);
        store.create_agent(agent_id, AgentCreateOptions::default()).ok();
        store
    }

    #[test]
    fn debounce_entry_increments_generation() {
        let mut entry = DebounceEntry { generation: 0, count: 0 };
        entry.generation += 1;
        entry.count += 1;
        assert_eq!(entry.generation, 1);
        assert_eq!(entry.count, 1);
    }

    #[tokio::test]
    async fn enqueue_is_noop_when_autorun_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = AgentId::new("main").unwrap();
        let store = make_store_without_autorun(tmp.path(), &agent_id);
        let broker = Arc::new(fleetcore_broker::Broker::new(tmp.path()).unwrap());
        let adapter = CliAdapter::new("/bin/true");
        let manager = TurnManager::new(store, broker, adapter, None);

        let key = SessionRef {
            agent_id,
            session_id: SessionId::main(),
        };
        manager.enqueue(key.clone());
        let scheduling = manager.scheduling.lock().unwrap();
        assert!(!scheduling.debounce.contains_key(&key));
    }
}
