//! The broker façade (`spec.md` §4.2): ties the in-memory subscription
//! index, durable per-recipient logs, and real-time fan-out together
//! behind one mutex, matching the single-mutex-per-broker rule of
//! `spec.md` §5.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fleetcore_core::pathmatch::normalize;
use fleetcore_store::AgentStore;
use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::message::{Message, RecipientMessage, SessionRef};
use fleetcore_types::subscription::Subscription;
use tokio::sync::{broadcast, Mutex};

use crate::error::BrokerError;
use crate::index::SubscriptionIndex;
use crate::realtime::RealtimeRegistry;
use crate::storage;
use crate::types::{auto_subscription_pattern, HistoryOptions, RouteInput, RouteResult};

type RouteObserver = Box<dyn Fn(&RouteResult) + Send + Sync>;

struct BrokerState {
    index: SubscriptionIndex,
    realtime: RealtimeRegistry,
    observers: Vec<RouteObserver>,
}

/// Path-addressed message broker, one instance per project root.
pub struct Broker {
    root: PathBuf,
    store: AgentStore,
    state: Mutex<BrokerState>,
}

impl Broker {
    /// Build the broker and run an initial `rebuildIndex()` so routing is
    /// correct from the first call (`spec.md` §5 "Index rebuild... on
    /// startup").
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let root = root.into();
        let store = AgentStore::new(&root);
        let index = SubscriptionIndex::rebuild(&store)?;
        Ok(Self {
            root,
            store,
            state: Mutex::new(BrokerState {
                index,
                realtime: RealtimeRegistry::default(),
                observers: Vec::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &AgentStore {
        &self.store
    }

    /// Rebuild the subscription tables from disk. Atomic from a reader's
    /// perspective: the fresh tables are built off to the side, then
    /// swapped in under the lock in one assignment.
    pub async fn rebuild_index(&self) -> Result<(), BrokerError> {
        let fresh = SubscriptionIndex::rebuild(&self.store)?;
        let mut state = self.state.lock().await;
        state.index = fresh;
        Ok(())
    }

    /// The routing primitive (`spec.md` §4.2 "Routing algorithm").
    pub async fn route(
        &self,
        from: &AgentId,
        path: &str,
        input: RouteInput,
    ) -> Result<RouteResult, BrokerError> {
        let normalized = normalize(path);
        if normalized.is_empty() {
            return Err(BrokerError::EmptyPath);
        }

        let mut state = self.state.lock().await;
        let matching_sessions = state.index.matching_sessions(&normalized);
        let matching_agents = state.index.matching_agents(&normalized, from);

        let base = Message {
            id: uuid::Uuid::new_v4(),
            from: from.to_string(),
            path: normalized,
            command: input.command,
            payload: input.payload,
            status: fleetcore_types::message::MessageStatus::Pending,
            timestamp: Utc::now(),
            source: input.source.unwrap_or_default(),
            external_id: input.external_id,
        };

        for session_ref in &matching_sessions {
            let recipient = RecipientMessage {
                message: base.clone(),
                handled: None,
                handled_by: Vec::new(),
                delivered_to: Vec::new(),
            };
            let path = storage::session_log_path(&self.root, &session_ref.agent_id, &session_ref.session_id);
            storage::append_recipient_message(&path, &recipient)?;
            state.realtime.publish_session(session_ref, recipient);
        }

        for agent_id in &matching_agents {
            let handled_by: Vec<SessionRef> = matching_sessions
                .iter()
                .filter(|s| &s.agent_id == agent_id)
                .cloned()
                .collect();
            let recipient = RecipientMessage {
                message: base.clone(),
                handled: Some(!handled_by.is_empty()),
                handled_by,
                delivered_to: matching_agents.clone(),
            };
            let path = storage::agent_log_path(&self.root, agent_id);
            storage::append_recipient_message(&path, &recipient)?;
            state.realtime.publish_agent(agent_id, recipient);
        }

        let result = if matching_agents.is_empty() && matching_sessions.is_empty() {
            storage::append_dead_letter(&self.root, &base, "no_subscribers")?;
            RouteResult {
                delivered: false,
                unmatched: true,
                delivered_to: Vec::new(),
                delivered_to_sessions: Vec::new(),
            }
        } else {
            RouteResult {
                delivered: true,
                unmatched: false,
                delivered_to: matching_agents,
                delivered_to_sessions: matching_sessions,
            }
        };

        for observer in &state.observers {
            observer(&result);
        }

        log::debug!(
            "routed from={from} path={path:?} delivered_to={:?} delivered_to_sessions={} unmatched={}",
            result.delivered_to,
            result.delivered_to_sessions.len(),
            result.unmatched,
        );

        Ok(result)
    }

    pub async fn send(
        &self,
        from: &AgentId,
        to: &AgentId,
        input: RouteInput,
    ) -> Result<RouteResult, BrokerError> {
        self.route(from, &auto_subscription_pattern(to), input).await
    }

    pub async fn broadcast(&self, from: &AgentId, input: RouteInput) -> Result<RouteResult, BrokerError> {
        self.route(from, "agent/**", input).await
    }

    pub fn receive(&self, agent_id: &AgentId) -> Result<Vec<RecipientMessage>, BrokerError> {
        storage::receive_pending(&storage::agent_log_path(&self.root, agent_id))
    }

    pub fn receive_session(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> Result<Vec<RecipientMessage>, BrokerError> {
        storage::receive_pending(&storage::session_log_path(&self.root, agent_id, session_id))
    }

    pub async fn listen(&self, agent_id: &AgentId) -> broadcast::Receiver<RecipientMessage> {
        self.state.lock().await.realtime.listen(agent_id)
    }

    pub async fn listen_session(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> broadcast::Receiver<RecipientMessage> {
        let session_ref = SessionRef {
            agent_id: agent_id.clone(),
            session_id: session_id.clone(),
        };
        self.state.lock().await.realtime.listen_session(&session_ref)
    }

    pub async fn subscribe(&self, agent_id: &AgentId, pattern: &str) -> Result<(), BrokerError> {
        if pattern == auto_subscription_pattern(agent_id) {
            return Ok(());
        }
        let mut patterns = self.store.read_agent_subscriptions(agent_id)?;
        if !patterns.iter().any(|s| s.pattern == pattern) {
            patterns.push(Subscription::new(pattern, Utc::now()));
        }
        self.store.write_agent_subscriptions(agent_id, patterns.clone())?;
        self.state.lock().await.index.set_agent_patterns(agent_id.clone(), patterns);
        Ok(())
    }

    pub async fn unsubscribe(&self, agent_id: &AgentId, pattern: &str) -> Result<(), BrokerError> {
        if pattern == auto_subscription_pattern(agent_id) {
            return Err(BrokerError::AutoSubscriptionProtected(pattern.to_string()));
        }
        let mut patterns = self.store.read_agent_subscriptions(agent_id)?;
        patterns.retain(|s| s.pattern != pattern);
        self.store.write_agent_subscriptions(agent_id, patterns.clone())?;
        self.state.lock().await.index.set_agent_patterns(agent_id.clone(), patterns);
        Ok(())
    }

    pub async fn subscribe_session(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let mut patterns = self.store.read_session_subscriptions(agent_id, session_id)?;
        if !patterns.iter().any(|s| s.pattern == pattern) {
            patterns.push(Subscription::new(pattern, Utc::now()));
        }
        self.store
            .write_session_subscriptions(agent_id, session_id, patterns.clone())?;
        let session_ref = SessionRef {
            agent_id: agent_id.clone(),
            session_id: session_id.clone(),
        };
        self.state.lock().await.index.set_session_patterns(session_ref, patterns);
        Ok(())
    }

    pub async fn unsubscribe_session(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let mut patterns = self.store.read_session_subscriptions(agent_id, session_id)?;
        patterns.retain(|s| s.pattern != pattern);
        self.store
            .write_session_subscriptions(agent_id, session_id, patterns.clone())?;
        let session_ref = SessionRef {
            agent_id: agent_id.clone(),
            session_id: session_id.clone(),
        };
        self.state.lock().await.index.set_session_patterns(session_ref, patterns);
        Ok(())
    }

    pub fn history(
        &self,
        agent_id: &AgentId,
        opts: HistoryOptions,
    ) -> Result<Vec<RecipientMessage>, BrokerError> {
        storage::history(&storage::agent_log_path(&self.root, agent_id), &opts)
    }

    pub fn session_history(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
        opts: HistoryOptions,
    ) -> Result<Vec<RecipientMessage>, BrokerError> {
        storage::history(
            &storage::session_log_path(&self.root, agent_id, session_id),
            &opts,
        )
    }

    pub fn get_unmatched(&self) -> Result<Vec<serde_json::Value>, BrokerError> {
        storage::get_unmatched(&self.root)
    }

    pub fn clear_unmatched(&self) -> Result<(), BrokerError> {
        storage::clear_unmatched(&self.root)
    }

    /// Register a delivery-notification hook, invoked synchronously and in
    /// registration order after every `route()` persists (`spec.md` §5
    /// ordering guarantee).
    pub async fn on_route<F>(&self, observer: F)
    where
        F: Fn(&RouteResult) + Send + Sync + 'static,
    {
        self.state.lock().await.observers.push(Box::new(observer));
    }
}

/// Shared handle, cloned across the turn manager and the control surface.
pub type SharedBroker = Arc<Broker>;

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcore_store::AgentCreateOptions;

    fn route_input(command: &str) -> RouteInput {
        RouteInput {
            command: command.to_string(),
            payload: serde_json::json!({"ok": true}),
            source: None,
            external_id: None,
        }
    }

    async fn two_agents() -> (tempfile::TempDir, Broker, AgentId, AgentId) {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let a = AgentId::new("a").unwrap();
        let b = AgentId::new("b").unwrap();
        store.create_agent(&a, AgentCreateOptions::default()).unwrap();
        store.create_agent(&b, AgentCreateOptions::default()).unwrap();
        let broker = Broker::new(tmp.path()).unwrap();
        (tmp, broker, a, b)
    }

    #[tokio::test]
    async fn direct_send_delivers_to_agent_log() {
        let (_tmp, broker, a, b) = two_agents().await;
        let result = broker.send(&a, &b, route_input("notify")).await.unwrap();
        assert!(result.delivered);
        assert!(result.delivered_to.contains(&b));

        let received = broker.receive(&b).unwrap();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_reaches_others() {
        let (_tmp, broker, a, b) = two_agents().await;
        let result = broker.broadcast(&a, route_input("ping")).await.unwrap();
        assert!(!result.delivered_to.contains(&a));
        assert!(result.delivered_to.contains(&b));
    }

    #[tokio::test]
    async fn unmatched_path_writes_dead_letter() {
        let (_tmp, broker, a, _b) = two_agents().await;
        let result = broker.route(&a, "slack/nobody-listens", route_input("x")).await.unwrap();
        assert!(result.unmatched);
        assert_eq!(broker.get_unmatched().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_then_route_delivers_via_custom_pattern() {
        let (_tmp, broker, a, b) = two_agents().await;
        broker.subscribe(&b, "alerts/**").await.unwrap();
        let result = broker.route(&a, "alerts/disk-full", route_input("alert")).await.unwrap();
        assert!(result.delivered_to.contains(&b));
    }

    #[tokio::test]
    async fn unsubscribe_auto_subscription_is_rejected() {
        let (_tmp, broker, a, _b) = two_agents().await;
        let err = broker.unsubscribe(&a, "agent/a").await.unwrap_err();
        assert!(matches!(err, BrokerError::AutoSubscriptionProtected(_)));
    }

    #[tokio::test]
    async fn on_route_observer_fires_after_persistence() {
        let (_tmp, broker, a, b) = two_agents().await;
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_clone = seen.clone();
        broker
            .on_route(move |result| {
                seen_clone.store(result.delivered, std::sync::atomic::Ordering::SeqCst);
            })
            .await;
        broker.send(&a, &b, route_input("notify")).await.unwrap();
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn listen_receives_realtime_fanout() {
        let (_tmp, broker, a, b) = two_agents().await;
        let mut rx = broker.listen(&b).await;
        broker.send(&a, &b, route_input("notify")).await.unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.message.from, "a");
    }
}
