//! In-memory subscription tables (`spec.md` §4.2 "Index rebuild").
//!
//! Auto-subscriptions are never stored here — they are derived from
//! `known_agents` at match time, exactly as `spec.md` requires
//! ("recomputed, never persisted").

use std::collections::HashMap;

use fleetcore_core::path_matches;
use fleetcore_store::AgentStore;
use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::message::SessionRef;
use fleetcore_types::subscription::Subscription;

use crate::error::BrokerError;
use crate::types::auto_subscription_pattern;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionIndex {
    known_agents: Vec<AgentId>,
    sessions_by_agent: HashMap<AgentId, Vec<SessionId>>,
    agent_patterns: HashMap<AgentId, Vec<Subscription>>,
    session_patterns: HashMap<SessionRef, Vec<Subscription>>,
}

impl SubscriptionIndex {
    /// Clear all tables and re-enumerate from disk (`spec.md` §4.2).
    /// Readers keep using the previous index until this returns, since the
    /// caller swaps it in behind the broker's single mutex in one step.
    pub fn rebuild(store: &AgentStore) -> Result<Self, BrokerError> {
        let mut index = SubscriptionIndex::default();
        let agents = store.list_agents()?;
        for agent_id in agents {
            let agent_subs = store.read_agent_subscriptions(&agent_id)?;
            index.agent_patterns.insert(agent_id.clone(), agent_subs);

            let session_ids = store.list_sessions(&agent_id)?;
            for session_id in &session_ids {
                let session_subs = store.read_session_subscriptions(&agent_id, session_id)?;
                let key = SessionRef {
                    agent_id: agent_id.clone(),
                    session_id: session_id.clone(),
                };
                index.session_patterns.insert(key, session_subs);
            }
            index.sessions_by_agent.insert(agent_id.clone(), session_ids);
            index.known_agents.push(agent_id);
        }
        Ok(index)
    }

    pub fn known_agents(&self) -> &[AgentId] {
        &self.known_agents
    }

    pub fn sessions_of(&self, agent_id: &AgentId) -> &[SessionId] {
        self.sessions_by_agent
            .get(agent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Matching sessions for a normalized path (`spec.md` §4.2 step 2).
    pub fn matching_sessions(&self, path: &str) -> Vec<SessionRef> {
        self.session_patterns
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| path_matches(&s.pattern, path)))
            .map(|(session_ref, _)| session_ref.clone())
            .collect()
    }

    /// Matching agents for a normalized path (`spec.md` §4.2 step 3),
    /// including the broadcast sender-exclusion rule.
    pub fn matching_agents(&self, path: &str, from: &AgentId) -> Vec<AgentId> {
        let mut matched: Vec<AgentId> = self
            .known_agents
            .iter()
            .filter(|id| path == auto_subscription_pattern(id))
            .cloned()
            .collect();

        for (agent_id, subs) in &self.agent_patterns {
            if subs.iter().any(|s| path_matches(&s.pattern, path)) && !matched.contains(agent_id) {
                matched.push(agent_id.clone());
            }
        }

        let sender_auto_pattern = auto_subscription_pattern(from);
        if path.starts_with("agent/") && path != sender_auto_pattern {
            matched.retain(|id| id != from);
        }
        matched
    }

    pub fn agent_patterns(&self, agent_id: &AgentId) -> Vec<Subscription> {
        self.agent_patterns.get(agent_id).cloned().unwrap_or_default()
    }

    pub fn session_patterns(&self, session_ref: &SessionRef) -> Vec<Subscription> {
        self.session_patterns
            .get(session_ref)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_agent_patterns(&mut self, agent_id: AgentId, patterns: Vec<Subscription>) {
        self.agent_patterns.insert(agent_id, patterns);
    }

    pub fn set_session_patterns(&mut self, session_ref: SessionRef, patterns: Vec<Subscription>) {
        self.session_patterns.insert(session_ref, patterns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetcore_store::AgentCreateOptions;

    #[test]
    fn rebuild_picks_up_persisted_subscriptions() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let main = AgentId::new("main").unwrap();
        store
            .create_agent(
                &main,
                AgentCreateOptions {
                    initial_subscriptions: vec!["slack/*".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();

        let index = SubscriptionIndex::rebuild(&store).unwrap();
        assert_eq!(index.known_agents(), &[main.clone()]);
        assert!(index.matching_agents("slack/team", &main).contains(&main));
        assert!(index.matching_agents("agent/main", &main).contains(&main));
    }

    #[test]
    fn broadcast_excludes_sender() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let a = AgentId::new("a").unwrap();
        let b = AgentId::new("b").unwrap();
        store.create_agent(&a, AgentCreateOptions::default()).unwrap();
        store.create_agent(&b, AgentCreateOptions::default()).unwrap();
        let index = SubscriptionIndex::rebuild(&store).unwrap();

        let matched = index.matching_agents("agent/**", &a);
        assert!(!matched.contains(&a));
        assert!(matched.contains(&b));
    }

    #[test]
    fn direct_send_to_self_still_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let a = AgentId::new("a").unwrap();
        store.create_agent(&a, AgentCreateOptions::default()).unwrap();
        let index = SubscriptionIndex::rebuild(&store).unwrap();

        let matched = index.matching_agents("agent/a", &a);
        assert!(matched.contains(&a));
        let _ = Utc::now();
    }
}
