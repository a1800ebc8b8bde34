//! Real-time fan-out channels (`spec.md` §4.2 `listen`/`listenSession`).
//!
//! A Rust-native redesign of the source's callback-plus-cancel-token API:
//! `listen`/`listenSession` hand back an owned `broadcast::Receiver`, and
//! dropping it *is* the cancel token.

use std::collections::HashMap;

use fleetcore_types::ids::AgentId;
use fleetcore_types::message::{RecipientMessage, SessionRef};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
pub struct RealtimeRegistry {
    agent_channels: HashMap<AgentId, broadcast::Sender<RecipientMessage>>,
    session_channels: HashMap<SessionRef, broadcast::Sender<RecipientMessage>>,
}

impl RealtimeRegistry {
    pub fn listen(&mut self, agent_id: &AgentId) -> broadcast::Receiver<RecipientMessage> {
        self.agent_channels
            .entry(agent_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn listen_session(
        &mut self,
        session_ref: &SessionRef,
    ) -> broadcast::Receiver<RecipientMessage> {
        self.session_channels
            .entry(session_ref.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fire the agent channel if it has listeners. A full or receiver-less
    /// channel is not an error — nobody is watching.
    pub fn publish_agent(&mut self, agent_id: &AgentId, message: RecipientMessage) {
        if let Some(sender) = self.agent_channels.get(agent_id) {
            let _ = sender.send(message);
        }
    }

    pub fn publish_session(&mut self, session_ref: &SessionRef, message: RecipientMessage) {
        if let Some(sender) = self.session_channels.get(session_ref) {
            let _ = sender.send(message);
        }
    }
}
