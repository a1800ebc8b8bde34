//! Cron-scheduled heartbeats (`spec.md` §4.4 "Heartbeats"). On fire, a
//! synthetic message is routed to `agent/{id}` with `source=heartbeat`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetcore_broker::{Broker, RouteInput};
use fleetcore_core::cronspec::parse_heartbeat;
use fleetcore_store::AgentStore;
use fleetcore_types::ids::AgentId;
use fleetcore_types::message::MessageSource;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::RuntimeError;

/// A synthetic "who sent this" identity for heartbeat-originated routes.
/// Not a real agent; never matched by any subscription other than a
/// literal `heartbeat/**` pattern a user chooses to add.
const HEARTBEAT_ORIGIN: &str = "system/heartbeat";

pub struct HeartbeatScheduler {
    store: AgentStore,
    broker: Arc<Broker>,
    handles: Mutex<HashMap<AgentId, JoinHandle<()>>>,
}

impl HeartbeatScheduler {
    pub fn new(store: AgentStore, broker: Arc<Broker>) -> Self {
        Self {
            store,
            broker,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Walk all agents and (re)schedule. Called once at startup and again
    /// by `refresh()` after agent config changes.
    pub async fn refresh(&self) -> Result<(), RuntimeError> {
        self.stop_all().await;
        let agents = self.store.list_agents()?;
        let mut handles = self.handles.lock().await;
        for agent_id in agents {
            let config = self.store.get_agent(&agent_id)?;
            let Some(expr) = config.heartbeat else {
                continue;
            };
            let schedule = match parse_heartbeat(&expr) {
                Ok(schedule) => schedule,
                Err(e) => {
                    log::warn!("invalid heartbeat cron for {agent_id}: {e}");
                    continue;
                }
            };
            let broker = self.broker.clone();
            let id_for_task = agent_id.clone();
            let expr_for_task = expr.clone();
            let handle = tokio::spawn(async move {
                run_heartbeat_loop(broker, id_for_task, schedule, expr_for_task).await;
            });
            handles.insert(agent_id, handle);
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }
}

async fn run_heartbeat_loop(
    broker: Arc<Broker>,
    agent_id: AgentId,
    schedule: cron::Schedule,
    expr: String,
) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            log::warn!("heartbeat schedule for {agent_id} has no future occurrences");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        let fired_at = Utc::now();
        let input = RouteInput {
            command: "heartbeat".to_string(),
            payload: serde_json::json!({
                "scheduled": true,
                "cron": expr,
                "firedAt": fired_at,
            }),
            source: Some(MessageSource::heartbeat()),
            external_id: None,
        };
        let Ok(from) = AgentId::new(HEARTBEAT_ORIGIN) else {
            return;
        };
        if let Err(e) = broker.route(&from, &format!("agent/{agent_id}"), input).await {
            log::warn!("heartbeat route failed for {agent_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcore_store::AgentCreateOptions;

    #[tokio::test]
    async fn refresh_skips_invalid_cron_without_failing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let agent_id = AgentId::new("main").unwrap();
        store
            .create_agent(
                &agent_id,
                AgentCreateOptions {
                    heartbeat: Some("not a cron expression".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let broker = Arc::new(Broker::new(tmp.path()).unwrap());
        let scheduler = HeartbeatScheduler::new(AgentStore::new(tmp.path()), broker);
        scheduler.refresh().await.unwrap();
        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn refresh_schedules_valid_cron_agents() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let agent_id = AgentId::new("main").unwrap();
        store
            .create_agent(
                &agent_id,
                AgentCreateOptions {
                    heartbeat: Some("0 */5 * * * *".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let broker = Arc::new(Broker::new(tmp.path()).unwrap());
        let scheduler = HeartbeatScheduler::new(AgentStore::new(tmp.path()), broker);
        scheduler.refresh().await.unwrap();
        assert_eq!(scheduler.handles.lock().await.len(), 1);
        scheduler.stop_all().await;
    }
}
