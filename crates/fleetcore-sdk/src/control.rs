//! TCP control surface (`spec.md` §6): newline-delimited JSON over TCP
//! using the shared `ClientEnvelope`/`ServerEnvelope` wire types, a token
//! auth handshake, a 30s ping/pong watchdog, and a request/response
//! protocol with one multiplexed exception — `session.start` streams
//! `session.<kind>` events, and a server-pushed `ask-user` prompt (from any
//! agent's turn, on any connection) can arrive on every connection at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use fleetcore_broker::{HistoryOptions, RouteInput};
use fleetcore_llmcli::adapter::TurnRequest;
use fleetcore_llmcli::events::NormalizedEvent;
use fleetcore_runtime::{ToolContext, ToolResult};
use fleetcore_store::session::{self, SessionCreateOptions};
use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::message::MessageSource;
use fleetcore_types::protocol::{ClientEnvelope, ServerEnvelope};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec};
use uuid::Uuid;

use crate::container::Container;
use crate::error::SdkError;

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const SESSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn error_envelope(kind: impl Into<String>, req_id: Option<String>, message: impl Into<String>) -> ServerEnvelope {
    ServerEnvelope::with_body(kind, req_id, &json!({"error": message.into()})).expect("a one-field json body always serializes")
}

fn envelope_line(env: &ServerEnvelope) -> String {
    serde_json::to_string(env).unwrap_or_else(|_| "{}".to_string())
}

/// Shared response shape for `msg.route`/`msg.send`/`msg.broadcast`.
fn route_result_envelope(kind: impl Into<String>, req_id: Option<String>, result: &fleetcore_broker::RouteResult) -> ServerEnvelope {
    let delivered_to: Vec<String> = result.delivered_to.iter().map(ToString::to_string).collect();
    ServerEnvelope::with_body(
        kind,
        req_id,
        &json!({
            "delivered": result.delivered,
            "unmatched": result.unmatched,
            "deliveredTo": delivered_to,
            "deliveredToSessions": result.delivered_to_sessions,
        }),
    )
    .unwrap_or_else(|_| error_envelope("error", None, "failed to serialize response"))
}

#[derive(Deserialize)]
struct AuthBody {
    token: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AgentCreateBody {
    agent_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteBody {
    from: String,
    path: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    external_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionStartBody {
    agent_id: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    prompt: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskUserResponseBody {
    question_id: Uuid,
    answer: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolExecuteBody {
    agent_id: String,
    #[serde(default)]
    session_id: Option<String>,
    tool: String,
    #[serde(default)]
    input: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsListBody {
    agent_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionAbortBody {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentIdBody {
    agent_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentUpdateBody {
    agent_id: String,
    patch: fleetcore_types::agent::AgentConfigPatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstructionsReadBody {
    agent_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstructionsWriteBody {
    agent_id: String,
    #[serde(default)]
    instructions: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionListBody {
    agent_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationHistoryBody {
    agent_id: String,
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgSendBody {
    from: String,
    to: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    external_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgBroadcastBody {
    from: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    external_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgReceiveBody {
    agent_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgListenBody {
    agent_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgHistoryBody {
    agent_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgSubscribeBody {
    agent_id: String,
    pattern: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgSessionReceiveBody {
    agent_id: String,
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgSessionListenBody {
    agent_id: String,
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgSessionHistoryBody {
    agent_id: String,
    session_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgSessionSubscribeBody {
    agent_id: String,
    session_id: String,
    pattern: String,
}

/// Per-connection bookkeeping released in full on disconnect (`spec.md`
/// §6: "Client disconnect aborts all its sessions and releases all its
/// broker listeners"). Session abort flags are checked from inside the
/// synchronous `run_streaming` callback, so they are a plain `AtomicBool`
/// rather than anything that needs an `.await` to read.
#[derive(Default)]
struct ConnectionState {
    session_aborts: StdMutex<HashMap<String, Arc<AtomicBool>>>,
    listen_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConnectionState {
    fn register_session(&self, session_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.session_aborts
            .lock()
            .unwrap()
            .insert(session_id.to_string(), flag.clone());
        flag
    }

    fn forget_session(&self, session_id: &str) {
        self.session_aborts.lock().unwrap().remove(session_id);
    }

    fn abort_session(&self, session_id: &str) -> bool {
        if let Some(flag) = self.session_aborts.lock().unwrap().get(session_id) {
            flag.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn track_listener(&self, task: JoinHandle<()>) {
        self.listen_tasks.lock().unwrap().push(task);
    }

    /// Trips every session this connection started and kills every
    /// broker-listener task it opened. Called once, when the reader loop
    /// exits for any reason (clean close, idle timeout, parse failure).
    fn release_all(&self) {
        for flag in self.session_aborts.lock().unwrap().values() {
            flag.store(true, Ordering::Relaxed);
        }
        for task in self.listen_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

pub struct ControlSurface {
    container: Arc<Container>,
    token: String,
}

impl ControlSurface {
    pub fn new(container: Arc<Container>, token: impl Into<String>) -> Self {
        Self {
            container,
            token: token.into(),
        }
    }

    /// Binds `addr` and serves connections until the listener errors.
    /// `spec.md` §6: a control surface bind failure is a warn-and-continue
    /// condition, not a boot-fatal one — callers decide whether to treat
    /// the returned error that way.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<(), SdkError> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("control surface listening on {addr}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let surface = self.clone();
            tokio::spawn(async move {
                if let Err(e) = surface.handle_connection(stream).await {
                    log::warn!("control connection {peer} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), SdkError> {
        let framed = Framed::new(stream, LinesCodec::new());
        let (mut sink, mut lines) = framed.split();

        let first = tokio::time::timeout(AUTH_TIMEOUT, lines.next()).await;
        let raw_first = match first {
            Ok(Some(Ok(raw))) => raw,
            _ => return Ok(()),
        };
        let envelope: Option<ClientEnvelope> = serde_json::from_str(&raw_first).ok();
        let req_id = envelope.as_ref().and_then(|e| e.req_id.clone());
        let authed = envelope.as_ref().is_some_and(|e| {
            e.kind == "auth"
                && e.parse_body::<AuthBody>()
                    .is_ok_and(|body| constant_time_eq(&body.token, &self.token))
        });

        if authed {
            sink.send(envelope_line(&ServerEnvelope::new("auth.ok", req_id))).await?;
        } else {
            sink.send(envelope_line(&error_envelope("auth.error", req_id, "invalid token")))
                .await?;
            return Ok(());
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        // Every authenticated connection can both receive a broadcast
        // `ask-user` prompt from any agent's turn and answer one itself.
        let ask_broadcast_tx = outbound_tx.clone();
        let (ask_frame_tx, mut ask_frame_rx) = mpsc::unbounded_channel::<Value>();
        self.container.ask_user.register_client(ask_frame_tx).await;
        tokio::spawn(async move {
            while let Some(frame) = ask_frame_rx.recv().await {
                if ask_broadcast_tx.send(frame.to_string()).is_err() {
                    break;
                }
            }
        });

        let last_activity = Arc::new(Mutex::new(Instant::now()));
        {
            let ping_tx = outbound_tx.clone();
            let last_activity = last_activity.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(PING_INTERVAL).await;
                    if last_activity.lock().await.elapsed() > IDLE_TIMEOUT {
                        break;
                    }
                    if ping_tx.send(envelope_line(&ServerEnvelope::new("ping", None))).is_err() {
                        break;
                    }
                }
            });
        }

        let conn_state = Arc::new(ConnectionState::default());

        loop {
            let next = tokio::time::timeout(IDLE_TIMEOUT, lines.next()).await;
            let Ok(Some(Ok(raw))) = next else { break };
            *last_activity.lock().await = Instant::now();
            let Ok(envelope) = serde_json::from_str::<ClientEnvelope>(&raw) else { continue };
            self.dispatch(envelope, &outbound_tx, &conn_state).await;
        }

        writer.abort();
        conn_state.release_all();
        Ok(())
    }

    async fn dispatch(&self, envelope: ClientEnvelope, outbound: &mpsc::UnboundedSender<String>, conn_state: &Arc<ConnectionState>) {
        let req_id = envelope.req_id.clone();
        match envelope.kind.as_str() {
            "ping" => {
                let _ = outbound.send(envelope_line(&ServerEnvelope::new("pong", req_id)));
            }
            "pong" => {}
            "agent.list" => self.handle_agent_list(req_id, outbound),
            "agent.create" => self.handle_agent_create(&envelope, req_id, outbound),
            "agent.get" => self.handle_agent_get(&envelope, req_id, outbound),
            "agent.update" => self.handle_agent_update(&envelope, req_id, outbound),
            "agent.delete" => self.handle_agent_delete(&envelope, req_id, outbound),
            "agent.instructions.read" => self.handle_instructions_read(&envelope, req_id, outbound),
            "agent.instructions.write" => self.handle_instructions_write(&envelope, req_id, outbound),
            "agent.tools.list" => self.handle_tools_list(&envelope, req_id, outbound),
            "agent.tool.execute" => self.handle_tool_execute(envelope, req_id, outbound.clone()),
            "session.list" => self.handle_session_list(&envelope, req_id, outbound),
            "session.start" => self.spawn_session_start(envelope, req_id, outbound.clone(), conn_state.clone(), false),
            "session.continue" => self.spawn_session_start(envelope, req_id, outbound.clone(), conn_state.clone(), true),
            "session.abort" => self.handle_session_abort(&envelope, req_id, outbound, conn_state),
            "conversation.history" => self.handle_conversation_history(&envelope, req_id, outbound),
            "msg.route" => self.handle_route(&envelope, req_id, outbound).await,
            "msg.send" => self.handle_msg_send(&envelope, req_id, outbound).await,
            "msg.broadcast" => self.handle_msg_broadcast(&envelope, req_id, outbound).await,
            "msg.receive" => self.handle_msg_receive(&envelope, req_id, outbound),
            "msg.listen" => self.spawn_msg_listen(&envelope, req_id, outbound.clone(), conn_state.clone()).await,
            "msg.history" => self.handle_msg_history(&envelope, req_id, outbound),
            "msg.subscribe" => self.handle_msg_subscribe(&envelope, req_id, outbound).await,
            "msg.unsubscribe" => self.handle_msg_unsubscribe(&envelope, req_id, outbound).await,
            "msg.session.receive" => self.handle_msg_session_receive(&envelope, req_id, outbound),
            "msg.session.listen" => self.spawn_msg_session_listen(&envelope, req_id, outbound.clone(), conn_state.clone()).await,
            "msg.session.history" => self.handle_msg_session_history(&envelope, req_id, outbound),
            "msg.session.subscribe" => self.handle_msg_session_subscribe(&envelope, req_id, outbound).await,
            "msg.session.unsubscribe" => self.handle_msg_session_unsubscribe(&envelope, req_id, outbound).await,
            "logs.unmatched" => self.handle_logs_unmatched(req_id, outbound),
            "logs.unmatched.clear" => self.handle_logs_unmatched_clear(req_id, outbound),
            "logs.services" => self.handle_logs_services(req_id, outbound),
            "ask-user.response" => {
                if let Ok(body) = envelope.parse_body::<AskUserResponseBody>() {
                    self.container.ask_user.answer(body.question_id, body.answer).await;
                    let _ = outbound.send(envelope_line(&ServerEnvelope::new("ask-user.response.ok", req_id)));
                }
            }
            other => {
                let _ = outbound.send(envelope_line(&error_envelope("error", req_id, format!("unknown message type {other}"))));
            }
        }
    }

    fn handle_agent_list(&self, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let line = match self.container.store.list_agents() {
            Ok(agents) => {
                let ids: Vec<String> = agents.iter().map(ToString::to_string).collect();
                ServerEnvelope::with_body("agent.list.result", req_id, &json!({"agents": ids}))
                    .unwrap_or_else(|_| error_envelope("agent.list.error", None, "failed to serialize agent list"))
            }
            Err(e) => error_envelope("agent.list.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_agent_create(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<AgentCreateBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("agent.create.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("agent.create.error", req_id, "invalid agentId")));
            return;
        };
        let options = fleetcore_store::AgentCreateOptions {
            name: body.name,
            description: body.description,
            ..Default::default()
        };
        let line = match self.container.store.create_agent(&agent_id, options) {
            Ok(_) => ServerEnvelope::with_body("agent.create.ok", req_id, &json!({"agentId": agent_id.to_string()}))
                .unwrap_or_else(|_| error_envelope("agent.create.error", None, "failed to serialize response")),
            Err(e) => error_envelope("agent.create.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_agent_get(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<AgentIdBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("agent.get.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("agent.get.error", req_id, "invalid agentId")));
            return;
        };
        let line = match self.container.store.get_agent(&agent_id) {
            Ok(config) => ServerEnvelope::with_body("agent.get.result", req_id, &json!({"agentId": agent_id.to_string(), "config": config}))
                .unwrap_or_else(|_| error_envelope("agent.get.error", None, "failed to serialize response")),
            Err(e) => error_envelope("agent.get.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_agent_update(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<AgentUpdateBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("agent.update.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("agent.update.error", req_id, "invalid agentId")));
            return;
        };
        let line = match self.container.store.update_agent(&agent_id, body.patch) {
            Ok(config) => ServerEnvelope::with_body("agent.update.ok", req_id, &json!({"agentId": agent_id.to_string(), "config": config}))
                .unwrap_or_else(|_| error_envelope("agent.update.error", None, "failed to serialize response")),
            Err(e) => error_envelope("agent.update.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_agent_delete(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<AgentIdBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("agent.delete.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("agent.delete.error", req_id, "invalid agentId")));
            return;
        };
        let line = match self.container.store.delete_agent(&agent_id) {
            Ok(()) => ServerEnvelope::new("agent.delete.ok", req_id),
            Err(e) => error_envelope("agent.delete.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_instructions_read(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<InstructionsReadBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("agent.instructions.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("agent.instructions.error", req_id, "invalid agentId")));
            return;
        };
        let line = match self.container.store.read_instructions(&agent_id) {
            Ok(instructions) => ServerEnvelope::with_body("agent.instructions.result", req_id, &json!({"instructions": instructions}))
                .unwrap_or_else(|_| error_envelope("agent.instructions.error", None, "failed to serialize response")),
            Err(e) => error_envelope("agent.instructions.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_instructions_write(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<InstructionsWriteBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("agent.instructions.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("agent.instructions.error", req_id, "invalid agentId")));
            return;
        };
        let line = match self.container.store.write_instructions(&agent_id, &body.instructions) {
            Ok(()) => ServerEnvelope::new("agent.instructions.ok", req_id),
            Err(e) => error_envelope("agent.instructions.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_session_list(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<SessionListBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("session.list.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("session.list.error", req_id, "invalid agentId")));
            return;
        };
        let line = match session::list_sessions(self.container.store.root(), &agent_id) {
            Ok(sessions) => ServerEnvelope::with_body("session.list.result", req_id, &json!({"sessions": sessions}))
                .unwrap_or_else(|_| error_envelope("session.list.error", None, "failed to serialize response")),
            Err(e) => error_envelope("session.list.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_session_abort(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>, conn_state: &ConnectionState) {
        let body = match envelope.parse_body::<SessionAbortBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("session.abort.error", req_id, e.to_string())));
                return;
            }
        };
        let line = if conn_state.abort_session(&body.session_id) {
            ServerEnvelope::with_body("session.abort.ok", req_id, &json!({"sessionId": body.session_id}))
                .unwrap_or_else(|_| error_envelope("session.abort.error", None, "failed to serialize response"))
        } else {
            error_envelope("session.abort.error", req_id, "no active session with that id on this connection")
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_conversation_history(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<ConversationHistoryBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("conversation.history.error", req_id, e.to_string())));
                return;
            }
        };
        let (Ok(agent_id), Ok(session_id)) = (AgentId::new(&body.agent_id), SessionId::new(&body.session_id)) else {
            let _ = outbound.send(envelope_line(&error_envelope("conversation.history.error", req_id, "invalid agentId or sessionId")));
            return;
        };
        let line = match fleetcore_store::conversation::read_conversation_log(self.container.store.root(), &agent_id, &session_id) {
            Ok(lines) => ServerEnvelope::with_body("conversation.history.result", req_id, &json!({"lines": lines}))
                .unwrap_or_else(|_| error_envelope("conversation.history.error", None, "failed to serialize response")),
            Err(e) => error_envelope("conversation.history.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    async fn handle_msg_send(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgSendBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.send.error", req_id, e.to_string())));
                return;
            }
        };
        let (Ok(from), Ok(to)) = (AgentId::new(&body.from), AgentId::new(&body.to)) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.send.error", req_id, "invalid from/to agentId")));
            return;
        };
        let input = RouteInput {
            command: body.command,
            payload: body.payload,
            source: Some(MessageSource::internal()),
            external_id: body.external_id,
        };
        let line = match self.container.broker.send(&from, &to, input).await {
            Ok(result) => route_result_envelope("msg.send.ok", req_id, &result),
            Err(e) => error_envelope("msg.send.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    async fn handle_msg_broadcast(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgBroadcastBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.broadcast.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(from) = AgentId::new(&body.from) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.broadcast.error", req_id, "invalid from agentId")));
            return;
        };
        let input = RouteInput {
            command: body.command,
            payload: body.payload,
            source: Some(MessageSource::internal()),
            external_id: body.external_id,
        };
        let line = match self.container.broker.broadcast(&from, input).await {
            Ok(result) => route_result_envelope("msg.broadcast.ok", req_id, &result),
            Err(e) => error_envelope("msg.broadcast.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_msg_receive(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgReceiveBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.receive.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.receive.error", req_id, "invalid agentId")));
            return;
        };
        let line = match self.container.broker.receive(&agent_id) {
            Ok(messages) => ServerEnvelope::with_body("msg.receive.result", req_id, &json!({"messages": messages}))
                .unwrap_or_else(|_| error_envelope("msg.receive.error", None, "failed to serialize response")),
            Err(e) => error_envelope("msg.receive.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    /// Streams every future delivery to `agentId` as `msg.listen.event`
    /// frames until the connection drops; the listener task is tracked on
    /// `conn_state` so disconnect tears it down (`spec.md` §6).
    async fn spawn_msg_listen(
        &self,
        envelope: &ClientEnvelope,
        req_id: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
        conn_state: Arc<ConnectionState>,
    ) {
        let body = match envelope.parse_body::<MsgListenBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.listen.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.listen.error", req_id, "invalid agentId")));
            return;
        };
        let mut rx = self.container.broker.listen(&agent_id).await;
        let _ = outbound.send(envelope_line(&ServerEnvelope::new("msg.listen.ok", req_id.clone())));
        let task = tokio::spawn(async move {
            while let Ok(message) = rx.recv().await {
                let Ok(frame) = ServerEnvelope::with_body("msg.listen.event", req_id.clone(), &json!({"message": message})) else {
                    continue;
                };
                if outbound.send(envelope_line(&frame)).is_err() {
                    break;
                }
            }
        });
        conn_state.track_listener(task);
    }

    fn handle_msg_history(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgHistoryBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.history.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.history.error", req_id, "invalid agentId")));
            return;
        };
        let opts = HistoryOptions {
            limit: body.limit,
            ..Default::default()
        };
        let line = match self.container.broker.history(&agent_id, opts) {
            Ok(messages) => ServerEnvelope::with_body("msg.history.result", req_id, &json!({"messages": messages}))
                .unwrap_or_else(|_| error_envelope("msg.history.error", None, "failed to serialize response")),
            Err(e) => error_envelope("msg.history.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    async fn handle_msg_subscribe(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgSubscribeBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.subscribe.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.subscribe.error", req_id, "invalid agentId")));
            return;
        };
        let line = match self.container.broker.subscribe(&agent_id, &body.pattern).await {
            Ok(()) => ServerEnvelope::new("msg.subscribe.ok", req_id),
            Err(e) => error_envelope("msg.subscribe.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    async fn handle_msg_unsubscribe(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgSubscribeBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.unsubscribe.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.unsubscribe.error", req_id, "invalid agentId")));
            return;
        };
        let line = match self.container.broker.unsubscribe(&agent_id, &body.pattern).await {
            Ok(()) => ServerEnvelope::new("msg.unsubscribe.ok", req_id),
            Err(e) => error_envelope("msg.unsubscribe.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_msg_session_receive(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgSessionReceiveBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.session.receive.error", req_id, e.to_string())));
                return;
            }
        };
        let (Ok(agent_id), Ok(session_id)) = (AgentId::new(&body.agent_id), SessionId::new(&body.session_id)) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.session.receive.error", req_id, "invalid agentId or sessionId")));
            return;
        };
        let line = match self.container.broker.receive_session(&agent_id, &session_id) {
            Ok(messages) => ServerEnvelope::with_body("msg.session.receive.result", req_id, &json!({"messages": messages}))
                .unwrap_or_else(|_| error_envelope("msg.session.receive.error", None, "failed to serialize response")),
            Err(e) => error_envelope("msg.session.receive.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    async fn spawn_msg_session_listen(
        &self,
        envelope: &ClientEnvelope,
        req_id: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
        conn_state: Arc<ConnectionState>,
    ) {
        let body = match envelope.parse_body::<MsgSessionListenBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.session.listen.error", req_id, e.to_string())));
                return;
            }
        };
        let (Ok(agent_id), Ok(session_id)) = (AgentId::new(&body.agent_id), SessionId::new(&body.session_id)) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.session.listen.error", req_id, "invalid agentId or sessionId")));
            return;
        };
        let mut rx = self.container.broker.listen_session(&agent_id, &session_id).await;
        let _ = outbound.send(envelope_line(&ServerEnvelope::new("msg.session.listen.ok", req_id.clone())));
        let task = tokio::spawn(async move {
            while let Ok(message) = rx.recv().await {
                let Ok(frame) = ServerEnvelope::with_body("msg.session.listen.event", req_id.clone(), &json!({"message": message})) else {
                    continue;
                };
                if outbound.send(envelope_line(&frame)).is_err() {
                    break;
                }
            }
        });
        conn_state.track_listener(task);
    }

    fn handle_msg_session_history(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgSessionHistoryBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.session.history.error", req_id, e.to_string())));
                return;
            }
        };
        let (Ok(agent_id), Ok(session_id)) = (AgentId::new(&body.agent_id), SessionId::new(&body.session_id)) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.session.history.error", req_id, "invalid agentId or sessionId")));
            return;
        };
        let opts = HistoryOptions {
            limit: body.limit,
            ..Default::default()
        };
        let line = match self.container.broker.session_history(&agent_id, &session_id, opts) {
            Ok(messages) => ServerEnvelope::with_body("msg.session.history.result", req_id, &json!({"messages": messages}))
                .unwrap_or_else(|_| error_envelope("msg.session.history.error", None, "failed to serialize response")),
            Err(e) => error_envelope("msg.session.history.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    async fn handle_msg_session_subscribe(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgSessionSubscribeBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.session.subscribe.error", req_id, e.to_string())));
                return;
            }
        };
        let (Ok(agent_id), Ok(session_id)) = (AgentId::new(&body.agent_id), SessionId::new(&body.session_id)) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.session.subscribe.error", req_id, "invalid agentId or sessionId")));
            return;
        };
        let line = match self.container.broker.subscribe_session(&agent_id, &session_id, &body.pattern).await {
            Ok(()) => ServerEnvelope::new("msg.session.subscribe.ok", req_id),
            Err(e) => error_envelope("msg.session.subscribe.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    async fn handle_msg_session_unsubscribe(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<MsgSessionSubscribeBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.session.unsubscribe.error", req_id, e.to_string())));
                return;
            }
        };
        let (Ok(agent_id), Ok(session_id)) = (AgentId::new(&body.agent_id), SessionId::new(&body.session_id)) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.session.unsubscribe.error", req_id, "invalid agentId or sessionId")));
            return;
        };
        let line = match self.container.broker.unsubscribe_session(&agent_id, &session_id, &body.pattern).await {
            Ok(()) => ServerEnvelope::new("msg.session.unsubscribe.ok", req_id),
            Err(e) => error_envelope("msg.session.unsubscribe.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_logs_unmatched(&self, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let line = match self.container.broker.get_unmatched() {
            Ok(entries) => ServerEnvelope::with_body("logs.unmatched.result", req_id, &json!({"entries": entries}))
                .unwrap_or_else(|_| error_envelope("logs.unmatched.error", None, "failed to serialize response")),
            Err(e) => error_envelope("logs.unmatched.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_logs_unmatched_clear(&self, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let line = match self.container.broker.clear_unmatched() {
            Ok(()) => ServerEnvelope::new("logs.unmatched.clear.ok", req_id),
            Err(e) => error_envelope("logs.unmatched.clear.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_logs_services(&self, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let statuses = self.container.services.status();
        let line = ServerEnvelope::with_body("logs.services.result", req_id, &json!({"services": statuses}))
            .unwrap_or_else(|_| error_envelope("logs.services.error", None, "failed to serialize response"));
        let _ = outbound.send(envelope_line(&line));
    }

    fn handle_tools_list(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<ToolsListBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("agent.tools.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(agent_id) = AgentId::new(&body.agent_id) else {
            let _ = outbound.send(envelope_line(&error_envelope("agent.tools.error", req_id, "invalid agentId")));
            return;
        };
        let names: Vec<String> = self.container.tools.list_agent_tools(&agent_id).into_iter().map(|t| t.name).collect();
        let _ = outbound.send(envelope_line(
            &ServerEnvelope::with_body("agent.tools.result", req_id, &json!({"tools": names}))
                .unwrap_or_else(|_| error_envelope("agent.tools.error", None, "failed to serialize response")),
        ));
    }

    /// Tool execution can block on its own `ask-user` round trip, so it
    /// runs off the reader loop the same way `session.start` does.
    fn handle_tool_execute(&self, envelope: ClientEnvelope, req_id: Option<String>, outbound: mpsc::UnboundedSender<String>) {
        let container = self.container.clone();
        tokio::spawn(async move {
            let body = match envelope.parse_body::<ToolExecuteBody>() {
                Ok(body) => body,
                Err(e) => {
                    let _ = outbound.send(envelope_line(&error_envelope("agent.tool.error", req_id, e.to_string())));
                    return;
                }
            };
            let Ok(agent_id) = AgentId::new(&body.agent_id) else {
                let _ = outbound.send(envelope_line(&error_envelope("agent.tool.error", req_id, "invalid agentId")));
                return;
            };
            let session_id = match &body.session_id {
                Some(raw) => match SessionId::new(raw) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        let _ = outbound.send(envelope_line(&error_envelope("agent.tool.error", req_id, e.to_string())));
                        return;
                    }
                },
                None => None,
            };
            let agent_config = match container.store.get_agent(&agent_id) {
                Ok(config) => config,
                Err(e) => {
                    let _ = outbound.send(envelope_line(&error_envelope("agent.tool.error", req_id, e.to_string())));
                    return;
                }
            };
            let secrets = fleetcore_runtime::tools::read_agent_secrets(container.store.root(), &agent_id).unwrap_or_default();

            let ctx = ToolContext {
                agent_id,
                session_id,
                project_root: container.project_root.clone(),
                agent_config,
                secrets,
                broker: container.broker.clone(),
                services: container.services_cell.clone(),
                ask_user: container.ask_user.clone(),
            };
            let line = match container.tools.execute_tool(&ctx, &body.tool, body.input).await {
                Ok(ToolResult { output, is_error }) => {
                    ServerEnvelope::with_body("agent.tool.result", req_id, &json!({"output": output, "isError": is_error}))
                        .unwrap_or_else(|_| error_envelope("agent.tool.error", None, "failed to serialize response"))
                }
                Err(e) => error_envelope("agent.tool.error", req_id, e.to_string()),
            };
            let _ = outbound.send(envelope_line(&line));
        });
    }

    async fn handle_route(&self, envelope: &ClientEnvelope, req_id: Option<String>, outbound: &mpsc::UnboundedSender<String>) {
        let body = match envelope.parse_body::<RouteBody>() {
            Ok(body) => body,
            Err(e) => {
                let _ = outbound.send(envelope_line(&error_envelope("msg.route.error", req_id, e.to_string())));
                return;
            }
        };
        let Ok(from) = AgentId::new(&body.from) else {
            let _ = outbound.send(envelope_line(&error_envelope("msg.route.error", req_id, "invalid from agentId")));
            return;
        };
        let input = RouteInput {
            command: body.command,
            payload: body.payload,
            source: Some(MessageSource::internal()),
            external_id: body.external_id,
        };
        let line = match self.container.broker.route(&from, &body.path, input).await {
            Ok(result) => route_result_envelope("msg.route.ok", req_id, &result),
            Err(e) => error_envelope("msg.route.error", req_id, e.to_string()),
        };
        let _ = outbound.send(envelope_line(&line));
    }

    /// Runs the streaming LLM-CLI turn in its own task so a long-running
    /// `session.start` never blocks this connection's reader loop from
    /// seeing a pong, another request, or an `ask-user.response`.
    /// Backs both `session.start` and `session.continue` (`spec.md` §4.6):
    /// continue requires a caller-supplied `sessionId` naming a session that
    /// already exists; start creates one when none is given. Both register
    /// an abort flag on `conn_state` before streaming begins, so a
    /// `session.abort` on this connection (or the connection dropping) is
    /// visible to the synchronous `run_streaming` callback below.
    fn spawn_session_start(
        &self,
        envelope: ClientEnvelope,
        req_id: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
        conn_state: Arc<ConnectionState>,
        is_continue: bool,
    ) {
        let container = self.container.clone();
        tokio::spawn(async move {
            let started_kind = if is_continue { "session.continued" } else { "session.started" };
            let error_kind = "session.error";

            let body = match envelope.parse_body::<SessionStartBody>() {
                Ok(body) => body,
                Err(e) => {
                    let _ = outbound.send(envelope_line(&error_envelope(error_kind, req_id, e.to_string())));
                    return;
                }
            };
            let Ok(agent_id) = AgentId::new(&body.agent_id) else {
                let _ = outbound.send(envelope_line(&error_envelope(error_kind, req_id, "invalid agentId")));
                return;
            };

            let session_id = if is_continue {
                let Some(raw) = &body.session_id else {
                    let _ = outbound.send(envelope_line(&error_envelope(error_kind, req_id, "session.continue requires sessionId")));
                    return;
                };
                let id = match SessionId::new(raw) {
                    Ok(id) => id,
                    Err(e) => {
                        let _ = outbound.send(envelope_line(&error_envelope(error_kind, req_id, e.to_string())));
                        return;
                    }
                };
                if let Err(e) = session::get_session(container.store.root(), &agent_id, &id) {
                    let _ = outbound.send(envelope_line(&error_envelope(error_kind, req_id, e.to_string())));
                    return;
                }
                id
            } else {
                match &body.session_id {
                    Some(raw) => match SessionId::new(raw) {
                        Ok(id) => id,
                        Err(e) => {
                            let _ = outbound.send(envelope_line(&error_envelope(error_kind, req_id, e.to_string())));
                            return;
                        }
                    },
                    None => {
                        let title: String = body.prompt.chars().take(60).collect();
                        let created = session::create_session(
                            container.store.root(),
                            &agent_id,
                            SessionCreateOptions {
                                title: Some(title),
                                ..Default::default()
                            },
                            Utc::now(),
                        );
                        let meta = match created {
                            Ok(meta) => meta,
                            Err(e) => {
                                let _ = outbound.send(envelope_line(&error_envelope(error_kind, req_id, e.to_string())));
                                return;
                            }
                        };
                        match SessionId::new(&meta.id) {
                            Ok(id) => id,
                            Err(e) => {
                                let _ = outbound.send(envelope_line(&error_envelope(error_kind, req_id, e.to_string())));
                                return;
                            }
                        }
                    }
                }
            };

            let abort_flag = conn_state.register_session(session_id.as_str());

            let _ = outbound.send(envelope_line(&ServerEnvelope::with_body(
                started_kind,
                req_id.clone(),
                &json!({"sessionId": session_id.as_str()}),
            )
            .expect("one-field json body always serializes")));

            let system_prompt =
                fleetcore_store::memory::assemble_system_prompt(container.store.root(), &agent_id, &session_id).unwrap_or_default();

            // Recovered ask-user answers (`spec.md` invariant 9): prepend
            // them to this turn's prompt and drop the file once consumed.
            let recovered = fleetcore_store::questions::take_late_answers(container.store.root(), &agent_id, &session_id).unwrap_or_default();
            let prompt = if recovered.is_empty() {
                body.prompt
            } else {
                let mut block = String::from("Recovered ask-user answers from a previous turn:\n");
                for entry in &recovered {
                    block.push_str(&format!("- Q: {}\n  A: {}\n", entry.question, entry.answer));
                }
                block.push('\n');
                block.push_str(&body.prompt);
                block
            };

            let mut req = TurnRequest::new(prompt, SESSION_TIMEOUT);
            req.system_prompt = Some(system_prompt);
            req.resume_session_id = Some(session_id.as_str().to_string());

            let session_id_str = session_id.as_str().to_string();
            let event_req_id = req_id.clone();
            let events_out = outbound.clone();
            let outcome = container
                .adapter
                .run_streaming(&req, move |event| {
                    // `session.abort` (or connection teardown) trips this
                    // flag; further events are swallowed but the subprocess
                    // still runs to completion (`spec.md` §4.6).
                    if abort_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    let kind = event.kind();
                    let payload = match event {
                        NormalizedEvent::Thinking(v)
                        | NormalizedEvent::Text(v)
                        | NormalizedEvent::Result(v)
                        | NormalizedEvent::ToolUse(v)
                        | NormalizedEvent::ToolUseStart(v)
                        | NormalizedEvent::ToolInputDelta(v)
                        | NormalizedEvent::ToolUseStop(v)
                        | NormalizedEvent::ToolResult(v)
                        | NormalizedEvent::Event(v) => v,
                    };
                    if let Ok(envelope) = ServerEnvelope::with_body(
                        format!("session.{kind}"),
                        event_req_id.clone(),
                        &json!({"sessionId": session_id_str, "payload": payload}),
                    ) {
                        let _ = events_out.send(envelope_line(&envelope));
                    }
                })
                .await;

            conn_state.forget_session(session_id.as_str());

            let line = match outcome {
                Ok(result) => ServerEnvelope::with_body(
                    "session.done",
                    req_id,
                    &json!({"sessionId": session_id.as_str(), "durationMs": result.duration.as_millis() as u64}),
                )
                .unwrap_or_else(|_| error_envelope("session.error", None, "failed to serialize response")),
                Err(e) => error_envelope("session.error", req_id, format!("{e} (sessionId={})", session_id.as_str())),
            };
            let _ = outbound.send(envelope_line(&line));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_wrong_length() {
        assert!(!constant_time_eq("abc", "ab"));
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secre1"));
    }

    #[test]
    fn error_envelope_carries_named_kind() {
        let env = error_envelope("session.error", Some("r1".to_string()), "boom");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "session.error");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["reqId"], "r1");
    }
}
