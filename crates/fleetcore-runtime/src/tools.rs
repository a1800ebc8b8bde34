//! Tool registry (`spec.md` §4.7): hierarchical discovery over bundled,
//! project-root, and ancestor-chain tool directories, and execution of the
//! winning manifest as an external process.
//!
//! The source's dynamic `require()`-based loading has no Rust analogue;
//! per `spec.md` §9 "Dynamic tool dispatch", tools are represented here as
//! a static `{name, execute}` manifest (a `tool.toml` naming an external
//! command) discovered by file scan, not by loading arbitrary code.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use fleetcore_broker::Broker;
use fleetcore_llmcli::env::sanitized_env;
use fleetcore_store::{layout, AgentStore};
use fleetcore_types::agent::AgentConfig;
use fleetcore_types::ids::{AgentId, SessionId};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::ask_user::AskUserHandle;
use crate::error::RuntimeError;
use crate::supervisor::ServiceSupervisor;

/// One `tool.toml` manifest: an external-process tool (`spec.md` §4.7
/// "The result shape is `{output, isError}`").
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: Value,
    pub is_error: bool,
}

/// Everything `execute(input, ctx)` is handed alongside the raw input
/// (`spec.md` §4.7 "enriched context").
///
/// `services` is the late-bound handle to the service supervisor
/// (`SPEC_FULL.md` §9 "cyclic module references"): the tool registry is
/// built before the supervisor exists, so bootstrap sets this cell exactly
/// once, after both are constructed.
pub struct ToolContext {
    pub agent_id: AgentId,
    pub session_id: Option<SessionId>,
    pub project_root: PathBuf,
    pub agent_config: AgentConfig,
    pub secrets: HashMap<String, String>,
    pub broker: Arc<Broker>,
    pub services: Arc<OnceCell<Arc<ServiceSupervisor>>>,
    pub ask_user: Arc<AskUserHandle>,
}

#[derive(Debug, Deserialize)]
struct AskUserInput {
    question: String,
    #[serde(default)]
    options: Option<Vec<String>>,
    #[serde(default)]
    context: Option<Value>,
}

pub struct ToolRegistry {
    bundled_dir: PathBuf,
    store: AgentStore,
}

fn parse_secrets_env(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn scan_dir(dir: &Path) -> Vec<ToolDef> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|e| e.to_str()) == Some("toml"))
        .filter_map(|e| {
            let raw = std::fs::read_to_string(e.path()).ok()?;
            toml::from_str::<ToolDef>(&raw).ok()
        })
        .collect()
}

impl ToolRegistry {
    pub fn new(bundled_dir: impl Into<PathBuf>, store: AgentStore) -> Self {
        Self {
            bundled_dir: bundled_dir.into(),
            store,
        }
    }

    /// Bundled < project-root < ancestor-chain (root → self); later
    /// entries override earlier ones by name (`spec.md` §4.7).
    pub fn list_agent_tools(&self, agent_id: &AgentId) -> Vec<ToolDef> {
        let mut by_name: HashMap<String, ToolDef> = HashMap::new();

        for def in scan_dir(&self.bundled_dir) {
            by_name.insert(def.name.clone(), def);
        }
        for def in scan_dir(&self.store.root().join("tools")) {
            by_name.insert(def.name.clone(), def);
        }
        let segments = agent_id.segments();
        for depth in 1..=segments.len() {
            let Ok(ancestor) = AgentId::new(&segments[..depth].join("/")) else {
                continue;
            };
            let Ok(dir) = layout::agent_tools_dir(self.store.root(), &ancestor) else {
                continue;
            };
            for def in scan_dir(&dir) {
                by_name.insert(def.name.clone(), def);
            }
        }

        by_name.into_values().collect()
    }

    pub async fn execute_tool(
        &self,
        ctx: &ToolContext,
        tool_name: &str,
        input: Value,
    ) -> Result<ToolResult, RuntimeError> {
        if tool_name == "ask-user" {
            return self.execute_ask_user(ctx, input).await;
        }

        let tools = self.list_agent_tools(&ctx.agent_id);
        let def = tools
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| RuntimeError::ToolNotFound(tool_name.to_string()))?;

        let Some((program, args)) = def.command.split_first() else {
            return Ok(ToolResult {
                output: Value::String("tool manifest has an empty command".to_string()),
                is_error: true,
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env_clear();
        cmd.envs(sanitized_env());
        cmd.envs(&ctx.secrets);
        cmd.env("FLEETCORE_AGENT_ID", ctx.agent_id.as_str());
        if let Some(session_id) = &ctx.session_id {
            cmd.env("FLEETCORE_SESSION_ID", session_id.as_str());
        }
        cmd.env("FLEETCORE_PROJECT_ROOT", &ctx.project_root);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&serde_json::to_vec(&input)?).await;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Ok(ToolResult {
                output: Value::String(stderr),
                is_error: true,
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let parsed = serde_json::from_str::<Value>(&stdout).unwrap_or(Value::String(stdout));
        Ok(ToolResult {
            output: parsed,
            is_error: false,
        })
    }

    /// The one built-in tool every agent gets without a manifest
    /// (`spec.md` §4.6 "Ask-user"): pauses the turn until a control-surface
    /// client answers, or the five-minute timeout elapses.
    async fn execute_ask_user(&self, ctx: &ToolContext, input: Value) -> Result<ToolResult, RuntimeError> {
        let input: AskUserInput = serde_json::from_value(input)?;
        let Some(session_id) = ctx.session_id.clone() else {
            return Ok(ToolResult {
                output: Value::String("ask-user requires an active session".to_string()),
                is_error: true,
            });
        };
        let answer = ctx
            .ask_user
            .ask(ctx.agent_id.clone(), session_id, input.question, input.options, input.context)
            .await;
        Ok(match answer {
            Some(answer) => ToolResult {
                output: Value::String(answer),
                is_error: false,
            },
            None => ToolResult {
                output: Value::String("ask-user timed out waiting for an answer".to_string()),
                is_error: true,
            },
        })
    }
}

pub fn read_agent_secrets(root: &Path, agent_id: &AgentId) -> Result<HashMap<String, String>, RuntimeError> {
    let path = layout::agent_secrets_path(root, agent_id)?;
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(parse_secrets_env(&raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcore_store::AgentCreateOptions;

    #[test]
    fn parses_kv_secrets_skipping_comments() {
        let secrets = parse_secrets_env("# comment\nAPI_KEY=abc123\n\nOTHER = value \n");
        assert_eq!(secrets.get("API_KEY"), Some(&"abc123".to_string()));
        assert_eq!(secrets.get("OTHER"), Some(&"value".to_string()));
    }

    #[test]
    fn agent_tools_override_project_tools_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let agent_id = AgentId::new("main").unwrap();
        store.create_agent(&agent_id, AgentCreateOptions::default()).unwrap();

        std::fs::create_dir_all(tmp.path().join("tools")).unwrap();
        std::fs::write(
            tmp.path().join("tools").join("shared.toml"),
            "name = \"shared\"\ncommand = [\"echo\", \"project\"]\n",
        )
        .unwrap();
        std::fs::create_dir_all(tmp.path().join("main").join("tools")).unwrap();
        std::fs::write(
            tmp.path().join("main").join("tools").join("shared.toml"),
            "name = \"shared\"\ncommand = [\"echo\", \"agent\"]\n",
        )
        .unwrap();

        let registry = ToolRegistry::new(tmp.path().join("bundled"), store);
        let tools = registry.list_agent_tools(&agent_id);
        let shared = tools.iter().find(|t| t.name == "shared").unwrap();
        assert_eq!(shared.command, vec!["echo".to_string(), "agent".to_string()]);
    }
}
