//! Spawns the external LLM-CLI binary and streams its normalized events
//! (`spec.md` §4.5).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use log::warn;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout as tokio_timeout;

use crate::env::sanitized_env;
use crate::error::AdapterError;
use crate::events::{parse_line, NormalizedEvent};

/// Grace period between the graceful-terminate signal and the hard kill
/// (`spec.md` §4.5).
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One streaming or one-shot invocation of the LLM-CLI (`spec.md` §4.4's
/// "resume in streaming mode" and §4.5's one-shot `query` mode).
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub resume_session_id: Option<String>,
    pub additional_dirs: Vec<PathBuf>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: Option<String>,
    pub timeout: Duration,
    /// Triage's one-shot mode: no session is persisted for this call.
    pub no_session_persistence: bool,
}

impl TurnRequest {
    pub fn new(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            resume_session_id: None,
            additional_dirs: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode: None,
            timeout,
            no_session_persistence: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub markdown: String,
    pub duration: Duration,
}

/// Drives the `llm-cli` subprocess. `binary` is the path to the
/// interactive-LLM executable; it is treated as an opaque black box that
/// emits one JSON object per stdout line.
pub struct CliAdapter {
    binary: PathBuf,
}

impl CliAdapter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn build_command(&self, req: &TurnRequest, output_format: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--print")
            .arg("--output-format")
            .arg(output_format)
            .arg("--input-format")
            .arg("text");

        if let Some(system_prompt) = &req.system_prompt {
            cmd.arg("--append-system-prompt").arg(system_prompt);
        }
        if let Some(session_id) = &req.resume_session_id {
            cmd.arg("--resume").arg(session_id);
        }
        for dir in &req.additional_dirs {
            cmd.arg("--add-dir").arg(dir);
        }
        for tool in &req.disallowed_tools {
            cmd.arg("--disallowed-tools").arg(tool);
        }
        if let Some(mode) = &req.permission_mode {
            cmd.arg("--permission-mode").arg(mode);
        }
        if req.no_session_persistence {
            cmd.arg("--no-session-persistence");
        }
        cmd.arg(&req.prompt);

        cmd.env_clear();
        cmd.envs(sanitized_env());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd
    }

    /// Streaming mode: dispatch each normalized event to `on_event` as it
    /// arrives, in the LLM-CLI's line order.
    pub async fn run_streaming<F>(
        &self,
        req: &TurnRequest,
        mut on_event: F,
    ) -> Result<TurnOutcome, AdapterError>
    where
        F: FnMut(NormalizedEvent),
    {
        let start = Instant::now();
        let mut cmd = self.build_command(req, "stream-json");
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();
        let mut markdown = String::new();

        let read_loop = async {
            while let Ok(Some(line)) = lines.next_line().await {
                let event = parse_line(&line);
                if let Some(fragment) = event.markdown_fragment() {
                    markdown.push_str(&fragment);
                }
                on_event(event);
            }
        };

        match tokio_timeout(req.timeout, read_loop).await {
            Ok(()) => {
                let status = child.wait().await?;
                let duration = start.elapsed();
                if status.success() {
                    Ok(TurnOutcome { markdown, duration })
                } else {
                    Err(AdapterError::NonZeroExit {
                        code: status.code(),
                        signal: unix_signal(&status),
                        duration,
                    })
                }
            }
            Err(_elapsed) => {
                warn!(
                    "llm-cli exceeded {:?}, sending graceful terminate",
                    req.timeout
                );
                terminate_then_kill(&mut child).await;
                Err(AdapterError::Timeout {
                    duration: start.elapsed(),
                })
            }
        }
    }

    /// One-shot mode: run to completion, parse the final JSON envelope,
    /// and return its `result` field.
    pub async fn query(&self, req: &TurnRequest) -> Result<String, AdapterError> {
        let start = Instant::now();
        let mut cmd = self.build_command(req, "json");
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();
        let mut last_object = serde_json::Value::Null;

        let read_loop = async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                    last_object = value;
                }
            }
        };

        match tokio_timeout(req.timeout, read_loop).await {
            Ok(()) => {
                let status = child.wait().await?;
                let duration = start.elapsed();
                if !status.success() {
                    return Err(AdapterError::NonZeroExit {
                        code: status.code(),
                        signal: unix_signal(&status),
                        duration,
                    });
                }
                last_object
                    .get("result")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                    .ok_or(AdapterError::MissingResult)
            }
            Err(_elapsed) => {
                terminate_then_kill(&mut child).await;
                Err(AdapterError::Timeout {
                    duration: start.elapsed(),
                })
            }
        }
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
async fn terminate_then_kill(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is the live child we just spawned; SIGTERM asks it
        // to shut down before we escalate to a hard kill.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio_timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn terminate_then_kill(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
    let _ = tokio_timeout(KILL_GRACE, child.wait()).await;
}
