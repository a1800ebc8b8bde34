//! On-disk layout (`spec.md` §6). Every path here is derived from
//! `fleetcore_core::resolve_under_root`, so a caller can never be handed a
//! path outside the project root.

use std::path::{Path, PathBuf};

use fleetcore_types::ids::{AgentId, SessionId};

use crate::error::StoreError;

/// Directory names that are part of the store's own layout, never agent IDs.
pub const RESERVED_NAMES: &[&str] = &["sessions", "tools", "workspace", "tmp", "memory"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name) || name.starts_with('.')
}

pub fn agent_dir(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(fleetcore_core::resolve_under_root(root, agent_id.as_str())?)
}

pub fn agent_config_path(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(agent_dir(root, agent_id)?.join("jvAgent.json"))
}

pub fn agent_instructions_path(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(agent_dir(root, agent_id)?.join("CLAUDE.md"))
}

pub fn agent_memory_path(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(agent_dir(root, agent_id)?.join("memory").join("notes.md"))
}

pub fn agent_workspace_dir(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(agent_dir(root, agent_id)?.join("workspace"))
}

pub fn agent_tmp_dir(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(agent_dir(root, agent_id)?.join("tmp"))
}

pub fn agent_tools_dir(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(agent_dir(root, agent_id)?.join("tools"))
}

pub fn agent_secrets_path(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(agent_dir(root, agent_id)?.join("secrets.env"))
}

pub fn sessions_dir(root: &Path, agent_id: &AgentId) -> Result<PathBuf, StoreError> {
    Ok(agent_dir(root, agent_id)?.join("sessions"))
}

pub fn session_meta_path(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<PathBuf, StoreError> {
    Ok(sessions_dir(root, agent_id)?.join(format!("{}.json", session_id.as_str())))
}

pub fn session_log_path(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<PathBuf, StoreError> {
    Ok(sessions_dir(root, agent_id)?.join(format!("{}.jsonl", session_id.as_str())))
}

/// The session's own subtree (`workspace/`, `tmp/`, `memory/notes.md`),
/// distinct from its `<sid>.json`/`<sid>.jsonl` siblings.
pub fn session_root_dir(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<PathBuf, StoreError> {
    Ok(sessions_dir(root, agent_id)?.join(session_id.as_str()))
}

pub fn session_workspace_dir(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<PathBuf, StoreError> {
    Ok(session_root_dir(root, agent_id, session_id)?.join("workspace"))
}

pub fn session_tmp_dir(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<PathBuf, StoreError> {
    Ok(session_root_dir(root, agent_id, session_id)?.join("tmp"))
}

pub fn session_memory_path(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<PathBuf, StoreError> {
    Ok(session_root_dir(root, agent_id, session_id)?
        .join("memory")
        .join("notes.md"))
}

pub fn system_memory_path(root: &Path) -> PathBuf {
    root.join("SYSTEM.md")
}

pub fn messages_dir(root: &Path) -> PathBuf {
    root.join(".messages")
}

pub fn questions_dir(root: &Path) -> PathBuf {
    root.join(".questions")
}

pub fn question_path(root: &Path, question_id: &uuid::Uuid) -> PathBuf {
    questions_dir(root).join(format!("{question_id}.json"))
}

/// Recovered answers for a session whose asking turn ended before the
/// user replied (`spec.md` invariant 9), consumed on its next turn.
pub fn session_late_answers_path(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<PathBuf, StoreError> {
    Ok(session_root_dir(root, agent_id, session_id)?.join("late-answers.jsonl"))
}
