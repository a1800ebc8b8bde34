//! Three-tier memory notes: system, agent, session (`spec.md` §3/§4.3).

use std::fs;
use std::path::Path;

use fleetcore_types::ids::{AgentId, SessionId};

use crate::error::StoreError;
use crate::layout;

fn read_note(path: &Path) -> Result<String, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_note(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

pub fn read_system_memory(root: &Path) -> Result<String, StoreError> {
    read_note(&layout::system_memory_path(root))
}

pub fn write_system_memory(root: &Path, content: &str) -> Result<(), StoreError> {
    write_note(&layout::system_memory_path(root), content)
}

pub fn read_agent_memory(root: &Path, agent_id: &AgentId) -> Result<String, StoreError> {
    read_note(&layout::agent_memory_path(root, agent_id)?)
}

pub fn write_agent_memory(root: &Path, agent_id: &AgentId, content: &str) -> Result<(), StoreError> {
    write_note(&layout::agent_memory_path(root, agent_id)?, content)
}

pub fn read_session_memory(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<String, StoreError> {
    read_note(&layout::session_memory_path(root, agent_id, session_id)?)
}

pub fn write_session_memory(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
    content: &str,
) -> Result<(), StoreError> {
    write_note(
        &layout::session_memory_path(root, agent_id, session_id)?,
        content,
    )
}

/// The three tiers concatenated top-down, for injection into the LLM-CLI
/// system prompt (`spec.md` §4.4 "systemPrompt assembled from the three
/// memory tiers").
pub fn assemble_system_prompt(
    root: &Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<String, StoreError> {
    let system = read_system_memory(root)?;
    let agent = read_agent_memory(root, agent_id)?;
    let session = read_session_memory(root, agent_id, session_id)?;
    let mut parts = Vec::new();
    if !system.trim().is_empty() {
        parts.push(system);
    }
    if !agent.trim().is_empty() {
        parts.push(agent);
    }
    if !session.trim().is_empty() {
        parts.push(session);
    }
    Ok(parts.join("\n\n"))
}
