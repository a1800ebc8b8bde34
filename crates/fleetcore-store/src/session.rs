//! Session CRUD (`spec.md` §3/§4.3). Every agent always has a `main`
//! session; it is the only session that survives an `agent.delete`-free
//! lifetime and can never be deleted on its own.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::session::SessionMeta;
use fleetcore_types::subscription::Subscription;

use crate::error::StoreError;
use crate::layout;

/// Overrides accepted by `session.create` (`spec.md` §4.3).
#[derive(Debug, Clone, Default)]
pub struct SessionCreateOptions {
    pub id: Option<String>,
    pub title: Option<String>,
    pub work_directories: Vec<PathBuf>,
    pub initial_subscriptions: Vec<String>,
}

fn scaffold_session_dirs(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<(), StoreError> {
    fs::create_dir_all(layout::session_workspace_dir(root, agent_id, session_id)?)?;
    fs::create_dir_all(layout::session_tmp_dir(root, agent_id, session_id)?)?;
    let memory_path = layout::session_memory_path(root, agent_id, session_id)?;
    if let Some(parent) = memory_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if !memory_path.exists() {
        fs::write(&memory_path, "")?;
    }
    Ok(())
}

/// Called once from `AgentStore::create_agent`: lays down `main` if it
/// doesn't already exist. Idempotent so re-running agent creation logic
/// (e.g. after a partial failure) never clobbers an existing main session.
pub fn ensure_main_session(
    root: &std::path::Path,
    agent_id: &AgentId,
    now: DateTime<Utc>,
) -> Result<SessionMeta, StoreError> {
    let main_id = SessionId::main();
    let meta_path = layout::session_meta_path(root, agent_id, &main_id)?;
    if meta_path.is_file() {
        let raw = fs::read_to_string(&meta_path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    fs::create_dir_all(layout::sessions_dir(root, agent_id)?)?;
    scaffold_session_dirs(root, agent_id, &main_id)?;
    let meta = SessionMeta::new_default("main", now);
    fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;
    Ok(meta)
}

pub fn create_session(
    root: &std::path::Path,
    agent_id: &AgentId,
    options: SessionCreateOptions,
    now: DateTime<Utc>,
) -> Result<SessionMeta, StoreError> {
    let raw_id = options
        .id
        .unwrap_or_else(|| format!("s-{}", uuid::Uuid::new_v4()));
    let session_id = SessionId::new(&raw_id)?;
    if session_id.is_main() {
        return Err(StoreError::AlreadyExists("main".to_string()));
    }
    let meta_path = layout::session_meta_path(root, agent_id, &session_id)?;
    if meta_path.is_file() {
        return Err(StoreError::AlreadyExists(format!("session {session_id}")));
    }

    fs::create_dir_all(layout::sessions_dir(root, agent_id)?)?;
    scaffold_session_dirs(root, agent_id, &session_id)?;

    let subscriptions = options
        .initial_subscriptions
        .into_iter()
        .map(|pattern| Subscription::new(pattern, now))
        .collect();
    let meta = SessionMeta {
        id: session_id.as_str().to_string(),
        title: options.title.unwrap_or_default(),
        is_default: false,
        created_at: now,
        last_used_at: now,
        subscriptions,
        work_directories: options.work_directories,
        auto_run: None,
    };
    fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;
    Ok(meta)
}

pub fn get_session(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<SessionMeta, StoreError> {
    let path = layout::session_meta_path(root, agent_id, session_id)?;
    let raw = fs::read_to_string(&path)
        .map_err(|_| StoreError::NotFound(format!("session {session_id}")))?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_session(
    root: &std::path::Path,
    agent_id: &AgentId,
    meta: &SessionMeta,
) -> Result<(), StoreError> {
    let session_id = SessionId::new(&meta.id)?;
    let path = layout::session_meta_path(root, agent_id, &session_id)?;
    fs::write(&path, serde_json::to_string_pretty(meta)?)?;
    Ok(())
}

/// `isDefault` sessions first, then by `lastUsedAt` descending
/// (`spec.md` §4.3 `listSessions`).
pub fn list_sessions(
    root: &std::path::Path,
    agent_id: &AgentId,
) -> Result<Vec<SessionMeta>, StoreError> {
    let dir = layout::sessions_dir(root, agent_id)?;
    let mut metas = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            metas.push(serde_json::from_str::<SessionMeta>(&raw)?);
        }
    }
    metas.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then_with(|| b.last_used_at.cmp(&a.last_used_at))
    });
    Ok(metas)
}

pub fn delete_session(
    root: &std::path::Path,
    agent_id: &AgentId,
    session_id: &SessionId,
) -> Result<(), StoreError> {
    if session_id.is_main() {
        return Err(StoreError::MainSessionProtected);
    }
    let meta_path = layout::session_meta_path(root, agent_id, session_id)?;
    if !meta_path.is_file() {
        return Err(StoreError::NotFound(format!("session {session_id}")));
    }
    fs::remove_file(&meta_path)?;
    let log_path = layout::session_log_path(root, agent_id, session_id)?;
    if log_path.is_file() {
        fs::remove_file(&log_path)?;
    }
    let root_dir = layout::session_root_dir(root, agent_id, session_id)?;
    if root_dir.is_dir() {
        fs::remove_dir_all(&root_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn agent(tmp: &std::path::Path) -> AgentId {
        let id = AgentId::new("researcher").unwrap();
        fs::create_dir_all(tmp.join("researcher")).unwrap();
        id
    }

    #[test]
    fn ensure_main_session_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = agent(tmp.path());
        let first = ensure_main_session(tmp.path(), &agent_id, Utc::now()).unwrap();
        let second = ensure_main_session(tmp.path(), &agent_id, Utc::now()).unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn main_session_cannot_be_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = agent(tmp.path());
        ensure_main_session(tmp.path(), &agent_id, Utc::now()).unwrap();
        let err = delete_session(tmp.path(), &agent_id, &SessionId::main()).unwrap_err();
        assert!(matches!(err, StoreError::MainSessionProtected));
    }

    #[test]
    fn list_sessions_orders_default_first_then_recency() {
        let tmp = tempfile::tempdir().unwrap();
        let agent_id = agent(tmp.path());
        let now = Utc::now();
        ensure_main_session(tmp.path(), &agent_id, now).unwrap();
        create_session(
            tmp.path(),
            &agent_id,
            SessionCreateOptions {
                id: Some("older".to_string()),
                ..Default::default()
            },
            now - chrono::Duration::hours(2),
        )
        .unwrap();
        create_session(
            tmp.path(),
            &agent_id,
            SessionCreateOptions {
                id: Some("newer".to_string()),
                ..Default::default()
            },
            now - chrono::Duration::minutes(1),
        )
        .unwrap();

        let ids: Vec<String> = list_sessions(tmp.path(), &agent_id)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["main", "newer", "older"]);
    }
}
