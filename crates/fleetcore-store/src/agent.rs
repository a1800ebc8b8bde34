//! Agent CRUD and the instructions chain (`spec.md` §4.3).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fleetcore_types::agent::{AgentConfig, AgentConfigPatch};
use fleetcore_types::ids::{AgentId, SessionId};
use fleetcore_types::subscription::Subscription;

use crate::error::StoreError;
use crate::layout::{self, is_reserved};
use crate::session::{self, SessionCreateOptions};
use crate::template;

/// Explicit overrides applied after template cloning (`spec.md` §4.3):
/// written after the template's own defaults, never blocked by the
/// "existing files are never overwritten" rule since these mutate the
/// parsed config document, not raw template files.
#[derive(Debug, Clone, Default)]
pub struct AgentCreateOptions {
    pub name: Option<String>,
    pub description: Option<String>,
    pub work_directories: Vec<PathBuf>,
    pub default_model: Option<String>,
    pub initial_subscriptions: Vec<String>,
    pub heartbeat: Option<String>,
}

/// The agent/session store, rooted at one project directory.
#[derive(Debug, Clone)]
pub struct AgentStore {
    root: PathBuf,
}

impl AgentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn template_root(&self) -> PathBuf {
        self.root.join("templates").join("default")
    }

    /// Full recursive scan of the project root, skipping reserved
    /// directory names (`spec.md` §4.3 `listAgents`).
    pub fn list_agents(&self) -> Result<Vec<AgentId>, StoreError> {
        let mut found = Vec::new();
        self.scan_dir(&self.root, &[], &mut found)?;
        found.sort();
        Ok(found)
    }

    fn scan_dir(
        &self,
        dir: &Path,
        prefix: &[String],
        found: &mut Vec<AgentId>,
    ) -> Result<(), StoreError> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_reserved(&name) {
                continue;
            }
            let mut segments = prefix.to_vec();
            segments.push(name);
            let candidate_id = segments.join("/");
            if entry.path().join("jvAgent.json").is_file() {
                if let Ok(agent_id) = AgentId::new(&candidate_id) {
                    found.push(agent_id);
                }
            }
            self.scan_dir(&entry.path(), &segments, found)?;
        }
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Result<AgentConfig, StoreError> {
        let path = layout::agent_config_path(&self.root, agent_id)?;
        let raw = fs::read_to_string(&path)
            .map_err(|_| StoreError::NotFound(format!("agent {agent_id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_agent_config(
        &self,
        agent_id: &AgentId,
        config: &AgentConfig,
    ) -> Result<(), StoreError> {
        let path = layout::agent_config_path(&self.root, agent_id)?;
        fs::write(&path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    pub fn create_agent(
        &self,
        agent_id: &AgentId,
        options: AgentCreateOptions,
    ) -> Result<AgentConfig, StoreError> {
        let dir = layout::agent_dir(&self.root, agent_id)?;
        if dir.join("jvAgent.json").is_file() {
            return Err(StoreError::AlreadyExists(format!("agent {agent_id}")));
        }

        let name = options.name.clone().unwrap_or_else(|| agent_id.to_string());
        let description = options.description.clone().unwrap_or_default();
        let id_str = agent_id.to_string();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("id", id_str.as_str()),
            ("name", name.as_str()),
            ("description", description.as_str()),
        ]);
        template::scaffold(&self.template_root(), &dir, &vars)?;

        fs::create_dir_all(dir.join("workspace"))?;
        fs::create_dir_all(dir.join("tmp"))?;
        fs::create_dir_all(dir.join("tools"))?;
        fs::create_dir_all(dir.join("memory"))?;
        if !dir.join("memory").join("notes.md").exists() {
            fs::write(dir.join("memory").join("notes.md"), "")?;
        }
        if !dir.join("CLAUDE.md").exists() {
            fs::write(&dir.join("CLAUDE.md"), "")?;
        }
        if !dir.join("secrets.env").exists() {
            fs::write(dir.join("secrets.env"), "")?;
        }

        let now = Utc::now();
        let subscriptions = options
            .initial_subscriptions
            .into_iter()
            .map(|pattern| Subscription::new(pattern, now))
            .collect();
        let config = AgentConfig {
            description,
            work_directories: options.work_directories,
            default_model: options.default_model,
            subscriptions,
            heartbeat: options.heartbeat,
            auto_run: None,
        };
        self.write_agent_config(agent_id, &config)?;

        session::ensure_main_session(&self.root, agent_id, now)?;

        Ok(config)
    }

    pub fn update_agent(
        &self,
        agent_id: &AgentId,
        patch: AgentConfigPatch,
    ) -> Result<AgentConfig, StoreError> {
        let mut config = self.get_agent(agent_id)?;
        config.apply_patch(patch);
        self.write_agent_config(agent_id, &config)?;
        Ok(config)
    }

    pub fn delete_agent(&self, agent_id: &AgentId) -> Result<(), StoreError> {
        let dir = layout::agent_dir(&self.root, agent_id)?;
        if !dir.exists() {
            return Err(StoreError::NotFound(format!("agent {agent_id}")));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// The effective instructions for a (possibly nested) agent: ancestor
    /// `CLAUDE.md` contents concatenated root-down-to-self (`spec.md`
    /// §4.3 "CLAUDE-chain"). A missing ancestor file contributes nothing.
    pub fn effective_instructions(&self, agent_id: &AgentId) -> Result<String, StoreError> {
        let segments = agent_id.segments();
        let mut chain = Vec::new();
        for depth in 1..=segments.len() {
            let ancestor_id = AgentId::new(&segments[..depth].join("/"))?;
            let path = layout::agent_instructions_path(&self.root, &ancestor_id)?;
            match fs::read_to_string(&path) {
                Ok(content) if !content.trim().is_empty() => chain.push(content),
                _ => {}
            }
        }
        Ok(chain.join("\n\n"))
    }

    pub fn read_instructions(&self, agent_id: &AgentId) -> Result<String, StoreError> {
        let path = layout::agent_instructions_path(&self.root, agent_id)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_instructions(
        &self,
        agent_id: &AgentId,
        instructions: &str,
    ) -> Result<(), StoreError> {
        let path = layout::agent_instructions_path(&self.root, agent_id)?;
        fs::write(&path, instructions)?;
        Ok(())
    }

    // -- Subscription persistence, called by fleetcore-broker --------------

    pub fn read_agent_subscriptions(
        &self,
        agent_id: &AgentId,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.get_agent(agent_id)?.subscriptions)
    }

    pub fn write_agent_subscriptions(
        &self,
        agent_id: &AgentId,
        subscriptions: Vec<Subscription>,
    ) -> Result<(), StoreError> {
        let mut config = self.get_agent(agent_id)?;
        config.subscriptions = subscriptions;
        self.write_agent_config(agent_id, &config)
    }

    pub fn read_session_subscriptions(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(session::get_session(&self.root, agent_id, session_id)?.subscriptions)
    }

    pub fn write_session_subscriptions(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
        subscriptions: Vec<Subscription>,
    ) -> Result<(), StoreError> {
        let mut meta = session::get_session(&self.root, agent_id, session_id)?;
        meta.subscriptions = subscriptions;
        session::save_session(&self.root, agent_id, &meta)
    }

    pub fn list_sessions(&self, agent_id: &AgentId) -> Result<Vec<SessionId>, StoreError> {
        session::list_sessions(&self.root, agent_id).map(|metas| {
            metas
                .into_iter()
                .filter_map(|meta| SessionId::new(&meta.id).ok())
                .collect()
        })
    }

    pub fn options(&self) -> SessionCreateOptions {
        SessionCreateOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_agent_scaffolds_main_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let id = AgentId::new("researcher").unwrap();
        store
            .create_agent(&id, AgentCreateOptions::default())
            .unwrap();

        assert!(layout::agent_config_path(tmp.path(), &id).unwrap().exists());
        let sessions = store.list_sessions(&id).unwrap();
        assert_eq!(sessions, vec![SessionId::main()]);
    }

    #[test]
    fn create_agent_twice_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        let id = AgentId::new("researcher").unwrap();
        store
            .create_agent(&id, AgentCreateOptions::default())
            .unwrap();
        assert!(store
            .create_agent(&id, AgentCreateOptions::default())
            .is_err());
    }

    #[test]
    fn nested_agent_listed_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        store
            .create_agent(&AgentId::new("main").unwrap(), AgentCreateOptions::default())
            .unwrap();
        store
            .create_agent(
                &AgentId::new("research/deep").unwrap(),
                AgentCreateOptions::default(),
            )
            .unwrap();

        let mut agents: Vec<String> = store
            .list_agents()
            .unwrap()
            .into_iter()
            .map(|a| a.to_string())
            .collect();
        agents.sort();
        assert_eq!(agents, vec!["main", "research/deep"]);
    }

    #[test]
    fn instructions_chain_concatenates_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path());
        store
            .create_agent(&AgentId::new("research").unwrap(), AgentCreateOptions::default())
            .unwrap();
        store
            .write_instructions(&AgentId::new("research").unwrap(), "root rules")
            .unwrap();
        store
            .create_agent(
                &AgentId::new("research/deep").unwrap(),
                AgentCreateOptions::default(),
            )
            .unwrap();
        store
            .write_instructions(&AgentId::new("research/deep").unwrap(), "deep rules")
            .unwrap();

        let chain = store
            .effective_instructions(&AgentId::new("research/deep").unwrap())
            .unwrap();
        assert_eq!(chain, "root rules\n\ndeep rules");
    }
}
