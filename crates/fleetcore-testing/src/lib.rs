//! Shared test fixtures: a scratch project root pre-populated with an
//! agent, and a fake LLM-CLI shell script that other crates' tests drive
//! `CliAdapter` against instead of a real subprocess.

use std::io::Write;
use std::path::Path;

use fleetcore_store::{AgentCreateOptions, AgentStore};
use fleetcore_types::ids::AgentId;

/// A temp directory scaffolded as a project root, kept alive for the
/// fixture's lifetime (the directory is removed on drop).
pub struct ScratchProject {
    dir: tempfile::TempDir,
}

impl ScratchProject {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create scratch project directory"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> AgentStore {
        AgentStore::new(self.root())
    }

    /// Scaffolds `agent_id` with its `main` session and returns the store.
    pub fn with_agent(self, agent_id: &str) -> Self {
        let store = self.store();
        let id = AgentId::new(agent_id).expect("valid test agent id");
        store
            .create_agent(&id, AgentCreateOptions::default())
            .expect("failed to create test agent");
        self
    }
}

impl Default for ScratchProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `body` as an executable `/bin/sh` script and returns the open
/// temp file (kept alive so the path stays valid for the caller's use).
/// `body` is typically a handful of `printf '...'\n` lines emitting the
/// normalized-event JSON a real LLM-CLI invocation would print.
#[cfg(unix)]
pub fn fake_cli_script(body: &str) -> tempfile::NamedTempFile {
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::NamedTempFile::new().expect("failed to create fake CLI script");
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{body}").unwrap();
    file.flush().unwrap();
    let mut perms = file.as_file().metadata().unwrap().permissions();
    perms.set_mode(0o755);
    file.as_file().set_permissions(perms).unwrap();
    file
}

/// A fake CLI script that immediately emits a one-line `result` event and
/// exits 0 — the minimal shape `TriageClient`/one-shot `query` callers
/// need without caring about streaming.
#[cfg(unix)]
pub fn fake_cli_one_shot_result(result: &str) -> tempfile::NamedTempFile {
    fake_cli_script(&format!(r#"printf '{{"type":"result","result":"{result}"}}\n'"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_project_scaffolds_agent() {
        let project = ScratchProject::new().with_agent("main");
        let sessions = project.store().list_sessions(&AgentId::new("main").unwrap()).unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn fake_cli_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let script = fake_cli_script("printf 'hi\\n'");
        let mode = script.as_file().metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
