use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::subscription::Subscription;

/// Detailed `autoRun` settings (`spec.md` §4.4 config precedence).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoRunDetail {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_ms: Option<u64>,
}

/// `autoRun` may be a plain bool or a detailed record (`spec.md` §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AutoRunConfig {
    Bool(bool),
    Detail(AutoRunDetail),
}

impl AutoRunConfig {
    pub fn enabled(&self) -> bool {
        match self {
            AutoRunConfig::Bool(b) => *b,
            AutoRunConfig::Detail(d) => d.enabled,
        }
    }

    pub fn detail(&self) -> Option<&AutoRunDetail> {
        match self {
            AutoRunConfig::Bool(_) => None,
            AutoRunConfig::Detail(d) => Some(d),
        }
    }
}

/// Persisted `jvAgent.json` document (`spec.md` §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub work_directories: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_run: Option<AutoRunConfig>,
}

/// Fields accepted by a partial `agent.update` (shallow merge over the
/// existing config, per `spec.md` §4.3 `updateAgent`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_directories: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_run: Option<Option<AutoRunConfig>>,
}

impl AgentConfig {
    pub fn apply_patch(&mut self, patch: AgentConfigPatch) {
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(dirs) = patch.work_directories {
            self.work_directories = dirs;
        }
        if let Some(model) = patch.default_model {
            self.default_model = model;
        }
        if let Some(heartbeat) = patch.heartbeat {
            self.heartbeat = heartbeat;
        }
        if let Some(auto_run) = patch.auto_run {
            self.auto_run = auto_run;
        }
    }
}
