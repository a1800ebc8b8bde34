use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AutoRunConfig;
use crate::subscription::Subscription;

/// Persisted `<sid>.json` session metadata document (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub work_directories: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_run: Option<AutoRunConfig>,
}

impl SessionMeta {
    pub fn new_default(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            is_default: true,
            created_at: now,
            last_used_at: now,
            subscriptions: Vec::new(),
            work_directories: Vec::new(),
            auto_run: None,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used_at = now;
    }
}
