use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted `(pattern, addedAt)` pair (`spec.md` §3). Auto-subscriptions
/// (`agent/{id}`) are never represented by this type — they are computed,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub pattern: String,
    pub added_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, added_at: DateTime<Utc>) -> Self {
        Self {
            pattern: pattern.into(),
            added_at,
        }
    }
}
