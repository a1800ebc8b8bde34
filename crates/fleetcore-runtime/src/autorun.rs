//! `autoRun` config precedence (`spec.md` §4.4): session overrides agent
//! overrides built-in defaults.

use fleetcore_types::agent::{AgentConfig, AutoRunConfig, AutoRunDetail};
use fleetcore_types::session::SessionMeta;

pub const DEFAULT_DEBOUNCE_MS: u64 = 30_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 20;
pub const DEFAULT_TRIAGE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// The fully-resolved `autoRun` settings for one `(agentId, sessionId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveAutoRun {
    pub enabled: bool,
    pub debounce_ms: u64,
    pub max_batch_size: usize,
    pub triage_timeout_ms: u64,
    pub execution_timeout_ms: u64,
}

impl EffectiveAutoRun {
    fn disabled() -> Self {
        Self {
            enabled: false,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            triage_timeout_ms: DEFAULT_TRIAGE_TIMEOUT_MS,
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
        }
    }

    fn from_detail(enabled: bool, detail: Option<&AutoRunDetail>) -> Self {
        Self {
            enabled,
            debounce_ms: detail.and_then(|d| d.debounce_ms).unwrap_or(DEFAULT_DEBOUNCE_MS),
            max_batch_size: detail
                .and_then(|d| d.max_batch_size)
                .unwrap_or(DEFAULT_MAX_BATCH_SIZE),
            triage_timeout_ms: detail
                .and_then(|d| d.triage_timeout_ms)
                .unwrap_or(DEFAULT_TRIAGE_TIMEOUT_MS),
            execution_timeout_ms: detail
                .and_then(|d| d.execution_timeout_ms)
                .unwrap_or(DEFAULT_EXECUTION_TIMEOUT_MS),
        }
    }

    pub fn triage_model<'a>(&self, session: &'a SessionMeta, agent: &'a AgentConfig) -> Option<&'a str> {
        session
            .auto_run
            .as_ref()
            .and_then(AutoRunConfig::detail)
            .and_then(|d| d.triage_model.as_deref())
            .or_else(|| {
                agent
                    .auto_run
                    .as_ref()
                    .and_then(AutoRunConfig::detail)
                    .and_then(|d| d.triage_model.as_deref())
            })
    }
}

/// Session `autoRun` wins over agent `autoRun`; absent at both levels means
/// disabled (`spec.md` §4.4 "If neither level enables it, the turn manager
/// ignores the delivery").
pub fn resolve(agent: &AgentConfig, session: &SessionMeta) -> EffectiveAutoRun {
    if let Some(session_auto_run) = &session.auto_run {
        return EffectiveAutoRun::from_detail(session_auto_run.enabled(), session_auto_run.detail());
    }
    if let Some(agent_auto_run) = &agent.auto_run {
        return EffectiveAutoRun::from_detail(agent_auto_run.enabled(), agent_auto_run.detail());
    }
    EffectiveAutoRun::disabled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn agent_with(auto_run: Option<AutoRunConfig>) -> AgentConfig {
        AgentConfig {
            auto_run,
            ..Default::default()
        }
    }

    fn session_with(auto_run: Option<AutoRunConfig>) -> SessionMeta {
        let mut meta = SessionMeta::new_default("main", Utc::now());
        meta.auto_run = auto_run;
        meta
    }

    #[test]
    fn neither_level_enabled_is_disabled() {
        let resolved = resolve(&agent_with(None), &session_with(None));
        assert!(!resolved.enabled);
    }

    #[test]
    fn agent_level_bool_enables_with_defaults() {
        let resolved = resolve(&agent_with(Some(AutoRunConfig::Bool(true))), &session_with(None));
        assert!(resolved.enabled);
        assert_eq!(resolved.debounce_ms, DEFAULT_DEBOUNCE_MS);
    }

    #[test]
    fn session_level_overrides_agent_level() {
        let agent = agent_with(Some(AutoRunConfig::Bool(true)));
        let session = session_with(Some(AutoRunConfig::Detail(AutoRunDetail {
            enabled: false,
            triage_model: None,
            debounce_ms: None,
            max_batch_size: None,
            triage_timeout_ms: None,
            execution_timeout_ms: None,
        })));
        let resolved = resolve(&agent, &session);
        assert!(!resolved.enabled);
    }

    #[test]
    fn session_detail_custom_fields_win() {
        let agent = agent_with(Some(AutoRunConfig::Bool(true)));
        let session = session_with(Some(AutoRunConfig::Detail(AutoRunDetail {
            enabled: true,
            triage_model: Some("fast-model".to_string()),
            debounce_ms: Some(500),
            max_batch_size: Some(3),
            triage_timeout_ms: None,
            execution_timeout_ms: None,
        })));
        let resolved = resolve(&agent, &session);
        assert_eq!(resolved.debounce_ms, 500);
        assert_eq!(resolved.max_batch_size, 3);
        assert_eq!(resolved.triage_timeout_ms, DEFAULT_TRIAGE_TIMEOUT_MS);
    }
}
