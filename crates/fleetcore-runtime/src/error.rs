use std::fmt;

/// Errors from the turn manager, tool registry, and service supervisor.
#[derive(Debug)]
pub enum RuntimeError {
    Store(fleetcore_store::StoreError),
    Broker(fleetcore_broker::BrokerError),
    Adapter(fleetcore_llmcli::AdapterError),
    Triage(fleetcore_llmcli::TriageError),
    Io(std::io::Error),
    Json(serde_json::Error),
    Toml(toml::de::Error),
    /// A named tool wasn't found in any of the three discovery tiers.
    ToolNotFound(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Store(e) => write!(f, "{e}"),
            RuntimeError::Broker(e) => write!(f, "{e}"),
            RuntimeError::Adapter(e) => write!(f, "{e}"),
            RuntimeError::Triage(e) => write!(f, "{e}"),
            RuntimeError::Io(e) => write!(f, "io error: {e}"),
            RuntimeError::Json(e) => write!(f, "json error: {e}"),
            RuntimeError::Toml(e) => write!(f, "malformed tool manifest: {e}"),
            RuntimeError::ToolNotFound(name) => write!(f, "tool not found: {name}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Store(e) => Some(e),
            RuntimeError::Broker(e) => Some(e),
            RuntimeError::Adapter(e) => Some(e),
            RuntimeError::Triage(e) => Some(e),
            RuntimeError::Io(e) => Some(e),
            RuntimeError::Json(e) => Some(e),
            RuntimeError::Toml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<fleetcore_store::StoreError> for RuntimeError {
    fn from(err: fleetcore_store::StoreError) -> Self {
        RuntimeError::Store(err)
    }
}

impl From<fleetcore_broker::BrokerError> for RuntimeError {
    fn from(err: fleetcore_broker::BrokerError) -> Self {
        RuntimeError::Broker(err)
    }
}

impl From<fleetcore_llmcli::AdapterError> for RuntimeError {
    fn from(err: fleetcore_llmcli::AdapterError) -> Self {
        RuntimeError::Adapter(err)
    }
}

impl From<fleetcore_llmcli::TriageError> for RuntimeError {
    fn from(err: fleetcore_llmcli::TriageError) -> Self {
        RuntimeError::Triage(err)
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io(err)
    }
}

impl From<toml::de::Error> for RuntimeError {
    fn from(err: toml::de::Error) -> Self {
        RuntimeError::Toml(err)
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Json(err)
    }
}
