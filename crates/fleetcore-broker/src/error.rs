use std::fmt;

/// Errors from the message broker (`spec.md` §7 "Safety violations").
#[derive(Debug)]
pub enum BrokerError {
    Store(fleetcore_store::StoreError),
    Io(std::io::Error),
    Json(serde_json::Error),
    /// A route's `path` normalized to empty (`spec.md` §4.2 step 1).
    EmptyPath,
    /// `unsubscribe*` was asked to drop an agent's own `agent/{id}`
    /// auto-subscription (`spec.md` §4.2 "Persistence of subscription
    /// changes").
    AutoSubscriptionProtected(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Store(e) => write!(f, "{e}"),
            BrokerError::Io(e) => write!(f, "io error: {e}"),
            BrokerError::Json(e) => write!(f, "malformed json: {e}"),
            BrokerError::EmptyPath => write!(f, "route path is empty after normalization"),
            BrokerError::AutoSubscriptionProtected(pattern) => write!(
                f,
                "cannot unsubscribe from auto-subscription {pattern:?}"
            ),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Store(e) => Some(e),
            BrokerError::Io(e) => Some(e),
            BrokerError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<fleetcore_store::StoreError> for BrokerError {
    fn from(err: fleetcore_store::StoreError) -> Self {
        BrokerError::Store(err)
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Io(err)
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Json(err)
    }
}
