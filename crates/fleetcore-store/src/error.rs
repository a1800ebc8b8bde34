use std::fmt;

/// Errors from the agent/session store (`spec.md` §7 "Validation" and
/// "Not-found").
#[derive(Debug)]
pub enum StoreError {
    Path(fleetcore_core::CoreError),
    Io(std::io::Error),
    Json(serde_json::Error),
    NotFound(String),
    AlreadyExists(String),
    /// Refusal to delete/touch the `main` session directly (`spec.md` §3
    /// invariant: only whole-agent deletion removes it).
    MainSessionProtected,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Path(e) => write!(f, "{e}"),
            StoreError::Io(e) => write!(f, "io error: {e}"),
            StoreError::Json(e) => write!(f, "malformed json: {e}"),
            StoreError::NotFound(what) => write!(f, "not found: {what}"),
            StoreError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            StoreError::MainSessionProtected => {
                write!(f, "the main session cannot be deleted except by deleting its agent")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Path(e) => Some(e),
            StoreError::Io(e) => Some(e),
            StoreError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<fleetcore_core::CoreError> for StoreError {
    fn from(err: fleetcore_core::CoreError) -> Self {
        StoreError::Path(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Json(err)
    }
}

impl From<fleetcore_types::TypesError> for StoreError {
    fn from(err: fleetcore_types::TypesError) -> Self {
        StoreError::Path(fleetcore_core::CoreError::from(err))
    }
}
