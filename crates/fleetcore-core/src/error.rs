use std::fmt;
use std::path::PathBuf;

/// Errors from path resolution and cron validation. Kept separate from
/// `fleetcore_types::TypesError` (which only checks ID *shape*) because
/// these additionally need the project root to produce a message.
#[derive(Debug)]
pub enum CoreError {
    /// `fleetcore_types` rejected the ID's shape before resolution even began.
    InvalidId(fleetcore_types::TypesError),
    /// The resolved path escaped the project root.
    OutsideRoot { id: String, resolved: PathBuf },
    /// A `heartbeat` cron expression failed to parse.
    InvalidCron { expr: String, reason: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidId(e) => write!(f, "{e}"),
            CoreError::OutsideRoot { id, resolved } => {
                write!(f, "id {id:?} resolves outside project root: {resolved:?}")
            }
            CoreError::InvalidCron { expr, reason } => {
                write!(f, "invalid cron expression {expr:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<fleetcore_types::TypesError> for CoreError {
    fn from(err: fleetcore_types::TypesError) -> Self {
        CoreError::InvalidId(err)
    }
}
