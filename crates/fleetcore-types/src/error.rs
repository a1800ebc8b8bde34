use std::fmt;

/// Errors raised while constructing or validating fleetcore domain types.
#[derive(Debug)]
pub enum TypesError {
    /// An agent or session ID had an empty, `.`, or `..` segment.
    InvalidId(String),
}

impl fmt::Display for TypesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypesError::InvalidId(id) => write!(f, "invalid id: {id:?}"),
        }
    }
}

impl std::error::Error for TypesError {}
