use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Validate and normalize a raw ID string: trim outer `/`, collapse
/// repeated separators, reject empty/`.`/`..` segments.
///
/// This only checks the *shape* of the ID. Whether the resolved path
/// stays inside the project root is the agent store's job
/// (`fleetcore-core::path::resolve_under_root`), which every public
/// store method calls before touching disk.
pub fn normalize_and_validate(raw: &str) -> Result<String, TypesError> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(TypesError::InvalidId(raw.to_string()));
    }
    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(TypesError::InvalidId(raw.to_string()));
        }
        segments.push(segment);
    }
    Ok(segments.join("/"))
}

macro_rules! path_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: &str) -> Result<Self, TypesError> {
                Ok(Self(normalize_and_validate(raw)?))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Segments of this ID, e.g. `research/deep` -> `["research", "deep"]`.
            pub fn segments(&self) -> Vec<&str> {
                self.0.split('/').collect()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = TypesError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<String> for $name {
            type Error = TypesError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(&value)
            }
        }
    };
}

path_id!(AgentId);
path_id!(SessionId);

impl SessionId {
    /// The session every agent is guaranteed to have (`spec.md` §3 invariant).
    pub fn main() -> Self {
        Self("main".to_string())
    }

    pub fn is_main(&self) -> bool {
        self.0 == "main"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_outer_slashes() {
        assert_eq!(AgentId::new("/research/deep/").unwrap().as_str(), "research/deep");
    }

    #[test]
    fn rejects_dotdot() {
        assert!(AgentId::new("research/../secrets").is_err());
    }

    #[test]
    fn rejects_empty_segment() {
        assert!(AgentId::new("research//deep").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(AgentId::new("").is_err());
        assert!(AgentId::new("/").is_err());
    }
}
