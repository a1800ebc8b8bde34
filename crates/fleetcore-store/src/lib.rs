//! The hierarchical agent/session store (`spec.md` §4.3): on-disk layout,
//! path validation, template scaffolding, three-tier memory, and
//! append-only conversation logs.

pub mod agent;
pub mod conversation;
pub mod error;
pub mod layout;
pub mod memory;
pub mod questions;
pub mod session;
pub mod template;

pub use agent::{AgentCreateOptions, AgentStore};
pub use error::StoreError;

use std::path::{Path, PathBuf};

/// The store's single handle: a validated, canonical project root.
/// Cloned cheaply (an `Arc`-free `PathBuf` clone) and shared across the
/// broker, the turn manager, and the control surface.
#[derive(Debug, Clone)]
pub struct ProjectRoot(PathBuf);

impl ProjectRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self(root.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}
