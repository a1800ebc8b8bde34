//! Pure, dependency-light primitives shared by the agent store and the
//! message broker: path matching, safe path resolution under a project
//! root, filename encoding, and cron validation.

pub mod cronspec;
pub mod encode;
pub mod error;
pub mod pathmatch;
pub mod resolve;

pub use error::CoreError;
pub use pathmatch::path_matches;
pub use resolve::resolve_under_root;
