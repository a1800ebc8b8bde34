//! Safe path resolution for agent/session IDs under a project root
//! (`spec.md` §4.3 "Path resolution", testable property 2).

use std::path::{Path, PathBuf};

use fleetcore_types::ids::normalize_and_validate;

use crate::error::CoreError;

/// Normalize `id`, reject unsafe segments, join it under `root`, and verify
/// the joined path is still (lexically) inside `root`.
///
/// `root` must already be an absolute, canonical directory — this function
/// does not canonicalize, since the target path may not exist yet (agent
/// creation resolves a path before creating the directory).
pub fn resolve_under_root(root: &Path, id: &str) -> Result<PathBuf, CoreError> {
    let normalized = normalize_and_validate(id)?;
    let mut resolved = root.to_path_buf();
    for segment in normalized.split('/') {
        resolved.push(segment);
    }
    if resolved != root && !resolved.starts_with(root) {
        return Err(CoreError::OutsideRoot {
            id: id.to_string(),
            resolved,
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_nested_id_under_root() {
        let root = PathBuf::from("/project");
        let resolved = resolve_under_root(&root, "research/deep").unwrap();
        assert_eq!(resolved, PathBuf::from("/project/research/deep"));
    }

    #[test]
    fn rejects_traversal() {
        let root = PathBuf::from("/project");
        assert!(resolve_under_root(&root, "../outside").is_err());
        assert!(resolve_under_root(&root, "a/../../b").is_err());
    }

    #[test]
    fn rejects_empty_segments() {
        let root = PathBuf::from("/project");
        assert!(resolve_under_root(&root, "a//b").is_err());
        assert!(resolve_under_root(&root, "").is_err());
    }
}
