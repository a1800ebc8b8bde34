//! Template cloning with `{{var}}` interpolation (`spec.md` §4.3
//! "Scaffolding"). Files that already exist in the target are never
//! overwritten.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::StoreError;

fn interpolate(content: &str, vars: &HashMap<&str, &str>) -> String {
    let mut out = content.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Recursively clone `template_root` into `target_dir`, interpolating
/// `{{var}}` placeholders in every file that decodes as UTF-8 (binary
/// files are copied byte-for-byte, unmodified). If `template_root`
/// doesn't exist, only `target_dir` itself is created — callers then lay
/// down their own defaults.
pub fn scaffold(
    template_root: &Path,
    target_dir: &Path,
    vars: &HashMap<&str, &str>,
) -> Result<(), StoreError> {
    fs::create_dir_all(target_dir)?;
    if !template_root.exists() {
        return Ok(());
    }
    copy_tree(template_root, target_dir, vars)
}

fn copy_tree(src: &Path, dst: &Path, vars: &HashMap<&str, &str>) -> Result<(), StoreError> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_tree(&entry.path(), &dst_path, vars)?;
        } else if file_type.is_file() {
            if dst_path.exists() {
                continue;
            }
            match fs::read_to_string(entry.path()) {
                Ok(content) => fs::write(&dst_path, interpolate(&content, vars))?,
                Err(_) => {
                    fs::copy(entry.path(), &dst_path)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn interpolates_known_placeholders() {
        let mut vars = HashMap::new();
        vars.insert("id", "research/deep");
        vars.insert("name", "Deep Research");
        vars.insert("description", "Digs into things");
        let rendered = interpolate("# {{name}} ({{id}})\n\n{{description}}", &vars);
        assert_eq!(rendered, "# Deep Research (research/deep)\n\nDigs into things");
    }

    #[test]
    fn existing_files_are_never_overwritten() {
        let template = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::write(template.path().join("CLAUDE.md"), "template instructions").unwrap();
        fs::write(target.path().join("CLAUDE.md"), "custom instructions").unwrap();

        scaffold(template.path(), target.path(), &HashMap::new()).unwrap();

        let content = fs::read_to_string(target.path().join("CLAUDE.md")).unwrap();
        assert_eq!(content, "custom instructions");
    }
}
