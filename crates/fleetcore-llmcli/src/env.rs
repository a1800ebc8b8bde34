//! Environment sanitization so the spawned LLM-CLI never re-enters an
//! editor/IDE-embedded mode (`spec.md` §4.5).

/// Every variable whose name starts with one of these prefixes is stripped.
const STRIP_PREFIXES: &[&str] = &["CURSOR_", "VSCODE_", "JETBRAINS_", "CLAUDE_CODE_"];

/// Variables stripped only on an exact name match.
const STRIP_EXACT: &[&str] = &["TERM_PROGRAM", "CLAUDECODE"];

fn should_strip(key: &str) -> bool {
    STRIP_EXACT.contains(&key) || STRIP_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// The current process environment, minus anything that would make the
/// child think it's running inside an IDE or another agent harness.
pub fn sanitized_env() -> Vec<(String, String)> {
    std::env::vars().filter(|(k, _)| !should_strip(k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_prefixes_and_exacts() {
        assert!(should_strip("VSCODE_PID"));
        assert!(should_strip("CURSOR_TRACE_ID"));
        assert!(should_strip("JETBRAINS_TOOLBOX"));
        assert!(should_strip("CLAUDE_CODE_SSE_PORT"));
        assert!(should_strip("TERM_PROGRAM"));
        assert!(should_strip("CLAUDECODE"));
        assert!(!should_strip("PATH"));
        assert!(!should_strip("HOME"));
    }
}
