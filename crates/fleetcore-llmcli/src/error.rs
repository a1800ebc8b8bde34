use std::fmt;
use std::time::Duration;

/// Errors from driving the LLM-CLI subprocess (`spec.md` §4.5/§7
/// "Transient subprocess").
#[derive(Debug)]
pub enum AdapterError {
    Spawn(std::io::Error),
    /// The child exited with a nonzero code, or was killed by a signal,
    /// or both a graceful and hard kill were needed after a timeout.
    NonZeroExit {
        code: Option<i32>,
        signal: Option<i32>,
        duration: Duration,
    },
    Timeout {
        duration: Duration,
    },
    /// The one-shot `query` mode's final JSON envelope had no `result` field.
    MissingResult,
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::Spawn(e) => write!(f, "failed to spawn llm-cli: {e}"),
            AdapterError::NonZeroExit {
                code,
                signal,
                duration,
            } => write!(
                f,
                "llm-cli exited abnormally (code={code:?}, signal={signal:?}) after {duration:?}"
            ),
            AdapterError::Timeout { duration } => {
                write!(f, "llm-cli timed out after {duration:?}")
            }
            AdapterError::MissingResult => {
                write!(f, "llm-cli query response had no `result` field")
            }
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::Spawn(err)
    }
}
