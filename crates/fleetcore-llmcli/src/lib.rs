//! The LLM-CLI adapter (`spec.md` §4.5) and the triage HTTP client
//! (`spec.md` §4.2's "secondary triage model API client", referenced from
//! §4.4). Both treat their upstream as an external black box: the adapter
//! spawns a line-delimited-JSON subprocess, the triage client posts JSON
//! over HTTPS.

pub mod adapter;
pub mod env;
pub mod error;
pub mod events;
pub mod triage;

pub use adapter::{CliAdapter, TurnOutcome, TurnRequest};
pub use error::AdapterError;
pub use events::NormalizedEvent;
pub use triage::{TriageClient, TriageError, TriageVerdict};
