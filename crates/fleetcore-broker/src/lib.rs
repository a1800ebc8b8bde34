//! Path-addressed message broker (`spec.md` §4.2): subscription indices,
//! the `route()` primitive, durable per-recipient JSONL logs, the
//! dead-letter sink, and real-time fan-out via `tokio::sync::broadcast`.

mod broker;
mod error;
mod index;
mod realtime;
mod storage;
mod types;

pub use broker::{Broker, SharedBroker};
pub use error::BrokerError;
pub use index::SubscriptionIndex;
pub use types::{HistoryOptions, RouteInput, RouteResult};
