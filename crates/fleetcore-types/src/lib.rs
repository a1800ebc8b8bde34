//! Shared domain types for fleetcore.
//!
//! Kept deliberately thin: this crate owns the data model (`spec.md` §3)
//! and the control-surface wire envelope, but no filesystem or network
//! behavior. Every other fleetcore crate depends on this one.

pub mod agent;
pub mod error;
pub mod ids;
pub mod message;
pub mod protocol;
pub mod question;
pub mod session;
pub mod subscription;
pub mod turn;

pub use agent::{AgentConfig, AutoRunConfig, AutoRunDetail};
pub use error::TypesError;
pub use ids::{AgentId, SessionId};
pub use message::{Message, MessageSource, MessageStatus, RecipientKind, RecipientMessage};
pub use protocol::{ClientEnvelope, ServerEnvelope};
pub use question::{PendingQuestion, QuestionStatus};
pub use session::SessionMeta;
pub use subscription::Subscription;
pub use turn::ConversationLogLine;
