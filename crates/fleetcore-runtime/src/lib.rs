//! Agent runtime (`spec.md` §4.4/§4.7/§4.8): the turn manager, `autoRun`
//! precedence resolution, cron heartbeats, the tool registry, and the
//! service supervisor.

pub mod ask_user;
pub mod autorun;
pub mod error;
pub mod heartbeat;
pub mod supervisor;
pub mod tools;
pub mod turn;

pub use ask_user::AskUserHandle;
pub use autorun::EffectiveAutoRun;
pub use error::RuntimeError;
pub use heartbeat::HeartbeatScheduler;
pub use supervisor::{Service, ServiceContext, ServiceStatus, ServiceSupervisor, ServicesWatcher, StopHandle};
pub use tools::{ToolContext, ToolDef, ToolRegistry, ToolResult};
pub use turn::{TurnManager, TurnStats};
