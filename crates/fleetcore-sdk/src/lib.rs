//! Wires the store/broker/runtime crates into one process: the bootstrap
//! container, the TCP control surface, and the upstream gateway client.

pub mod container;
pub mod control;
pub mod error;
pub mod gateway;

pub use container::{BootstrapOptions, Container};
pub use control::ControlSurface;
pub use error::SdkError;
pub use gateway::{GatewayHandle, GatewayIdentity};
