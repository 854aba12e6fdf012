//! Port-forward supervision
//!
//! - [`ForwardManager`]: command entry point (start/stop/list/shutdown)
//! - [`Registry`]: tunnels running in this process
//! - supervisor: per-tunnel state machine
//! - [`classify`]: failure taxonomy

pub mod classify;
mod error;
mod manager;
pub mod probe;
mod registry;
mod supervisor;

pub use error::ForwardError;
pub use manager::{ForwardManager, StartMode};
pub use registry::{Registry, RunningTunnel};
pub use supervisor::SupervisorSettings;
