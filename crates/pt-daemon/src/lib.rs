//! pt-daemon: background daemon supervising port-forwards
//!
//! The daemon keeps a set of tunnels between local ports and pods alive,
//! records their health in each application's profile, and relaunches them
//! after it restarts. Two instances may run side by side, one privileged and
//! one not, each owning its own tunnels.

pub mod cluster;
pub mod forward;
pub mod ipc;
pub mod recovery;
pub mod state;

pub use forward::{ForwardManager, StartMode};
pub use recovery::{recover_all, RecoveryReport};
pub use state::DaemonState;
