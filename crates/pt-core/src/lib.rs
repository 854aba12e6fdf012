//! pt-core: Core abstractions, configuration and persistence for podtun
//!
//! This crate provides the shared types, the command protocol shapes and the
//! per-application profile store used by the daemon and the CLI.

pub mod config;
pub mod error;
pub mod ipc;
pub mod pidfile;
pub mod profile;
pub mod store;
pub mod time;
pub mod types;

pub use error::{ConfigError, NameError, StoreError};
pub use types::{AppRef, ForwardKey, PortForwardStatus, PrivilegeLevel};
