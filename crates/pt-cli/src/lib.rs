//! podtun: command-line client for the port-forward daemon
//!
//! Sends commands to a running `podtund` over the loopback command protocol
//! and reads persisted tunnel state straight from the profile store.

pub mod commands;
pub mod ipc;
pub mod output;
