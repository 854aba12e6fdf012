//! IPC server for CLI communication
//!
//! Uses TCP on localhost (127.0.0.1) for cross-platform compatibility.

mod server;

pub use server::{handle_request, IpcServer};
