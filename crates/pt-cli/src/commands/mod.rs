//! CLI command implementations

mod forward;
mod status;

pub use forward::{
    forward_list_command, forward_restart_command, forward_start_command, forward_stop_command,
    parse_port_pair, ForwardArgs,
};
pub use status::{ping_command, shutdown_command, status_command};
