//! Built-in task actions.

pub mod cmd;

pub use cmd::{command_action, run_command};
