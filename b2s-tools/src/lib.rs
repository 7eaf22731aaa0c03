pub mod command;
pub mod format;
pub mod str;

pub use command::{command_output, command_output_as_string, run_command};
