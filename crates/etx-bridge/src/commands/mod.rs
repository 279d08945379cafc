//! Subcommand handlers.

pub mod config_cmd;
pub mod decode;
pub mod run;
