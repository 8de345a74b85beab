//! CLI command implementations

mod check;
mod config;
mod serve;

pub use check::check_command;
pub use config::{config_get, config_init, config_path, config_set, config_show, load_config_file};
pub use serve::{serve_command, ServeOptions};
