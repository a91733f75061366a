pub mod app;
pub mod commands;

pub use app::{handle_config, parse_input, run, App, Config, DEFAULT_URL};
pub use commands::{Cli, Commands, ConfigCommand};
