use core::error::Error;

pub mod agent;
pub mod cli;
pub mod controller;
pub mod credential;

pub use agent::*;
pub use cli::*;
pub use controller::*;
pub use credential::*;

#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Failed to read config file {path}")]
    Read { path: String },
    #[display("Failed to parse config file {path}")]
    Parse { path: String },
    #[display("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl Error for ConfigError {}
