use exo_discovery::{Candidate, DiscoveryError};
use exo_session::ManagerError;
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {name}: {value:?}")]
    InvalidOverride { name: &'static str, value: String },
}

/// Client facade error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("Connection error: {0}")]
    Manager(#[from] ManagerError),
    #[error("{} backends qualify; choose one", .0.len())]
    ChoiceRequired(Vec<Candidate>),
}

pub type Result<T> = std::result::Result<T, ClientError>;
