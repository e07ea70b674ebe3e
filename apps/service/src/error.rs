use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    InvalidInput(String),
    #[error("no target with id {0}")]
    UnknownTarget(uuid::Uuid),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}
