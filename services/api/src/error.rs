//! services/api/src/error.rs
//!
//! Errors that stop the service from starting or serving.

use crate::config::ConfigError;
use goodnight_core::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An adapter could not be built, e.g. an unreadable JWT key.
    #[error("Adapter setup failed: {0}")]
    Port(#[from] PortError),

    /// Connecting to Postgres or migrating it failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Binding or serving the HTTP listener failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
