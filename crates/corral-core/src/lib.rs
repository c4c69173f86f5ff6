//! Configuration loading and multi-backend routing for Corral.
//!
//! [`CorralConfig`] reads backend settings from `corral.toml`,
//! [`select_provider`] builds a provider for one backend kind, and [`Engine`]
//! holds several providers at once, dispatching each call to the backend that
//! owns the runtime or snapshot it names.

pub mod config;
pub mod engine;

pub use config::CorralConfig;
pub use engine::{select_provider, Engine, EngineSubscription};

use corral_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<CoreError> for RuntimeError {
    fn from(err: CoreError) -> Self {
        RuntimeError::configuration(err.to_string())
    }
}
