//! Error types for the status line engine
//!
//! Only [`EngineError::Config`] is fatal. Every other variant is contained
//! where it happens and degrades to a fallback value in the rendered line.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to load configuration from {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Unreadable or malformed plugin unit, excluded from the registry
    #[error("Discovery error in {path:?}: {reason}")]
    Discovery { path: PathBuf, reason: String },

    /// Informational only, never logged as an error
    #[error("Plugin {name} requires host {required}, running {host}")]
    VersionIncompatible { name: String, required: String, host: String },

    #[error("Plugin {name} failed: {reason}")]
    ExecutionFailure { name: String, reason: String },

    #[error("Plugin {name} timed out after {timeout_ms} ms")]
    ExecutionTimeout { name: String, timeout_ms: u128 },

    #[error("Update of plugin {name} failed: {reason}")]
    UpdateFetch { name: String, reason: String },

    #[error("Corrupt cache record {key}: {reason}")]
    CacheCorruption { key: String, reason: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn discovery(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Discovery {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn update(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpdateFetch {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
