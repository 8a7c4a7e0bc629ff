//! Custom error types for the module orchestration core.
//!
//! `CoreError` consolidates the failure modes of the registry, the worker
//! thread pool and the remote access layer. Expected runtime failures (a hook
//! erroring out, a missing module name) are logged and surfaced as boolean
//! results by the registry itself; `CoreError` values are raised eagerly only
//! where misconfiguration should abort at load time rather than at activation
//! time.

use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Error taxonomy of the orchestration core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Duplicate module name, malformed descriptor or inconsistent wiring.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// File-level parse errors from the `config` crate.
    #[error("Config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// The configured implementation key is not present in the factory registry.
    #[error("Implementation not found: {0}")]
    Import(String),

    /// The resolved implementation does not satisfy the declared base or capability.
    #[error("Interface mismatch: {0}")]
    Interface(String),

    /// A lifecycle hook failed or a required module could not be activated.
    #[error("Activation failed: {0}")]
    Activation(String),

    /// Worker-thread name collision, join timeout or dead worker queue.
    #[error("Thread error: {0}")]
    Thread(String),

    /// Remote access service or wire protocol failure.
    #[error("Remote access error: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
