//! Error type shared across the crate.

use thiserror::Error;

/// Errors produced while patching models or moving them between devices.
#[derive(Error, Debug)]
pub enum PatcherError {
    // Device selection / transfer
    /// Device could not be initialized or reused.
    #[error("Device error: {0}")]
    Device(String),

    // Injection machinery
    /// A hook failed to attach or detach.
    #[error("Injection failed: {0}")]
    Injection(String),

    // Pass-through from dependencies
    /// Error bubbled up from candle.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// Error serializing a model option value.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PatcherError>;
