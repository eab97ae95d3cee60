//! Central error handling for the zarrmap engine.
//!
//! Provides a unified EngineError enum with consistent categorization;
//! per-tile faults stay recoverable while construction-time faults are fatal.

use thiserror::Error;

/// Centralized error type for all engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Pyramid metadata is missing, malformed, or unsupported.
    #[error("Invalid metadata: {0}")]
    MetadataInvalid(String),

    /// Unknown projection name or CRS the engine cannot map to one.
    #[error("Invalid projection: {0}")]
    ProjectionInvalid(String),

    /// A selector resolved to something a band cannot be built from.
    #[error("Invalid selector: {0}")]
    SelectorInvalid(String),

    /// Region radius units outside the supported set.
    #[error("Invalid units: {0} (expected kilometers or miles)")]
    UnitsInvalid(String),

    /// Unknown draw mode at construction.
    #[error("Invalid mode: {0} (expected texture, grid or dotgrid)")]
    ModeInvalid(String),

    /// Chunk or metadata fetch failure; recoverable per tile.
    #[error("Transport fault: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn metadata<T: ToString>(msg: T) -> Self {
        EngineError::MetadataInvalid(msg.to_string())
    }

    pub fn projection<T: ToString>(msg: T) -> Self {
        EngineError::ProjectionInvalid(msg.to_string())
    }

    pub fn selector<T: ToString>(msg: T) -> Self {
        EngineError::SelectorInvalid(msg.to_string())
    }

    pub fn transport<T: ToString>(msg: T) -> Self {
        EngineError::Transport(msg.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
