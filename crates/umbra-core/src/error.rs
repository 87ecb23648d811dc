//! Error types for the engine.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Out of bounds access
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// A mesh could not be split into meshlets.
    #[error("Meshlet build failed: {0}")]
    Meshlet(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
