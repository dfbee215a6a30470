//! Error types for command payload validation.

use thiserror::Error;

/// Errors raised while building or validating command payloads.
#[derive(Error, Debug)]
pub enum Error {
    /// Pixel data does not match the declared dimensions
    #[error("Invalid pixel data: expected {expected} bytes, got {actual}")]
    PixelDataSize {
        /// Byte count implied by width, height and format
        expected: usize,
        /// Byte count actually supplied
        actual: usize,
    },

    /// Vertex data does not cover the declared primitives
    #[error("Invalid vertex data: {0}")]
    VertexData(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
