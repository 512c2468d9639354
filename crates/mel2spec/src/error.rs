//! Error types for the refinement crate.

use mlx_rs::error::Exception;
use thiserror::Error;

use crate::types::Device;

/// Result type for refinement operations.
pub type Result<T> = std::result::Result<T, Mel2SpecError>;

/// Error type for refinement operations.
#[derive(Error, Debug)]
pub enum Mel2SpecError {
    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Configuration error, raised while building a component.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shape mismatch error.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<i32>,
        /// Actual shape.
        actual: Vec<i32>,
    },

    /// Per-sample valid lengths disagree with the tensor they describe.
    #[error("Invalid valid lengths: {0}")]
    InvalidLengths(String),

    /// Network and projector were found on different devices.
    #[error("Device mismatch: network on {network:?}, projector on {projector:?}")]
    DeviceMismatch {
        /// Device of the learned parameters.
        network: Device,
        /// Device of the fixed projection matrices.
        projector: Device,
    },

    /// A loss or output value was NaN or infinite.
    #[error("Non-finite value in {0}")]
    NonFinite(String),

    /// Weight loading error.
    #[error("Weight loading error: {0}")]
    WeightLoad(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// MLX IO error (safetensors read/write).
    #[error("MLX IO error: {0}")]
    MlxIo(#[from] mlx_rs::error::IoError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Failure reported by an injected vocoder, scorer or audio source.
    #[error("External component error: {0}")]
    External(String),
}

impl From<serde_json::Error> for Mel2SpecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Mel2SpecError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
