//! Common type definitions.

use mlx_rs::StreamOrDevice;
use serde::{Deserialize, Serialize};

/// Compute device.
///
/// Components start on the CPU, which every MLX build supports; move them
/// to the GPU explicitly. Only the heavy kernels (projector matmuls and
/// convolutions) are scheduled on the device stream; everything else uses
/// MLX's default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// CPU computation.
    #[default]
    Cpu,
    /// GPU computation (Metal on macOS).
    Gpu,
}

impl Device {
    /// Stream that kernels for this device are scheduled on.
    pub fn stream(self) -> StreamOrDevice {
        match self {
            Self::Cpu => StreamOrDevice::cpu(),
            Self::Gpu => StreamOrDevice::gpu(),
        }
    }
}

/// Operation mode, passed explicitly to every forward pass.
///
/// `Training` draws dropout masks and normalises with batch statistics
/// (updating the running estimates); the other two modes are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Parameter-update pass.
    Training,
    /// Held-out evaluation pass.
    Validation,
    /// Inference.
    #[default]
    Infer,
}

impl OperationMode {
    /// Whether stochastic layers and batch statistics are active.
    #[must_use]
    pub const fn is_training(self) -> bool {
        matches!(self, Self::Training)
    }
}
