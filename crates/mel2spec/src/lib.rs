//! Mel-to-linear spectrogram refinement on MLX.
//!
//! This crate provides:
//! - A fixed mel filterbank and its pseudo-inverse projector
//! - A U-Net style [`RefinementNetwork`] that learns a residual correction
//!   on top of the pseudo-inverse estimate
//! - A [`LossEngine`] combining masked L1, mel-consistency regularization
//!   and max-pooled smoothness terms
//! - Checkpoint save/load and a two-stage mel → linear → audio pipeline
//!
//! ```ignore
//! use mel2spec::{OperationMode, RefinementConfig, RefinementNetwork};
//!
//! let mut network = RefinementNetwork::new(RefinementConfig::ljspeech_22khz())?;
//! let linear = network.forward(&mel, OperationMode::Infer)?;
//! ```

#![warn(missing_docs)]

pub mod audio;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod network;
pub mod nn;
pub mod pipeline;
pub mod types;

pub use audio::{MelConfig, MelPseudoInverseProjector};
pub use batch::SpectrogramBatch;
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointMetadata};
pub use config::{ActivationType, Mel2SpecConfig, RefinementConfig, TrainParams};
pub use error::{Mel2SpecError, Result};
pub use loss::{LossBreakdown, LossEngine, LossMode, PoolSpec};
pub use model::{Mel2SpecModel, MetricsAccumulator, ValidationScoring};
pub use network::RefinementNetwork;
pub use pipeline::*;
pub use types::{Device, OperationMode};
