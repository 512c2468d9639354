//! Layers of the refinement network.
//!
//! - Replication-padded strided convolution and its transposed counterpart,
//!   both optionally weight-normalised
//! - Batch normalisation with running statistics
//! - Inverted dropout
//! - Pointwise activations

mod activation;
mod conv;
mod dropout;
mod norm;

use mlx_rs::module::FlattenedModuleParam;

pub use activation::Activation;
pub use conv::{Conv2d, ConvTranspose2d, ReplicationPad2d};
pub use dropout::Dropout;
pub use norm::BatchNorm2d;

/// Named tensors, keyed the same way they are stored in a checkpoint.
pub type TensorMap = FlattenedModuleParam;
