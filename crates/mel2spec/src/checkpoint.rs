//! Network checkpoint save/load.
//!
//! A checkpoint is a directory holding:
//! - `weights.safetensors`: every learned tensor and batch-norm statistic
//! - `config.json`: the hyperparameters needed to rebuild the architecture
//! - `metadata.json`: training progress at save time

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use mlx_rs::Array;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RefinementConfig;
use crate::error::{Mel2SpecError, Result};
use crate::network::RefinementNetwork;

/// File holding the tensors.
pub const WEIGHTS_FILE: &str = "weights.safetensors";
/// File holding the architecture hyperparameters.
pub const CONFIG_FILE: &str = "config.json";
/// File holding training progress.
pub const METADATA_FILE: &str = "metadata.json";

/// Training state saved next to the weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Optimizer steps taken.
    pub step: usize,
    /// Completed epochs.
    pub epoch: usize,
    /// Best validation loss seen.
    pub best_val_loss: Option<f64>,
    /// Learned scalars in the network.
    pub num_parameters: usize,
    /// Seconds since the Unix epoch.
    pub timestamp: String,
}

impl CheckpointMetadata {
    /// Metadata for a network at the given progress.
    pub fn new(step: usize, epoch: usize) -> Self {
        Self {
            step,
            epoch,
            timestamp: unix_timestamp(),
            ..Default::default()
        }
    }

    /// Set the best validation loss.
    pub fn with_best_val_loss(mut self, loss: f64) -> Self {
        self.best_val_loss = Some(loss);
        self
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}

/// Write `network` into `dir`, creating it if needed.
pub fn save_checkpoint(
    dir: impl AsRef<Path>,
    network: &RefinementNetwork,
    metadata: CheckpointMetadata,
) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut tensors = network.named_parameters();
    let num_parameters: usize = tensors.values().map(|a| a.size()).sum();
    tensors.extend(network.named_buffers());
    for tensor in tensors.values() {
        tensor.eval()?;
    }
    Array::save_safetensors(tensors, None, dir.join(WEIGHTS_FILE))?;

    fs::write(
        dir.join(CONFIG_FILE),
        serde_json::to_string_pretty(network.config())?,
    )?;

    let metadata = CheckpointMetadata {
        num_parameters,
        ..metadata
    };
    fs::write(
        dir.join(METADATA_FILE),
        serde_json::to_string_pretty(&metadata)?,
    )?;

    info!(
        path = %dir.display(),
        parameters = num_parameters,
        step = metadata.step,
        "Saved checkpoint"
    );
    Ok(())
}

/// Rebuild a network from `dir`.
///
/// Every tensor the architecture expects must be present with its exact
/// shape; extra tensors are rejected as well.
pub fn load_checkpoint(dir: impl AsRef<Path>) -> Result<(RefinementNetwork, CheckpointMetadata)> {
    let dir = dir.as_ref();
    let config: RefinementConfig =
        serde_json::from_str(&fs::read_to_string(dir.join(CONFIG_FILE))?)?;

    let metadata_path = dir.join(METADATA_FILE);
    let metadata = if metadata_path.exists() {
        serde_json::from_str(&fs::read_to_string(metadata_path)?)?
    } else {
        CheckpointMetadata::default()
    };

    let mut network = RefinementNetwork::new(config)?;
    let weights_path = dir.join(WEIGHTS_FILE);
    let tensors: HashMap<String, Array> = Array::load_safetensors(&weights_path)
        .map_err(|e| Mel2SpecError::WeightLoad(format!("{}: {e}", weights_path.display())))?
        .into_iter()
        .collect();

    let expected = network.named_parameters().len() + network.named_buffers().len();
    let written = network.update_parameters(tensors)?;
    if written != expected {
        return Err(Mel2SpecError::WeightLoad(format!(
            "{} provides {written} of {expected} tensors",
            weights_path.display()
        )));
    }

    info!(
        path = %dir.display(),
        parameters = network.num_parameters(),
        "Loaded checkpoint"
    );
    Ok((network, metadata))
}
