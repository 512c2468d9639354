//! Encoder-decoder refinement network.
//!
//! The network refines the pseudo-inverse projection of a mel spectrogram
//! into a linear-frequency magnitude spectrogram:
//!
//! ```text
//! x_in   = P · mel
//! skips  = encoder(x_in)                (every stage output, in order)
//! y      = decoder(skips)               (skip concatenation after each stage)
//! output = finalizer(y) + x_in
//! ```
//!
//! The projector is owned by the network and relocated with it, so the two
//! always agree on a device.

mod decoder;
mod encoder;
mod finalizer;

use std::collections::HashMap;

use mlx_rs::macros::ModuleParameters;
use mlx_rs::module::ModuleParameters as ModuleParametersTrait;
use mlx_rs::Array;
use tracing::{debug, info};

pub use decoder::{DecoderStack, DecoderStage};
pub use encoder::{downsampled_len, EncoderStack, EncoderStage, MIN_INPUT_BINS};
pub use finalizer::{Finalizer, PreFinalGain};

use crate::audio::MelPseudoInverseProjector;
use crate::config::RefinementConfig;
use crate::error::{Mel2SpecError, Result};
use crate::nn::{BatchNorm2d, TensorMap};
use crate::types::{Device, OperationMode};

/// Mel-to-linear refinement network.
///
/// Learned tensors are exposed through `ModuleParameters` under dotted
/// names such as `encoder.stages.0.conv.weight`; batch-norm running
/// statistics are buffers reported by [`RefinementNetwork::named_buffers`].
#[derive(Debug, ModuleParameters)]
pub struct RefinementNetwork {
    config: RefinementConfig,
    widths: Vec<i32>,
    projector: MelPseudoInverseProjector,
    #[param]
    encoder: EncoderStack,
    #[param]
    decoder: DecoderStack,
    #[param]
    finalizer: Finalizer,
    device: Device,
    /// Training passes run so far; mixed into the dropout keys.
    training_steps: u64,
}

impl RefinementNetwork {
    /// Build the network, its projector and all parameters.
    ///
    /// Every architectural inconsistency is reported here: unsupported
    /// depth, a frequency schedule the decoder cannot mirror, or a
    /// pre-final gain that does not fit the last decoder input.
    pub fn new(config: RefinementConfig) -> Result<Self> {
        config.validate()?;
        let widths = config.width_schedule()?;
        let projector = MelPseudoInverseProjector::from_config(&config)?;

        let freqs = frequency_schedule(config.n_freq(), config.layers)?;
        let encoder = EncoderStack::new(&config, &widths)?;
        let decoder = DecoderStack::new(&config, &widths, freqs[1])?;
        check_mirror(&decoder, &freqs)?;
        let finalizer = Finalizer::new(config.n_freq())?;

        let network = Self {
            config,
            widths,
            projector,
            encoder,
            decoder,
            finalizer,
            device: Device::default(),
            training_steps: 0,
        };

        debug!(
            layers = network.config.layers,
            widths = ?network.widths,
            freqs = ?freqs,
            parameters = network.num_parameters(),
            "Built refinement network"
        );
        Ok(network)
    }

    /// Hyperparameters the network was built from.
    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Encoder channel widths, `layers + 1` entries starting at 1.
    pub fn widths(&self) -> &[i32] {
        &self.widths
    }

    /// The fixed mel ↔ linear projector.
    pub fn projector(&self) -> &MelPseudoInverseProjector {
        &self.projector
    }

    /// Device of the learned parameters.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Move the network and its projector to `device` together.
    ///
    /// The device selects the stream of the projector matmuls and of every
    /// convolution. Elementwise ops, batch norm, dropout and the loss run on
    /// MLX's default stream.
    pub fn relocate(&mut self, device: Device) {
        self.device = device;
        self.projector.relocate(device);
        info!(?device, "Relocated refinement network");
    }

    /// Fail if the network and its projector disagree on a device.
    pub fn ensure_same_device(&self) -> Result<()> {
        if self.device != self.projector.device() {
            return Err(Mel2SpecError::DeviceMismatch {
                network: self.device,
                projector: self.projector.device(),
            });
        }
        Ok(())
    }

    /// Refine `mel` (`[B, 1, mel_freq, T]`) into `[B, 1, n_freq, T]`.
    ///
    /// Training mode draws dropout masks and updates batch-norm running
    /// statistics; the other modes are deterministic.
    pub fn forward(&mut self, mel: &Array, mode: OperationMode) -> Result<Array> {
        self.ensure_same_device()?;
        if mel.ndim() != 4 || mel.dim(1) != 1 || mel.dim(2) != self.config.mel_freq {
            return Err(Mel2SpecError::ShapeMismatch {
                expected: vec![-1, 1, self.config.mel_freq, -1],
                actual: mel.shape().to_vec(),
            });
        }

        let x_in = self.projector.mel_to_linear(mel)?;
        let skips = self.encoder.forward(&x_in, mode, self.device)?;
        let keys = self.dropout_keys(mode)?;
        let decoded = self.decoder.forward(&skips, mode, self.device, &keys)?;
        let residual = self.finalizer.forward(&decoded)?;
        Ok(residual.add(&x_in)?)
    }

    fn dropout_keys(&mut self, mode: OperationMode) -> Result<Vec<Array>> {
        let n_stages = self.decoder.stages.len() as u64;
        let base = if mode.is_training() {
            self.training_steps += 1;
            self.config
                .seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(self.training_steps.wrapping_mul(n_stages))
        } else {
            self.config.seed
        };
        (0..n_stages)
            .map(|i| Ok(mlx_rs::random::key(base.wrapping_add(i))?))
            .collect()
    }

    /// Every learned tensor, keyed by its checkpoint name.
    pub fn named_parameters(&self) -> TensorMap {
        self.parameters()
            .flatten()
            .into_iter()
            .map(|(name, value)| (name, value.clone()))
            .collect()
    }

    /// Batch-norm running statistics, keyed by their checkpoint names.
    pub fn named_buffers(&self) -> TensorMap {
        let mut out = TensorMap::new();
        for (prefix, norm) in self.norms() {
            for (name, value) in norm.buffers() {
                out.insert(format!("{prefix}.{name}").into(), value.clone());
            }
        }
        out
    }

    /// Replace tensors by name, returning how many were written.
    ///
    /// Accepts parameters and buffers alike. Every name must exist and every
    /// replacement must keep its tensor's shape. The whole bundle is checked
    /// before anything is written, so a rejected update leaves the network
    /// untouched.
    pub fn update_parameters(&mut self, tensors: HashMap<String, Array>) -> Result<usize> {
        let params = self.named_parameters();
        let buffers = self.named_buffers();

        let mut problems: Vec<String> = Vec::new();
        for (name, value) in &tensors {
            match params.get(name.as_str()).or_else(|| buffers.get(name.as_str())) {
                None => problems.push(format!("{name}: unknown tensor")),
                Some(current) if current.shape() != value.shape() => problems.push(format!(
                    "{name}: expected shape {:?}, got {:?}",
                    current.shape(),
                    value.shape()
                )),
                Some(_) => {}
            }
        }
        if !problems.is_empty() {
            problems.sort_unstable();
            return Err(Mel2SpecError::WeightLoad(problems.join("; ")));
        }

        let written = tensors.len();
        let (param_updates, mut buffer_updates): (HashMap<_, _>, HashMap<_, _>) = tensors
            .into_iter()
            .partition(|(name, _)| params.contains_key(name.as_str()));

        {
            let mut slots = self.parameters_mut().flatten();
            for (name, value) in param_updates {
                if let Some(slot) = slots.get_mut(name.as_str()) {
                    **slot = value;
                }
            }
        }

        for (prefix, norm) in self.norms_mut() {
            for (name, slot) in norm.buffers_mut() {
                if let Some(value) = buffer_updates.remove(&format!("{prefix}.{name}")) {
                    *slot = value;
                }
            }
        }
        Ok(written)
    }

    /// Total number of learned scalars.
    pub fn num_parameters(&self) -> usize {
        self.parameters()
            .flatten()
            .values()
            .map(|a| a.size())
            .sum()
    }

    /// Batch-norm layers with their parameter prefixes.
    fn norms(&self) -> impl Iterator<Item = (String, &BatchNorm2d)> + '_ {
        let encoder = self.encoder.stages.iter().enumerate().filter_map(|(i, stage)| {
            let norm = stage.norm.as_ref()?;
            Some((format!("encoder.stages.{i}.norm"), norm))
        });
        let decoder = self.decoder.stages.iter().enumerate().filter_map(|(i, stage)| {
            let norm = stage.norm.as_ref()?;
            Some((format!("decoder.stages.{i}.norm"), norm))
        });
        encoder.chain(decoder)
    }

    fn norms_mut(&mut self) -> impl Iterator<Item = (String, &mut BatchNorm2d)> + '_ {
        let encoder = self
            .encoder
            .stages
            .iter_mut()
            .enumerate()
            .filter_map(|(i, stage)| {
                let norm = stage.norm.as_mut()?;
                Some((format!("encoder.stages.{i}.norm"), norm))
            });
        let decoder = self
            .decoder
            .stages
            .iter_mut()
            .enumerate()
            .filter_map(|(i, stage)| {
                let norm = stage.norm.as_mut()?;
                Some((format!("decoder.stages.{i}.norm"), norm))
            });
        encoder.chain(decoder)
    }
}

/// Frequency extent of the network input and of every encoder output.
fn frequency_schedule(n_freq: i32, layers: i32) -> Result<Vec<i32>> {
    let mut freqs = vec![n_freq];
    for _ in 0..layers {
        let Some(&last) = freqs.last() else { break };
        if last < MIN_INPUT_BINS {
            return Err(Mel2SpecError::Config(format!(
                "{layers} layers reduce {n_freq} frequency bins below {MIN_INPUT_BINS} \
                 before the last stage"
            )));
        }
        freqs.push(downsampled_len(last));
    }
    Ok(freqs)
}

/// Check that each decoder stage restores the extent of the skip it is
/// concatenated with, and that the last stage restores `n_freq`.
fn check_mirror(decoder: &DecoderStack, freqs: &[i32]) -> Result<()> {
    let n_stages = decoder.stages.len();
    let mut freq = freqs[n_stages];
    for (i, stage) in decoder.stages.iter().enumerate() {
        freq = stage.deconv.output_len(freq, 0);
        let expected = freqs[n_stages - 1 - i];
        if freq != expected {
            return Err(Mel2SpecError::Config(format!(
                "decoder stage {i} produces {freq} bins but {expected} are required; \
                 frequency schedule {freqs:?} cannot be mirrored"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smooth_mel(batch: i32, frames: i32) -> Array {
        let data: Vec<f32> = (0..batch * 80 * frames)
            .map(|i| {
                let f = (i / frames) % 80;
                let t = i % frames;
                1.0 + 0.5 * ((f as f32 * 0.1) + (t as f32 * 0.2)).sin()
            })
            .collect();
        Array::from_slice(&data, &[batch, 1, 80, frames])
    }

    #[test]
    fn test_frequency_schedule() {
        assert_eq!(frequency_schedule(513, 3).unwrap(), vec![513, 256, 128, 64]);
        assert!(frequency_schedule(5, 6).is_err());
    }

    #[test]
    fn test_output_shape() {
        let mut network = RefinementNetwork::new(RefinementConfig::tiny()).unwrap();
        let y = network.forward(&smooth_mel(2, 9), OperationMode::Infer).unwrap();
        assert_eq!(y.shape(), &[2, 1, 513, 9]);
    }

    #[test]
    fn test_rejects_unmirrorable_schedule() {
        // 514 bins: 514 -> 257 -> 128, and 2 * 128 != 257.
        let config = RefinementConfig {
            n_fft: 1026,
            ..RefinementConfig::tiny()
        };
        assert!(matches!(
            RefinementNetwork::new(config),
            Err(Mel2SpecError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_depth_beyond_schedule() {
        let config = RefinementConfig {
            layers: 10,
            ..RefinementConfig::tiny()
        };
        assert!(matches!(
            RefinementNetwork::new(config),
            Err(Mel2SpecError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_mel_bins() {
        let mut network = RefinementNetwork::new(RefinementConfig::tiny()).unwrap();
        let mel = mlx_rs::ops::ones::<f32>(&[1, 1, 64, 4]).unwrap();
        assert!(matches!(
            network.forward(&mel, OperationMode::Infer),
            Err(Mel2SpecError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_relocate_moves_projector() {
        let mut network = RefinementNetwork::new(RefinementConfig::tiny()).unwrap();
        network.relocate(Device::Cpu);
        assert_eq!(network.device(), Device::Cpu);
        assert_eq!(network.projector().device(), Device::Cpu);
        network.ensure_same_device().unwrap();

        // Only this module can split them.
        network.projector.relocate(Device::Gpu);
        assert!(matches!(
            network.forward(&smooth_mel(1, 4), OperationMode::Infer),
            Err(Mel2SpecError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_named_parameters() {
        let config = RefinementConfig {
            use_weight_norm: true,
            pre_final_lin: true,
            ..RefinementConfig::tiny()
        };
        let network = RefinementNetwork::new(config).unwrap();
        let params = network.named_parameters();

        for name in [
            "encoder.stages.0.conv.weight_v",
            "encoder.stages.0.conv.weight_g",
            "encoder.stages.1.norm.weight",
            "decoder.stages.0.deconv.bias",
            "decoder.stages.0.norm.bias",
            "decoder.pre_final.gain",
            "finalizer.gain",
        ] {
            assert!(params.contains_key(name), "missing {name}");
        }
        assert!(!params.contains_key("encoder.stages.0.conv.weight"));
        assert!(!params.contains_key("encoder.stages.0.norm.weight"));
        assert!(!params.contains_key("decoder.stages.1.norm.weight"));

        let buffers = network.named_buffers();
        assert!(buffers.contains_key("encoder.stages.1.norm.running_mean"));
        assert!(buffers.contains_key("decoder.stages.0.norm.running_var"));
        assert_eq!(buffers.len(), 4);
        assert!(buffers.keys().all(|name| !params.contains_key(name)));
    }

    #[test]
    fn test_update_parameters() {
        let mut network = RefinementNetwork::new(RefinementConfig::tiny()).unwrap();
        let mut update = HashMap::new();
        update.insert(
            "finalizer.gain".to_string(),
            mlx_rs::ops::zeros::<f32>(&[513]).unwrap(),
        );
        assert_eq!(network.update_parameters(update).unwrap(), 1);

        // With a zero finalizer the output is exactly the projection.
        let mel = smooth_mel(1, 5);
        let y = network.forward(&mel, OperationMode::Infer).unwrap();
        let x_in = network.projector().mel_to_linear(&mel).unwrap();
        let diff = y.subtract(&x_in).unwrap().abs().unwrap().max(None).unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);

        let mut bad = HashMap::new();
        bad.insert(
            "finalizer.gain".to_string(),
            mlx_rs::ops::zeros::<f32>(&[512]).unwrap(),
        );
        assert!(network.update_parameters(bad).is_err());

        let mut unknown = HashMap::new();
        unknown.insert(
            "encoder.stages.9.conv.weight".to_string(),
            mlx_rs::ops::zeros::<f32>(&[1]).unwrap(),
        );
        assert!(matches!(
            network.update_parameters(unknown),
            Err(Mel2SpecError::WeightLoad(_))
        ));
    }

    #[test]
    fn test_training_updates_running_stats() {
        let mut network = RefinementNetwork::new(RefinementConfig::tiny()).unwrap();
        let before = network.named_buffers()["encoder.stages.1.norm.running_mean"].clone();
        network
            .forward(&smooth_mel(2, 6), OperationMode::Training)
            .unwrap();
        let after = network.named_buffers()["encoder.stages.1.norm.running_mean"].clone();
        let moved = after.subtract(&before).unwrap().abs().unwrap().sum(None).unwrap();
        assert!(moved.item::<f32>() > 0.0);

        // Validation leaves them alone.
        network
            .forward(&smooth_mel(2, 6), OperationMode::Validation)
            .unwrap();
        let again = network.named_buffers()["encoder.stages.1.norm.running_mean"].clone();
        let moved = again.subtract(&after).unwrap().abs().unwrap().sum(None).unwrap();
        assert_eq!(moved.item::<f32>(), 0.0);
    }

    #[test]
    fn test_deterministic_outside_training() {
        let config = RefinementConfig {
            droprate: 0.5,
            num_dropout: 2,
            ..RefinementConfig::tiny()
        };
        let mut network = RefinementNetwork::new(config).unwrap();
        let mel = smooth_mel(1, 6);
        let a = network.forward(&mel, OperationMode::Infer).unwrap();
        let b = network.forward(&mel, OperationMode::Infer).unwrap();
        let diff = a.subtract(&b).unwrap().abs().unwrap().max(None).unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);
    }

    #[test]
    fn test_rejected_update_leaves_network_untouched() {
        let mut network = RefinementNetwork::new(RefinementConfig::tiny()).unwrap();
        let mel = smooth_mel(1, 5);
        let before = network.forward(&mel, OperationMode::Infer).unwrap();

        // A valid gain and a buffer next to a kernel of the wrong shape.
        let mut update = HashMap::new();
        update.insert(
            "finalizer.gain".to_string(),
            mlx_rs::ops::zeros::<f32>(&[513]).unwrap(),
        );
        update.insert(
            "encoder.stages.1.norm.running_mean".to_string(),
            mlx_rs::ops::ones::<f32>(&[8]).unwrap(),
        );
        update.insert(
            "encoder.stages.0.conv.weight".to_string(),
            mlx_rs::ops::zeros::<f32>(&[4, 1, 3, 3]).unwrap(),
        );
        assert!(matches!(
            network.update_parameters(update),
            Err(Mel2SpecError::WeightLoad(_))
        ));

        let after = network.forward(&mel, OperationMode::Infer).unwrap();
        let diff = after.subtract(&before).unwrap().abs().unwrap().max(None).unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);

        let gain = network.named_parameters()["finalizer.gain"].clone();
        gain.eval().unwrap();
        assert!(gain.as_slice::<f32>().iter().all(|g| (g - 0.001).abs() < 1e-9));
        let mean = network.named_buffers()["encoder.stages.1.norm.running_mean"].clone();
        assert_eq!(mean.abs().unwrap().sum(None).unwrap().item::<f32>(), 0.0);
    }

    #[test]
    fn test_update_writes_buffers() {
        let mut network = RefinementNetwork::new(RefinementConfig::tiny()).unwrap();
        let mut update = HashMap::new();
        update.insert(
            "decoder.stages.0.norm.running_var".to_string(),
            mlx_rs::ops::ones::<f32>(&[4])
                .unwrap()
                .multiply(&Array::from_f32(4.0))
                .unwrap(),
        );
        assert_eq!(network.update_parameters(update).unwrap(), 1);

        let var = network.named_buffers()["decoder.stages.0.norm.running_var"].clone();
        var.eval().unwrap();
        assert_eq!(var.as_slice::<f32>(), &[4.0, 4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_initialisation() {
        let config = RefinementConfig {
            layers: 3,
            ngf: 16,
            ..RefinementConfig::tiny()
        };
        let network = RefinementNetwork::new(config.clone()).unwrap();
        let params = network.named_parameters();

        for (name, value) in &params {
            if name.ends_with("conv.bias") {
                value.eval().unwrap();
                assert!(
                    value.as_slice::<f32>().iter().all(|b| (b - 0.01).abs() < 1e-9),
                    "{name}"
                );
            }
        }

        let std_of = |name: &str| {
            let w = &params[name];
            let fan: i32 = w.shape()[1..].iter().product();
            let std = w.square().unwrap().mean(None).unwrap().sqrt().unwrap();
            (std.item::<f32>(), fan as f32)
        };
        let mut kernels: Vec<&str> = params
            .keys()
            .map(|name| &**name)
            .filter(|name| name.ends_with(".weight") && name.contains("conv"))
            .collect();
        kernels.sort_unstable();
        // Three encoder and three decoder stages.
        assert_eq!(kernels.len(), 6);

        for name in kernels {
            let gain = if name == "encoder.stages.0.conv.weight" {
                std::f32::consts::SQRT_2
            } else {
                config.init_gain()
            };
            let (std, fan) = std_of(name);
            let expected = gain / fan.sqrt();
            assert!(
                (std - expected).abs() < 0.25 * expected,
                "{name}: std {std}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_training_dropout_is_stochastic() {
        let config = RefinementConfig {
            droprate: 0.5,
            num_dropout: 2,
            ..RefinementConfig::tiny()
        };
        let mut network = RefinementNetwork::new(config).unwrap();
        let mel = smooth_mel(1, 6);

        let a = network.forward(&mel, OperationMode::Training).unwrap();
        let b = network.forward(&mel, OperationMode::Training).unwrap();
        let diff = a.subtract(&b).unwrap().abs().unwrap().max(None).unwrap();
        assert!(diff.item::<f32>() > 0.0);

        let a = network.forward(&mel, OperationMode::Validation).unwrap();
        let b = network.forward(&mel, OperationMode::Validation).unwrap();
        let diff = a.subtract(&b).unwrap().abs().unwrap().max(None).unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);
    }

    #[test]
    fn test_relocate_to_same_device_keeps_output() {
        let mut network = RefinementNetwork::new(RefinementConfig::tiny()).unwrap();
        let mel = smooth_mel(1, 5);
        let before = network.forward(&mel, OperationMode::Infer).unwrap();

        network.relocate(Device::Cpu);
        let after = network.forward(&mel, OperationMode::Infer).unwrap();
        let diff = after.subtract(&before).unwrap().abs().unwrap().max(None).unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);
    }
}
