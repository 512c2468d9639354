//! Transposed-convolution decoder with encoder skip connections.

use mlx_rs::macros::ModuleParameters;
use mlx_rs::Array;

use super::finalizer::PreFinalGain;
use crate::config::RefinementConfig;
use crate::error::{Mel2SpecError, Result};
use crate::nn::{Activation, BatchNorm2d, ConvTranspose2d, Dropout};
use crate::types::{Device, OperationMode};

const KERNEL: (i32, i32) = (4, 3);
const FINAL_KERNEL: (i32, i32) = (5, 3);
const STRIDE: (i32, i32) = (2, 1);
const PADDING: (i32, i32) = (1, 1);

/// One decoder stage: `act -> deconv -> [dropout] -> [batch-norm]`.
#[derive(Debug, ModuleParameters)]
pub struct DecoderStage {
    /// Pre-activation.
    pub activation: Activation,
    /// Upsampling transposed convolution.
    #[param]
    pub deconv: ConvTranspose2d,
    /// Dropout on the first `num_dropout` stages.
    pub dropout: Option<Dropout>,
    /// Batch normalisation on every stage but the last.
    #[param]
    pub norm: Option<BatchNorm2d>,
}

impl DecoderStage {
    fn forward(
        &mut self,
        x: &Array,
        mode: OperationMode,
        device: Device,
        dropout_key: &Array,
    ) -> Result<Array> {
        let x = self.activation.forward(x)?;
        let mut x = self.deconv.forward(&x, device)?;
        if let Some(dropout) = &self.dropout {
            x = dropout.forward(&x, dropout_key, mode.is_training())?;
        }
        match &mut self.norm {
            Some(norm) => norm.forward(&x, mode.is_training()),
            None => Ok(x),
        }
    }
}

/// Decoder stack mirroring the encoder.
#[derive(Debug, ModuleParameters)]
pub struct DecoderStack {
    /// Stages, bottleneck side first.
    #[param]
    pub stages: Vec<DecoderStage>,
    /// Optional gain on the input of the last stage.
    #[param]
    pub pre_final: Option<PreFinalGain>,
}

impl DecoderStack {
    /// Build the stages for encoder `widths` (`layers + 1` entries).
    ///
    /// `last_input_bins` is the frequency extent entering the last stage,
    /// used to shape the pre-final gain.
    pub fn new(config: &RefinementConfig, widths: &[i32], last_input_bins: i32) -> Result<Self> {
        let reversed: Vec<i32> = widths.iter().rev().copied().collect();
        let n_stages = reversed.len().saturating_sub(1);
        let gain = config.init_gain();

        let mut stages = Vec::with_capacity(n_stages);
        let mut last_input_channels = 0;
        for i in 0..n_stages {
            let last = i + 1 == n_stages;
            let in_channels = if i == 0 { reversed[0] } else { 2 * reversed[i] };
            let out_channels = reversed[i + 1];
            last_input_channels = in_channels;

            let deconv = ConvTranspose2d::new(
                in_channels,
                out_channels,
                if last { FINAL_KERNEL } else { KERNEL },
                STRIDE,
                PADDING,
                gain,
                config.seed.wrapping_add((widths.len() + i) as u64),
                config.use_weight_norm,
            )?;
            let dropout = (i < config.num_dropout as usize && config.droprate > 0.0).then_some(
                Dropout {
                    p: config.droprate,
                },
            );
            let norm = if config.use_batchnorm && !last {
                Some(BatchNorm2d::new(out_channels)?)
            } else {
                None
            };
            stages.push(DecoderStage {
                activation: Activation(config.act2),
                deconv,
                dropout,
                norm,
            });
        }

        let pre_final = if config.pre_final_lin {
            let channels = 2 * config.ngf;
            let bins = config.n_freq() / 2;
            if channels != last_input_channels || bins != last_input_bins {
                return Err(Mel2SpecError::Config(format!(
                    "pre-final gain [{channels}, {bins}] does not match the last decoder input \
                     [{last_input_channels}, {last_input_bins}] (layers = {})",
                    config.layers
                )));
            }
            Some(PreFinalGain::new(channels, bins)?)
        } else {
            None
        };

        Ok(Self { stages, pre_final })
    }

    /// Decode the deepest encoder output, concatenating `skips[len - (i + 2)]`
    /// after every stage `i` except the last.
    ///
    /// `dropout_keys` supplies one random key per stage.
    pub fn forward(
        &mut self,
        skips: &[Array],
        mode: OperationMode,
        device: Device,
        dropout_keys: &[Array],
    ) -> Result<Array> {
        let n_stages = self.stages.len();
        if skips.len() != n_stages || dropout_keys.len() != n_stages {
            return Err(Mel2SpecError::Config(format!(
                "decoder has {n_stages} stages but got {} skips and {} dropout keys",
                skips.len(),
                dropout_keys.len()
            )));
        }
        let Some(bottleneck) = skips.last() else {
            return Err(Mel2SpecError::Config("decoder has no stages".to_string()));
        };

        let mut x = bottleneck.clone();
        for (i, stage) in self.stages.iter_mut().enumerate() {
            let last = i + 1 == n_stages;
            if last {
                if let Some(pre_final) = &self.pre_final {
                    x = pre_final.forward(&x)?;
                }
            }
            x = stage.forward(&x, mode, device, &dropout_keys[i])?;
            if !last {
                let skip = &skips[n_stages - (i + 2)];
                x = mlx_rs::ops::concatenate_axis(&[&x, skip], 1)?;
            }
        }
        Ok(x)
    }
}
