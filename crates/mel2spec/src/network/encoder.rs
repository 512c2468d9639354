//! Strided encoder: each stage halves the frequency extent and keeps time.

use mlx_rs::macros::ModuleParameters;
use mlx_rs::Array;

use crate::config::RefinementConfig;
use crate::error::Result;
use crate::nn::{Activation, BatchNorm2d, Conv2d, ReplicationPad2d};
use crate::types::{Device, OperationMode};

const KERNEL: (i32, i32) = (5, 3);
const STRIDE: (i32, i32) = (2, 1);
const PAD: ReplicationPad2d = ReplicationPad2d {
    top: 1,
    bottom: 2,
    left: 1,
    right: 1,
};

/// Smallest frequency extent an encoder stage accepts.
pub const MIN_INPUT_BINS: i32 = KERNEL.0 - PAD.top - PAD.bottom;

/// Frequency extent after one encoder stage.
pub fn downsampled_len(freq: i32) -> i32 {
    (freq + PAD.top + PAD.bottom - KERNEL.0) / STRIDE.0 + 1
}

/// One encoder stage: `[act] -> pad -> conv -> [batch-norm]`.
#[derive(Debug, ModuleParameters)]
pub struct EncoderStage {
    /// Pre-activation; absent on the first stage.
    pub activation: Option<Activation>,
    /// Strided convolution.
    #[param]
    pub conv: Conv2d,
    /// Optional batch normalisation; never on the first stage.
    #[param]
    pub norm: Option<BatchNorm2d>,
}

impl EncoderStage {
    fn forward(&mut self, x: &Array, mode: OperationMode, device: Device) -> Result<Array> {
        let x = match &self.activation {
            Some(act) => act.forward(x)?,
            None => x.clone(),
        };
        let x = self.conv.forward(&PAD.forward(&x)?, device)?;
        match &mut self.norm {
            Some(norm) => norm.forward(&x, mode.is_training()),
            None => Ok(x),
        }
    }
}

/// Encoder stack.
#[derive(Debug, ModuleParameters)]
pub struct EncoderStack {
    /// Stages, input side first.
    #[param]
    pub stages: Vec<EncoderStage>,
}

impl EncoderStack {
    /// Build `widths.len() - 1` stages, stage `i` mapping `widths[i]` to
    /// `widths[i + 1]` channels.
    pub fn new(config: &RefinementConfig, widths: &[i32]) -> Result<Self> {
        let mut stages = Vec::with_capacity(widths.len().saturating_sub(1));
        for (i, pair) in widths.windows(2).enumerate() {
            let first = i == 0;
            let gain = if first {
                std::f32::consts::SQRT_2
            } else {
                config.init_gain()
            };
            let conv = Conv2d::new(
                pair[0],
                pair[1],
                KERNEL,
                STRIDE,
                gain,
                config.seed.wrapping_add(i as u64),
                config.use_weight_norm,
            )?;
            let norm = if !first && config.use_batchnorm {
                Some(BatchNorm2d::new(pair[1])?)
            } else {
                None
            };
            stages.push(EncoderStage {
                activation: (!first).then_some(Activation(config.act1)),
                conv,
                norm,
            });
        }
        Ok(Self { stages })
    }

    /// Run every stage, returning each stage's output in order.
    pub fn forward(
        &mut self,
        x: &Array,
        mode: OperationMode,
        device: Device,
    ) -> Result<Vec<Array>> {
        let mut outputs: Vec<Array> = Vec::with_capacity(self.stages.len());
        for stage in &mut self.stages {
            let input = outputs.last().unwrap_or(x);
            let y = stage.forward(input, mode, device)?;
            outputs.push(y);
        }
        Ok(outputs)
    }
}
