//! Batch normalisation over `[batch, channels, frequency, time]`.

use mlx_rs::macros::ModuleParameters;
use mlx_rs::module::Param;
use mlx_rs::Array;

use crate::error::Result;

/// Per-channel batch normalisation with running statistics.
///
/// Training passes normalise with the batch statistics and fold them into
/// the running estimates (`momentum` 0.1, unbiased variance); every other
/// pass normalises with the running estimates. The running estimates are
/// buffers, not parameters.
#[derive(Debug, ModuleParameters)]
pub struct BatchNorm2d {
    /// Scale, `[C]`, starts at one.
    #[param]
    pub weight: Param<Array>,
    /// Shift, `[C]`, starts at zero.
    #[param]
    pub bias: Param<Array>,
    /// Running mean, `[C]`.
    pub running_mean: Array,
    /// Running variance, `[C]`.
    pub running_var: Array,
    /// Weight of the newest batch in the running estimates.
    pub momentum: f32,
    /// Variance floor.
    pub eps: f32,
}

impl BatchNorm2d {
    /// Create a batch-norm layer for `channels` channels.
    pub fn new(channels: i32) -> Result<Self> {
        Ok(Self {
            weight: Param::new(mlx_rs::ops::ones::<f32>(&[channels])?),
            bias: Param::new(mlx_rs::ops::zeros::<f32>(&[channels])?),
            running_mean: mlx_rs::ops::zeros::<f32>(&[channels])?,
            running_var: mlx_rs::ops::ones::<f32>(&[channels])?,
            momentum: 0.1,
            eps: 1e-5,
        })
    }

    /// Normalise `x`, updating the running statistics when `training`.
    pub fn forward(&mut self, x: &Array, training: bool) -> Result<Array> {
        let channels = self.running_mean.dim(0);
        let (mean, var) = if training {
            let count = (x.size() as i32 / channels) as f32;
            let n = Array::from_f32(count);
            let mean = x.sum_axes(&[0, 2, 3], Some(true))?.divide(&n)?;
            let var = x
                .subtract(&mean)?
                .square()?
                .sum_axes(&[0, 2, 3], Some(true))?
                .divide(&n)?;

            let unbiased = if count > 1.0 {
                var.multiply(&Array::from_f32(count / (count - 1.0)))?
            } else {
                var.clone()
            };
            let keep = Array::from_f32(1.0 - self.momentum);
            let m = Array::from_f32(self.momentum);
            self.running_mean = self
                .running_mean
                .multiply(&keep)?
                .add(&mean.reshape(&[channels])?.multiply(&m)?)?;
            self.running_var = self
                .running_var
                .multiply(&keep)?
                .add(&unbiased.reshape(&[channels])?.multiply(&m)?)?;
            (mean, var)
        } else {
            (
                self.running_mean.reshape(&[1, channels, 1, 1])?,
                self.running_var.reshape(&[1, channels, 1, 1])?,
            )
        };

        let std = var.add(&Array::from_f32(self.eps))?.sqrt()?;
        let normalized = x.subtract(&mean)?.divide(&std)?;
        let scale = self.weight.as_ref().reshape(&[1, channels, 1, 1])?;
        let shift = self.bias.as_ref().reshape(&[1, channels, 1, 1])?;
        Ok(normalized.multiply(&scale)?.add(&shift)?)
    }

    /// Running statistics keyed by buffer name.
    pub fn buffers(&self) -> [(&'static str, &Array); 2] {
        [
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
        ]
    }

    /// Mutable access to the running statistics, keyed like [`Self::buffers`].
    pub fn buffers_mut(&mut self) -> [(&'static str, &mut Array); 2] {
        [
            ("running_mean", &mut self.running_mean),
            ("running_var", &mut self.running_var),
        ]
    }
}
