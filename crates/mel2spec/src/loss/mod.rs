//! Training objective for the refinement network.
//!
//! All terms are masked by per-sample valid lengths: padded frames never
//! contribute to a numerator, and denominators count valid frames only.
//!
//! ```text
//! total = L1(pred, target)
//!       + lreg_factor * L1(M·target, M·pred)
//!       + Σ_(k, s) [ L1(maxpool_ks(pred), maxpool_ks(target))
//!                  + L1(maxpool_ks(-pred), maxpool_ks(-target)) ]
//! ```

mod modes;

use std::collections::BTreeMap;

use mlx_rs::Array;

pub use modes::{LossMode, PoolSpec};

use crate::audio::MelPseudoInverseProjector;
use crate::config::TrainParams;
use crate::error::{Mel2SpecError, Result};

/// Every term of one loss evaluation.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Weighted sum of all terms.
    pub total: Array,
    /// Masked L1 between prediction and target.
    pub primary: Array,
    /// Unweighted mel round-trip term.
    pub regularization: Array,
    /// Smoothness terms (both pooling directions), in table order.
    pub smoothness: Vec<(PoolSpec, Array)>,
}

impl LossBreakdown {
    /// Scalar values keyed `loss`, `loss_L1`, `loss_reg` and `loss_{k}_{s}`.
    pub fn scalars(&self) -> BTreeMap<String, f32> {
        let mut out = BTreeMap::new();
        out.insert("loss".to_string(), self.total.item::<f32>());
        out.insert("loss_L1".to_string(), self.primary.item::<f32>());
        out.insert("loss_reg".to_string(), self.regularization.item::<f32>());
        for (pair, term) in &self.smoothness {
            out.insert(format!("loss_{pair}"), term.item::<f32>());
        }
        out
    }
}

/// Multi-term masked loss.
///
/// Every term is a masked L1 normalised by the number of valid frames.
/// For the smoothness terms that count is taken after pooling: a sample of
/// `len` frames contributes `(len - kernel) / stride + 1` windows (zero when
/// `len < kernel`), so the denominator is the sum of pooled lengths, not
/// of raw lengths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossEngine {
    mode: LossMode,
    lreg_factor: f32,
}

impl LossEngine {
    /// Create an engine for loss-mode `loss_mode`.
    ///
    /// Unknown mode ids are rejected here rather than at evaluation time.
    pub fn new(loss_mode: i32, lreg_factor: f32) -> Result<Self> {
        Ok(Self {
            mode: LossMode::from_id(loss_mode)?,
            lreg_factor,
        })
    }

    /// Create an engine from training parameters.
    pub fn from_params(params: &TrainParams) -> Result<Self> {
        Self::new(params.loss_mode, params.lreg_factor)
    }

    /// Resolved loss mode.
    pub fn mode(&self) -> LossMode {
        self.mode
    }

    /// Weight of the regularization term.
    pub fn lreg_factor(&self) -> f32 {
        self.lreg_factor
    }

    /// Masked L1 over `[B, C, F, T]` tensors.
    ///
    /// Sums `|x - y|` over the first `lens[b]` frames of every sample (all
    /// channels and bins) and divides by `Σ lens`.
    pub fn masked_l1(x: &Array, y: &Array, lens: &[i32]) -> Result<Array> {
        check_pair(x, y)?;
        check_lengths(lens, x.dim(0), x.dim(3))?;
        let frames: i32 = lens.iter().sum();
        if frames == 0 {
            return Err(Mel2SpecError::InvalidLengths(
                "every sample has zero valid frames".to_string(),
            ));
        }
        masked_sum(x, y, lens)?
            .divide(&Array::from_f32(frames as f32))
            .map_err(Into::into)
    }

    /// Mel round-trip consistency: masked L1 between `M·target` and
    /// `M·prediction`, unweighted.
    pub fn regularization(
        &self,
        projector: &MelPseudoInverseProjector,
        prediction: &Array,
        target: &Array,
        lens: &[i32],
    ) -> Result<Array> {
        let target_mel = projector.linear_to_mel(target)?;
        let prediction_mel = projector.linear_to_mel(prediction)?;
        Self::masked_l1(&target_mel, &prediction_mel, lens)
    }

    /// One smoothness term per configured window, both pooling directions
    /// summed.
    ///
    /// Each direction is divided by the total pooled length across the
    /// batch.
    pub fn smoothness(
        &self,
        prediction: &Array,
        target: &Array,
        lens: &[i32],
    ) -> Result<Vec<(PoolSpec, Array)>> {
        check_pair(prediction, target)?;
        check_lengths(lens, prediction.dim(0), prediction.dim(3))?;
        let minus_one = Array::from_f32(-1.0);
        let neg_prediction = prediction.multiply(&minus_one)?;
        let neg_target = target.multiply(&minus_one)?;

        self.mode
            .pairs()
            .iter()
            .map(|&pair| {
                let upper = pooled_l1(prediction, target, lens, pair)?;
                let lower = pooled_l1(&neg_prediction, &neg_target, lens, pair)?;
                Ok((pair, upper.add(&lower)?))
            })
            .collect()
    }

    /// Evaluate every term and the weighted total.
    pub fn compute(
        &self,
        projector: &MelPseudoInverseProjector,
        prediction: &Array,
        target: &Array,
        lens: &[i32],
    ) -> Result<LossBreakdown> {
        let primary = Self::masked_l1(prediction, target, lens)?;
        let regularization = self.regularization(projector, prediction, target, lens)?;
        let smoothness = self.smoothness(prediction, target, lens)?;

        let mut total = primary.add(&regularization.multiply(&Array::from_f32(self.lreg_factor))?)?;
        for (_, term) in &smoothness {
            total = total.add(term)?;
        }

        Ok(LossBreakdown {
            total,
            primary,
            regularization,
            smoothness,
        })
    }
}

fn check_pair(x: &Array, y: &Array) -> Result<()> {
    if x.ndim() != 4 || x.shape() != y.shape() {
        return Err(Mel2SpecError::ShapeMismatch {
            expected: x.shape().to_vec(),
            actual: y.shape().to_vec(),
        });
    }
    Ok(())
}

/// Reject length lists that do not describe a `[batch, .., .., frames]`
/// tensor.
pub(crate) fn check_lengths(lens: &[i32], batch: i32, frames: i32) -> Result<()> {
    if lens.len() != batch as usize {
        return Err(Mel2SpecError::InvalidLengths(format!(
            "{} lengths for a batch of {batch}",
            lens.len()
        )));
    }
    if let Some(bad) = lens.iter().find(|&&len| len < 0 || len > frames) {
        return Err(Mel2SpecError::InvalidLengths(format!(
            "valid length {bad} outside 0..={frames}"
        )));
    }
    Ok(())
}

/// `Σ_b Σ_{t < lens[b]} |x - y|`, as a scalar.
fn masked_sum(x: &Array, y: &Array, lens: &[i32]) -> Result<Array> {
    let (batch, frames) = (x.dim(0), x.dim(3));
    let mask: Vec<f32> = lens
        .iter()
        .flat_map(|&len| (0..frames).map(move |t| if t < len { 1.0 } else { 0.0 }))
        .collect();
    let mask = Array::from_slice(&mask, &[batch, 1, 1, frames]);
    let diff = x.subtract(y)?.abs()?;
    Ok(diff.multiply(&mask)?.sum(None)?)
}

/// Max-pool `[B, C, F, T]` along time with window `k` and hop `s`.
///
/// Returns `None` when the sequence is shorter than one window.
fn max_pool_time(x: &Array, pair: PoolSpec) -> Result<Option<Array>> {
    let frames = x.dim(3);
    if frames < pair.kernel {
        return Ok(None);
    }
    let windows = (frames - pair.kernel) / pair.stride + 1;
    let indices: Vec<i32> = (0..windows)
        .flat_map(|w| (0..pair.kernel).map(move |j| w * pair.stride + j))
        .collect();
    let indices = Array::from_slice(&indices, &[windows * pair.kernel]);

    let shape = x.shape();
    let gathered = x.take_axis(&indices, 3)?.reshape(&[
        shape[0],
        shape[1],
        shape[2],
        windows,
        pair.kernel,
    ])?;
    Ok(Some(gathered.max_axis(-1, false)?))
}

/// Windows of a pooled sequence that lie entirely within `len` frames.
fn pooled_len(len: i32, pair: PoolSpec) -> i32 {
    if len < pair.kernel {
        0
    } else {
        (len - pair.kernel) / pair.stride + 1
    }
}

/// Masked L1 on a pooled pair. Zero when no window is fully valid.
fn pooled_l1(x: &Array, y: &Array, lens: &[i32], pair: PoolSpec) -> Result<Array> {
    let (Some(px), Some(py)) = (max_pool_time(x, pair)?, max_pool_time(y, pair)?) else {
        return Ok(Array::from_f32(0.0));
    };
    let pooled_lens: Vec<i32> = lens
        .iter()
        .map(|&len| pooled_len(len, pair).min(px.dim(3)))
        .collect();
    let frames: i32 = pooled_lens.iter().sum();
    if frames == 0 {
        return Ok(Array::from_f32(0.0));
    }
    masked_sum(&px, &py, &pooled_lens)?
        .divide(&Array::from_f32(frames as f32))
        .map_err(Into::into)
}
