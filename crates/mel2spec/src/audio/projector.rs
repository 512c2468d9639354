//! Fixed mel ↔ linear projection.
//!
//! The forward operator `M` is the mel filterbank; the backward operator `P`
//! is its Moore-Penrose pseudo-inverse, computed once in double precision
//! from `M` itself. `M·P` is the identity only when `M` has full row rank
//! and `P·M` never is, so `linear_to_mel(mel_to_linear(x))` is a lossy round
//! trip in general.

use mlx_rs::Array;
use nalgebra::DMatrix;

use super::mel::{mel_filterbank_weights, MelConfig};
use crate::config::RefinementConfig;
use crate::error::{Mel2SpecError, Result};
use crate::types::Device;

/// Relative singular-value cutoff for the pseudo-inverse.
const PINV_RCOND: f64 = 1e-15;

/// Pseudo-inverse projector between mel and linear spectrograms.
#[derive(Debug)]
pub struct MelPseudoInverseProjector {
    /// Mel filterbank `M` as `[1, 1, mel_freq, n_freq]`.
    basis: Array,
    /// Pseudo-inverse `P` as `[1, 1, n_freq, mel_freq]`.
    inverse: Array,
    mel_freq: i32,
    n_freq: i32,
    device: Device,
}

impl MelPseudoInverseProjector {
    /// Build the filterbank pair from acoustic parameters.
    pub fn new(config: &MelConfig) -> Result<Self> {
        let weights = mel_filterbank_weights(config)?;
        let mel_freq = config.n_mels;
        let n_freq = config.n_freqs();

        let m = DMatrix::from_row_slice(mel_freq as usize, n_freq as usize, &weights);
        let svd = m.svd(true, true);
        let cutoff = PINV_RCOND * svd.singular_values.max();
        let pinv = svd
            .pseudo_inverse(cutoff)
            .map_err(|e| Mel2SpecError::Config(format!("pseudo-inverse failed: {e}")))?;

        // nalgebra is column-major; transpose to read rows out in order.
        let inverse: Vec<f32> = pinv.transpose().iter().map(|v| *v as f32).collect();
        let basis: Vec<f32> = weights.iter().map(|v| *v as f32).collect();

        Ok(Self {
            basis: Array::from_slice(&basis, &[1, 1, mel_freq, n_freq]),
            inverse: Array::from_slice(&inverse, &[1, 1, n_freq, mel_freq]),
            mel_freq,
            n_freq,
            device: Device::default(),
        })
    }

    /// Build the projector described by a network configuration.
    pub fn from_config(config: &RefinementConfig) -> Result<Self> {
        Self::new(&MelConfig {
            sr: config.sampling_rate,
            n_fft: config.n_fft,
            n_mels: config.mel_freq,
            fmin: config.mel_fmin,
            fmax: config.mel_fmax,
            ..Default::default()
        })
    }

    /// Number of mel bins.
    pub fn mel_freq(&self) -> i32 {
        self.mel_freq
    }

    /// Number of linear bins.
    pub fn n_freq(&self) -> i32 {
        self.n_freq
    }

    /// Device the projections run on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Mel filterbank `M`, `[mel_freq, n_freq]`.
    pub fn basis(&self) -> Result<Array> {
        Ok(self.basis.reshape(&[self.mel_freq, self.n_freq])?)
    }

    /// Pseudo-inverse `P`, `[n_freq, mel_freq]`.
    pub fn inverse(&self) -> Result<Array> {
        Ok(self.inverse.reshape(&[self.n_freq, self.mel_freq])?)
    }

    /// Project `[B, C, mel_freq, T]` to `[B, C, n_freq, T]`.
    pub fn mel_to_linear(&self, x: &Array) -> Result<Array> {
        self.check_input(x, self.mel_freq)?;
        Ok(mlx_rs::ops::matmul_device(
            &self.inverse,
            x,
            self.device.stream(),
        )?)
    }

    /// Project `[B, C, n_freq, T]` to `[B, C, mel_freq, T]`.
    pub fn linear_to_mel(&self, x: &Array) -> Result<Array> {
        self.check_input(x, self.n_freq)?;
        Ok(mlx_rs::ops::matmul_device(&self.basis, x, self.device.stream())?)
    }

    /// Move the projection matrices. Only the owning network may do this,
    /// so both always travel together.
    pub(crate) fn relocate(&mut self, device: Device) {
        self.device = device;
    }

    fn check_input(&self, x: &Array, bins: i32) -> Result<()> {
        if x.ndim() != 4 || x.dim(2) != bins {
            let shape = x.shape().to_vec();
            return Err(Mel2SpecError::ShapeMismatch {
                expected: vec![shape.first().copied().unwrap_or(-1), 1, bins, -1],
                actual: shape,
            });
        }
        Ok(())
    }
}
