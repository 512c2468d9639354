//! Learned elementwise gains at the end of the decoder.

use mlx_rs::macros::ModuleParameters;
use mlx_rs::module::Param;
use mlx_rs::Array;

use crate::error::{Mel2SpecError, Result};

/// Initial value of every per-bin output gain.
const FINALIZER_INIT: f32 = 0.001;

/// Per-frequency-bin gain on the single-channel decoder output.
///
/// Starting at `0.001` keeps the network output close to the
/// pseudo-inverse projection at initialisation.
#[derive(Debug, ModuleParameters)]
pub struct Finalizer {
    /// Gain, `[n_freq]`.
    #[param]
    pub gain: Param<Array>,
}

impl Finalizer {
    /// Create a finalizer for `n_freq` bins.
    pub fn new(n_freq: i32) -> Result<Self> {
        let gain = mlx_rs::ops::ones::<f32>(&[n_freq])?.multiply(&Array::from_f32(FINALIZER_INIT))?;
        Ok(Self {
            gain: Param::new(gain),
        })
    }

    /// Scale `[B, 1, n_freq, T]` bin by bin.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let n_freq = self.gain.as_ref().dim(0);
        if x.ndim() != 4 || x.dim(1) != 1 || x.dim(2) != n_freq {
            return Err(Mel2SpecError::ShapeMismatch {
                expected: vec![-1, 1, n_freq, -1],
                actual: x.shape().to_vec(),
            });
        }
        let gain = self.gain.as_ref().reshape(&[1, 1, n_freq, 1])?;
        Ok(x.multiply(&gain)?)
    }
}

/// Per-channel, per-bin gain applied before the last decoder stage.
#[derive(Debug, ModuleParameters)]
pub struct PreFinalGain {
    /// Gain, `[channels, bins]`, starts at one.
    #[param]
    pub gain: Param<Array>,
}

impl PreFinalGain {
    /// Create a unit gain of shape `[channels, bins]`.
    pub fn new(channels: i32, bins: i32) -> Result<Self> {
        Ok(Self {
            gain: Param::new(mlx_rs::ops::ones::<f32>(&[channels, bins])?),
        })
    }

    /// Scale `[B, channels, bins, T]`, broadcasting over batch and time.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let gain = self.gain.as_ref();
        let (channels, bins) = (gain.dim(0), gain.dim(1));
        if x.ndim() != 4 || x.dim(1) != channels || x.dim(2) != bins {
            return Err(Mel2SpecError::ShapeMismatch {
                expected: vec![-1, channels, bins, -1],
                actual: x.shape().to_vec(),
            });
        }
        Ok(x.multiply(&gain.reshape(&[1, channels, bins, 1])?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_scales_bins() {
        let mut finalizer = Finalizer::new(3).unwrap();
        finalizer.gain = Param::new(Array::from_slice(&[1.0f32, 2.0, 3.0], &[3]));
        let x = mlx_rs::ops::ones::<f32>(&[2, 1, 3, 2]).unwrap();
        let y = finalizer.forward(&x).unwrap();
        y.eval().unwrap();
        assert_eq!(
            y.as_slice::<f32>(),
            &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]
        );
    }

    #[test]
    fn test_finalizer_init() {
        let finalizer = Finalizer::new(513).unwrap();
        let gain = finalizer.gain.as_ref();
        gain.eval().unwrap();
        assert!(gain.as_slice::<f32>().iter().all(|g| (g - 0.001).abs() < 1e-9));
    }

    #[test]
    fn test_pre_final_rejects_wrong_width() {
        let gain = PreFinalGain::new(8, 256).unwrap();
        let x = mlx_rs::ops::ones::<f32>(&[1, 4, 256, 3]).unwrap();
        assert!(matches!(
            gain.forward(&x),
            Err(Mel2SpecError::ShapeMismatch { .. })
        ));
        let x = mlx_rs::ops::ones::<f32>(&[1, 8, 256, 3]).unwrap();
        assert_eq!(gain.forward(&x).unwrap().shape(), &[1, 8, 256, 3]);
    }
}
