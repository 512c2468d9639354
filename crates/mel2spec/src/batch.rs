//! Batches handed over by an external data loader.

use mlx_rs::Array;

use crate::error::{Mel2SpecError, Result};
use crate::loss::check_lengths;

/// Zero-padded linear spectrograms with their valid lengths.
#[derive(Debug, Clone)]
pub struct SpectrogramBatch {
    /// Target magnitudes, `[B, 1, n_freq, T]`.
    pub spectrogram: Array,
    /// Valid frames per sample, each at most `T`.
    pub valid_lengths: Vec<i32>,
    /// Identifiers used to look up reference audio.
    pub sample_ids: Vec<String>,
}

impl SpectrogramBatch {
    /// Create a batch, rejecting metadata that does not describe the tensor.
    pub fn new(spectrogram: Array, valid_lengths: Vec<i32>, sample_ids: Vec<String>) -> Result<Self> {
        let batch = Self {
            spectrogram,
            valid_lengths,
            sample_ids,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Number of samples.
    pub fn batch_size(&self) -> i32 {
        self.spectrogram.dim(0)
    }

    /// Padded time extent.
    pub fn frames(&self) -> i32 {
        self.spectrogram.dim(3)
    }

    /// Check rank, channel count and length metadata.
    pub fn validate(&self) -> Result<()> {
        let shape = self.spectrogram.shape();
        if shape.len() != 4 || shape[1] != 1 {
            return Err(Mel2SpecError::ShapeMismatch {
                expected: vec![-1, 1, -1, -1],
                actual: shape.to_vec(),
            });
        }
        check_lengths(&self.valid_lengths, shape[0], shape[3])?;
        if self.sample_ids.len() != self.valid_lengths.len() {
            return Err(Mel2SpecError::InvalidLengths(format!(
                "{} sample ids for a batch of {}",
                self.sample_ids.len(),
                shape[0]
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("utt{i}")).collect()
    }

    #[test]
    fn test_valid_batch() {
        let spec = mlx_rs::ops::zeros::<f32>(&[2, 1, 513, 50]).unwrap();
        let batch = SpectrogramBatch::new(spec, vec![50, 30], ids(2)).unwrap();
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.frames(), 50);
    }

    #[test]
    fn test_length_beyond_extent() {
        let spec = mlx_rs::ops::zeros::<f32>(&[2, 1, 513, 50]).unwrap();
        assert!(matches!(
            SpectrogramBatch::new(spec, vec![51, 30], ids(2)),
            Err(Mel2SpecError::InvalidLengths(_))
        ));
    }

    #[test]
    fn test_count_mismatch() {
        let spec = mlx_rs::ops::zeros::<f32>(&[2, 1, 513, 50]).unwrap();
        assert!(matches!(
            SpectrogramBatch::new(spec.clone(), vec![50], ids(1)),
            Err(Mel2SpecError::InvalidLengths(_))
        ));
        assert!(matches!(
            SpectrogramBatch::new(spec, vec![50, 30], ids(3)),
            Err(Mel2SpecError::InvalidLengths(_))
        ));
    }

    #[test]
    fn test_rejects_multichannel() {
        let spec = mlx_rs::ops::zeros::<f32>(&[2, 2, 513, 50]).unwrap();
        assert!(matches!(
            SpectrogramBatch::new(spec, vec![50, 30], ids(2)),
            Err(Mel2SpecError::ShapeMismatch { .. })
        ));
    }
}
