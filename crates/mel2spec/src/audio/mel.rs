//! Slaney-normalised mel filterbank construction.

use crate::error::{Mel2SpecError, Result};

/// Mel filterbank configuration.
#[derive(Debug, Clone)]
pub struct MelConfig {
    /// Sampling rate in Hz.
    pub sr: i32,
    /// Number of FFT bins.
    pub n_fft: i32,
    /// Number of mel frequency bins.
    pub n_mels: i32,
    /// Minimum frequency in Hz.
    pub fmin: f32,
    /// Maximum frequency in Hz (defaults to sr/2).
    pub fmax: Option<f32>,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sr: 22050,
            n_fft: 1024,
            n_mels: 80,
            fmin: 0.0,
            fmax: None,
        }
    }
}

impl MelConfig {
    /// Number of linear frequency bins, `n_fft / 2 + 1`.
    pub fn n_freqs(&self) -> i32 {
        self.n_fft / 2 + 1
    }

    fn check(&self) -> Result<f64> {
        let nyquist = self.sr as f64 / 2.0;
        let fmax = self.fmax.map(f64::from).unwrap_or(nyquist);
        if self.sr < 1 || self.n_fft < 2 || self.n_mels < 1 {
            return Err(Mel2SpecError::Config(format!(
                "filterbank needs positive sr, n_fft >= 2 and n_mels >= 1 (sr={}, n_fft={}, n_mels={})",
                self.sr, self.n_fft, self.n_mels
            )));
        }
        if self.n_mels > self.n_freqs() {
            return Err(Mel2SpecError::Config(format!(
                "mel_freq ({}) exceeds the number of linear bins ({})",
                self.n_mels,
                self.n_freqs()
            )));
        }
        if self.fmin < 0.0 || fmax <= self.fmin as f64 || fmax > nyquist {
            return Err(Mel2SpecError::Config(format!(
                "mel band edges must satisfy 0 <= fmin < fmax <= {nyquist}, got [{}, {fmax}]",
                self.fmin
            )));
        }
        Ok(fmax)
    }
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

/// Convert frequency in Hz to the Slaney mel scale (linear below 1 kHz,
/// logarithmic above).
pub fn hz_to_mel(freq: f64) -> f64 {
    if freq >= MIN_LOG_HZ {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / log_step()
    } else {
        freq / F_SP
    }
}

/// Convert a Slaney mel value to frequency in Hz.
pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * ((mel - MIN_LOG_MEL) * log_step()).exp()
    } else {
        F_SP * mel
    }
}

/// Create the mel filterbank weights on the host, row-major
/// `[n_mels, n_fft/2+1]`.
///
/// Filters are triangles between consecutive mel-spaced edges evaluated on
/// the exact FFT bin centre frequencies, matching librosa's `filters.mel`.
pub fn mel_filterbank_weights(config: &MelConfig) -> Result<Vec<f64>> {
    let fmax = config.check()?;
    let n_freqs = config.n_freqs() as usize;
    let n_mels = config.n_mels as usize;

    let nyquist = config.sr as f64 / 2.0;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| nyquist * k as f64 / (n_freqs - 1) as f64)
        .collect();

    let mel_min = hz_to_mel(config.fmin as f64);
    let mel_max = hz_to_mel(fmax);
    let mel_edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| {
            let mel = mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64;
            mel_to_hz(mel)
        })
        .collect();

    let mut weights = vec![0.0f64; n_mels * n_freqs];
    for m in 0..n_mels {
        let lower_width = mel_edges[m + 1] - mel_edges[m];
        let upper_width = mel_edges[m + 2] - mel_edges[m + 1];
        // Slaney normalisation: unit area per filter.
        let enorm = 2.0 / (mel_edges[m + 2] - mel_edges[m]);

        for (k, &f) in fft_freqs.iter().enumerate() {
            let rising = (f - mel_edges[m]) / lower_width;
            let falling = (mel_edges[m + 2] - f) / upper_width;
            weights[m * n_freqs + k] = rising.min(falling).max(0.0) * enorm;
        }
    }

    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hz_to_mel_slaney() {
        // Linear region ends at 1000 Hz = 15 mel
        let mel = hz_to_mel(1000.0);
        assert!((mel - 15.0).abs() < 1e-9);
        assert!((hz_to_mel(200.0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_mel_to_hz_roundtrip() {
        for freq in [0.0, 440.0, 1000.0, 2000.0, 7999.0] {
            let back = mel_to_hz(hz_to_mel(freq));
            assert!((freq - back).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mel_filterbank_shape() {
        let config = MelConfig::default();
        let weights = mel_filterbank_weights(&config).unwrap();
        assert_eq!(weights.len(), 80 * 513);
    }

    #[test]
    fn test_filters_are_nonnegative_and_nonempty() {
        let config = MelConfig::default();
        let weights = mel_filterbank_weights(&config).unwrap();
        let n_freqs = config.n_freqs() as usize;

        assert!(weights.iter().all(|w| *w >= 0.0));
        for row in weights.chunks(n_freqs) {
            assert!(row.iter().any(|w| *w > 0.0));
        }
    }

    #[test]
    fn test_slaney_area_is_constant() {
        // Slaney normalisation divides by the filter's Hz width, so every
        // filter integrates to ~1 over Hz (up to bin quantisation).
        let config = MelConfig {
            n_fft: 4096,
            n_mels: 20,
            ..Default::default()
        };
        let weights = mel_filterbank_weights(&config).unwrap();
        let n_freqs = config.n_freqs() as usize;
        let bin_hz = config.sr as f64 / config.n_fft as f64;

        for row in weights.chunks(n_freqs) {
            let area: f64 = row.iter().sum::<f64>() * bin_hz;
            assert!((area - 1.0).abs() < 0.1, "area {area}");
        }
    }

    #[test]
    fn test_rejects_too_many_mels() {
        let config = MelConfig {
            n_fft: 64,
            n_mels: 40,
            ..Default::default()
        };
        assert!(matches!(
            mel_filterbank_weights(&config),
            Err(Mel2SpecError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_inverted_band() {
        let config = MelConfig {
            fmin: 4000.0,
            fmax: Some(2000.0),
            ..Default::default()
        };
        assert!(mel_filterbank_weights(&config).is_err());
    }
}
