//! Refinement network and training configuration.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Mel2SpecError, Result};

/// Channel widths of the encoder, as multiples of `ngf` (entry 0 is the
/// single input channel).
const WIDTH_MULTIPLIERS: [i32; 9] = [1, 2, 4, 8, 8, 8, 8, 8, 8];

/// Deepest supported encoder.
pub const MAX_LAYERS: i32 = WIDTH_MULTIPLIERS.len() as i32;

/// Refinement network hyperparameters.
///
/// Everything needed to rebuild the architecture before loading weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementConfig {
    /// FFT size of the target linear spectrogram.
    #[serde(default = "default_n_fft")]
    pub n_fft: i32,

    /// STFT hop size in samples.
    #[serde(default = "default_hop_length")]
    pub hop_length: i32,

    /// Lowest mel filter edge in Hz.
    #[serde(default)]
    pub mel_fmin: f32,

    /// Highest mel filter edge in Hz (defaults to Nyquist).
    #[serde(default)]
    pub mel_fmax: Option<f32>,

    /// Number of mel bins.
    #[serde(default = "default_mel_freq")]
    pub mel_freq: i32,

    /// Number of encoder (and decoder) stages.
    #[serde(default = "default_layers")]
    pub layers: i32,

    /// Audio sampling rate in Hz.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: i32,

    /// Training crop length in frames.
    #[serde(default = "default_subseq_len")]
    pub subseq_len: i32,

    /// Base channel width.
    #[serde(default = "default_ngf")]
    pub ngf: i32,

    /// Batch normalisation after encoder/decoder convolutions.
    #[serde(default = "default_true")]
    pub use_batchnorm: bool,

    /// Dropout probability in the first `num_dropout` decoder stages.
    #[serde(default)]
    pub droprate: f32,

    /// Number of decoder stages receiving dropout.
    #[serde(default)]
    pub num_dropout: i32,

    /// Learned gain before the last decoder stage.
    #[serde(default)]
    pub pre_final_lin: bool,

    /// Encoder activation.
    #[serde(default = "default_act1")]
    pub act1: ActivationType,

    /// Decoder activation.
    #[serde(default = "default_act2")]
    pub act2: ActivationType,

    /// Weight-normalised convolutions.
    #[serde(default)]
    pub use_weight_norm: bool,

    /// Initialization gain parameter (λ).
    #[serde(default = "default_lamb")]
    pub lamb: f32,

    /// Seed for weight initialization.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Activation function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    /// Logistic sigmoid.
    Sigmoid,
    /// Rectified linear unit.
    Relu,
    /// Identity.
    None,
    /// Leaky ReLU with negative slope 0.1.
    #[default]
    Lrelu,
    /// Scaled exponential linear unit.
    Selu,
}

impl FromStr for ActivationType {
    type Err = Mel2SpecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sigmoid" => Ok(Self::Sigmoid),
            "relu" => Ok(Self::Relu),
            "none" => Ok(Self::None),
            "lrelu" => Ok(Self::Lrelu),
            "selu" => Ok(Self::Selu),
            other => Err(Mel2SpecError::Config(format!("unknown activation '{other}'"))),
        }
    }
}

fn default_n_fft() -> i32 {
    1024
}
fn default_hop_length() -> i32 {
    256
}
fn default_mel_freq() -> i32 {
    80
}
fn default_layers() -> i32 {
    6
}
fn default_sampling_rate() -> i32 {
    22050
}
fn default_subseq_len() -> i32 {
    256
}
fn default_ngf() -> i32 {
    16
}
fn default_true() -> bool {
    true
}
fn default_act1() -> ActivationType {
    ActivationType::Lrelu
}
fn default_act2() -> ActivationType {
    ActivationType::Relu
}
fn default_lamb() -> f32 {
    0.1
}
fn default_seed() -> u64 {
    42
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self::ljspeech_22khz()
    }
}

impl RefinementConfig {
    /// LJSpeech-style setup: 22.05kHz, n_fft 1024, 80 mel bins, 6 layers,
    /// widening factor 16.
    pub fn ljspeech_22khz() -> Self {
        Self {
            n_fft: 1024,
            hop_length: 256,
            mel_fmin: 0.0,
            mel_fmax: Some(8000.0),
            mel_freq: 80,
            layers: 6,
            sampling_rate: 22050,
            subseq_len: 256,
            ngf: 16,
            use_batchnorm: true,
            droprate: 0.0,
            num_dropout: 0,
            pre_final_lin: false,
            act1: ActivationType::Lrelu,
            act2: ActivationType::Relu,
            use_weight_norm: false,
            lamb: 0.1,
            seed: 42,
        }
    }

    /// Two-stage, four-channel network used by tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            layers: 2,
            ngf: 4,
            mel_fmax: None,
            ..Self::ljspeech_22khz()
        }
    }

    /// Number of linear frequency bins, `n_fft / 2 + 1`.
    pub fn n_freq(&self) -> i32 {
        self.n_fft / 2 + 1
    }

    /// Encoder channel widths, `layers + 1` entries starting at 1.
    pub fn width_schedule(&self) -> Result<Vec<i32>> {
        if self.layers < 1 || self.layers > MAX_LAYERS {
            return Err(Mel2SpecError::Config(format!(
                "layers must be in 1..={MAX_LAYERS}, got {}",
                self.layers
            )));
        }
        let mut widths = Vec::with_capacity(self.layers as usize + 1);
        widths.push(1);
        widths.extend(
            WIDTH_MULTIPLIERS
                .iter()
                .take(self.layers as usize)
                .map(|m| m * self.ngf),
        );
        Ok(widths)
    }

    /// Gain of every convolution except the first encoder stage.
    pub fn init_gain(&self) -> f32 {
        let lamb = self.lamb as f64;
        ((2.0 / (1.0 + lamb * lamb)).sqrt() / 2.0_f64.sqrt()) as f32
    }

    /// Check hyperparameters that do not depend on derived tensor shapes.
    pub fn validate(&self) -> Result<()> {
        self.width_schedule()?;
        if self.ngf < 1 {
            return Err(Mel2SpecError::Config(format!(
                "ngf must be positive, got {}",
                self.ngf
            )));
        }
        if self.n_fft < 4 || self.n_fft % 2 != 0 {
            return Err(Mel2SpecError::Config(format!(
                "n_fft must be an even number >= 4, got {}",
                self.n_fft
            )));
        }
        if self.hop_length < 1 || self.sampling_rate < 1 {
            return Err(Mel2SpecError::Config(
                "hop_length and sampling_rate must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.droprate) {
            return Err(Mel2SpecError::Config(format!(
                "droprate must be in [0, 1), got {}",
                self.droprate
            )));
        }
        if self.num_dropout < 0 {
            return Err(Mel2SpecError::Config(format!(
                "num_dropout must be non-negative, got {}",
                self.num_dropout
            )));
        }
        if !self.lamb.is_finite() {
            return Err(Mel2SpecError::Config("lamb must be finite".to_string()));
        }
        Ok(())
    }
}

/// Training objective parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    /// Smoothness loss-mode id (0-9).
    #[serde(default)]
    pub loss_mode: i32,

    /// Weight of the mel round-trip regularizer.
    #[serde(default = "default_lreg_factor")]
    pub lreg_factor: f32,

    /// Reconstruct audio during validation and report perceptual scores.
    #[serde(default)]
    pub validate_scores: bool,

    /// Phase-reconstruction iterations used for validation scoring.
    #[serde(default = "default_griffin_lim_iters")]
    pub griffin_lim_iters: i32,
}

fn default_lreg_factor() -> f32 {
    0.5
}
fn default_griffin_lim_iters() -> i32 {
    32
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            loss_mode: 0,
            lreg_factor: default_lreg_factor(),
            validate_scores: false,
            griffin_lim_iters: default_griffin_lim_iters(),
        }
    }
}

/// Complete model configuration as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mel2SpecConfig {
    /// Network hyperparameters.
    pub mel2spec: RefinementConfig,

    /// Training objective.
    #[serde(default)]
    pub train_params: TrainParams,
}

impl Mel2SpecConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            other => Err(Mel2SpecError::Config(format!(
                "unsupported config extension {other:?} for {}",
                path.display()
            ))),
        }
    }
}
