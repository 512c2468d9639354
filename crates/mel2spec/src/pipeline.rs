//! Two-stage vocoding: mel → linear magnitude → waveform.
//!
//! Stage one is any [`MelToLinear`] converter; stage two is any
//! [`LinearToAudio`] vocoder. The iterative phase reconstruction and the
//! perceptual scorers live outside this crate and are injected through
//! [`PhaseReconstructor`] and [`PerceptualScorer`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;
use serde::{Deserialize, Serialize};

use crate::audio::MelPseudoInverseProjector;
use crate::checkpoint::load_checkpoint;
use crate::config::RefinementConfig;
use crate::error::{Mel2SpecError, Result};
use crate::network::RefinementNetwork;
use crate::types::OperationMode;

/// Magnitude-to-waveform phase reconstruction (e.g. Griffin-Lim).
pub trait PhaseReconstructor {
    /// Invert a `[n_freq, T]` magnitude spectrogram to a waveform.
    fn invert(&self, magnitude: &Array, n_iters: i32, n_fft: i32) -> Result<Vec<f32>>;
}

/// Intrusive speech-quality metrics (e.g. STOI, PESQ).
pub trait PerceptualScorer {
    /// Score `candidate` against `reference`, keyed by metric name.
    fn evaluate(
        &self,
        reference: &[f32],
        candidate: &[f32],
        sample_rate: i32,
    ) -> Result<BTreeMap<String, f32>>;
}

/// Source of the recorded audio behind a batch sample.
pub trait ReferenceAudio {
    /// Load the waveform for `sample_id`.
    fn load(&self, sample_id: &str) -> Result<Vec<f32>>;
}

/// First stage: mel spectrogram to linear magnitude spectrogram.
pub trait MelToLinear {
    /// Convert `[B, 1, mel_freq, T]` to `[B, 1, n_freq, T]`.
    fn convert_mel_to_linear(&mut self, mel: &Array) -> Result<Array>;
}

/// Second stage: linear magnitude spectrogram to audio.
pub trait LinearToAudio {
    /// Convert `[B, 1, n_freq, T]` to zero-padded `[B, samples]`, using only
    /// the first `lengths[b]` frames of each sample when given.
    fn convert_linear_to_audio(&mut self, spec: &Array, lengths: Option<&[i32]>) -> Result<Array>;
}

/// Complete mel-to-audio vocoder.
pub trait Vocoder {
    /// Convert a log-mel spectrogram to audio.
    fn convert_mel_to_audio(&mut self, log_mel: &Array, lengths: Option<&[i32]>) -> Result<Array>;
}

/// Converter using only the pseudo-inverse projection.
#[derive(Debug)]
pub struct PseudoInverseMel2Spec {
    projector: MelPseudoInverseProjector,
}

impl PseudoInverseMel2Spec {
    /// Build the projector for `config`.
    pub fn new(config: &RefinementConfig) -> Result<Self> {
        Ok(Self {
            projector: MelPseudoInverseProjector::from_config(config)?,
        })
    }
}

impl MelToLinear for PseudoInverseMel2Spec {
    fn convert_mel_to_linear(&mut self, mel: &Array) -> Result<Array> {
        self.projector.mel_to_linear(mel)
    }
}

/// Converter running the refinement network in inference mode.
#[derive(Debug)]
pub struct RefinementMel2Spec {
    network: RefinementNetwork,
}

impl RefinementMel2Spec {
    /// Wrap a built or loaded network.
    pub fn new(network: RefinementNetwork) -> Self {
        Self { network }
    }

    /// The wrapped network.
    pub fn network(&self) -> &RefinementNetwork {
        &self.network
    }
}

impl MelToLinear for RefinementMel2Spec {
    fn convert_mel_to_linear(&mut self, mel: &Array) -> Result<Array> {
        self.network.forward(mel, OperationMode::Infer)
    }
}

/// Adapts a [`PhaseReconstructor`] into a [`LinearToAudio`] vocoder.
#[derive(Debug, Clone)]
pub struct PhaseReconstructionVocoder<R> {
    reconstructor: R,
    /// Reconstruction iterations.
    pub n_iters: i32,
    /// FFT size of the spectrogram.
    pub n_fft: i32,
    /// STFT hop size, sets the output length.
    pub hop_length: i32,
    /// Exponent applied to magnitudes before inversion.
    pub power: f32,
}

impl<R: PhaseReconstructor> PhaseReconstructionVocoder<R> {
    /// Create a vocoder raising magnitudes to the power 1.2.
    pub fn new(reconstructor: R, n_iters: i32, n_fft: i32, hop_length: i32) -> Self {
        Self {
            reconstructor,
            n_iters,
            n_fft,
            hop_length,
            power: 1.2,
        }
    }

    /// Invert one `[n_freq, T]` magnitude after the power law.
    pub fn invert_one(&self, magnitude: &Array) -> Result<Vec<f32>> {
        let magnitude = mlx_rs::ops::maximum(magnitude, &Array::from_f32(0.0))?;
        let sharpened = magnitude.power(&Array::from_f32(self.power))?;
        self.reconstructor
            .invert(&sharpened, self.n_iters, self.n_fft)
    }
}

impl<R: PhaseReconstructor> LinearToAudio for PhaseReconstructionVocoder<R> {
    fn convert_linear_to_audio(&mut self, spec: &Array, lengths: Option<&[i32]>) -> Result<Array> {
        let spec = as_rank4(spec)?;
        let (batch, frames) = (spec.dim(0), spec.dim(3));
        let lengths: Vec<i32> = match lengths {
            Some(lens) => {
                crate::loss::check_lengths(lens, batch, frames)?;
                lens.to_vec()
            }
            None => vec![frames; batch as usize],
        };

        let longest = lengths.iter().copied().max().unwrap_or(0);
        let samples = ((longest - 1) * self.hop_length).max(0) as usize;
        let mut audio = vec![0.0f32; batch as usize * samples];
        for (b, &len) in lengths.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let magnitude = spec.index((b as i32, 0, .., ..len));
            let wave = self.invert_one(&magnitude)?;
            let n = wave.len().min(samples);
            audio[b * samples..b * samples + n].copy_from_slice(&wave[..n]);
        }
        Ok(Array::from_slice(&audio, &[batch, samples as i32]))
    }
}

/// Mel converter followed by a linear vocoder.
#[derive(Debug)]
pub struct TwoStageVocoder<M, L> {
    /// First stage.
    pub mel2spec: M,
    /// Second stage.
    pub linvocoder: L,
}

impl<M: MelToLinear, L: LinearToAudio> TwoStageVocoder<M, L> {
    /// Compose two stages.
    pub fn new(mel2spec: M, linvocoder: L) -> Self {
        Self {
            mel2spec,
            linvocoder,
        }
    }
}

impl<M: MelToLinear, L: LinearToAudio> Vocoder for TwoStageVocoder<M, L> {
    /// `log_mel` is `[B, mel_freq, T]` or `[B, 1, mel_freq, T]` in natural-log
    /// magnitude; it is exponentiated before the first stage.
    fn convert_mel_to_audio(&mut self, log_mel: &Array, lengths: Option<&[i32]>) -> Result<Array> {
        let mel = as_rank4(log_mel)?.exp()?;
        let linear = self.mel2spec.convert_mel_to_linear(&mel)?;
        self.linvocoder.convert_linear_to_audio(&linear, lengths)
    }
}

fn as_rank4(x: &Array) -> Result<Array> {
    match x.ndim() {
        4 => Ok(x.clone()),
        3 => Ok(mlx_rs::ops::expand_dims(x, 1)?),
        _ => Err(Mel2SpecError::ShapeMismatch {
            expected: vec![-1, 1, -1, -1],
            actual: x.shape().to_vec(),
        }),
    }
}

/// Serialized selection of a mel-to-linear converter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ConverterConfig {
    /// Closed-form projection only.
    PseudoInverse {
        /// Acoustic parameters; only the filterbank fields are used.
        #[serde(default)]
        config: RefinementConfig,
    },
    /// Refinement network, freshly initialised or loaded from a checkpoint.
    Refinement {
        /// Architecture used when no checkpoint is given.
        #[serde(default)]
        config: RefinementConfig,
        /// Checkpoint directory; its stored configuration takes precedence.
        #[serde(default)]
        checkpoint: Option<PathBuf>,
    },
}

/// Resolve a converter configuration into a ready converter.
pub fn build_converter(config: &ConverterConfig) -> Result<Box<dyn MelToLinear>> {
    match config {
        ConverterConfig::PseudoInverse { config } => Ok(Box::new(PseudoInverseMel2Spec::new(config)?)),
        ConverterConfig::Refinement {
            checkpoint: Some(dir),
            ..
        } => {
            let (network, _) = load_checkpoint(dir)?;
            Ok(Box::new(RefinementMel2Spec::new(network)))
        }
        ConverterConfig::Refinement {
            config,
            checkpoint: None,
        } => Ok(Box::new(RefinementMel2Spec::new(RefinementNetwork::new(
            config.clone(),
        )?))),
    }
}
