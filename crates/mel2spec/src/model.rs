//! Training-driver surface: network, objective and validation metrics.

use std::collections::BTreeMap;

use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;
use tracing::warn;

use crate::batch::SpectrogramBatch;
use crate::config::{Mel2SpecConfig, TrainParams};
use crate::error::{Mel2SpecError, Result};
use crate::loss::{LossBreakdown, LossEngine};
use crate::network::RefinementNetwork;
use crate::pipeline::{PerceptualScorer, PhaseReconstructor, ReferenceAudio};
use crate::types::OperationMode;

/// External collaborators needed for perceptual validation scores.
pub struct ValidationScoring<'a> {
    /// Magnitude-to-waveform inversion.
    pub reconstructor: &'a dyn PhaseReconstructor,
    /// Speech-quality metrics.
    pub scorer: &'a dyn PerceptualScorer,
    /// Recorded audio for each sample id.
    pub references: &'a dyn ReferenceAudio,
}

/// Refinement network bundled with its training objective.
#[derive(Debug)]
pub struct Mel2SpecModel {
    network: RefinementNetwork,
    loss: LossEngine,
    train_params: TrainParams,
}

impl Mel2SpecModel {
    /// Build a fresh network and loss engine.
    pub fn new(config: Mel2SpecConfig) -> Result<Self> {
        let loss = LossEngine::from_params(&config.train_params)?;
        let network = RefinementNetwork::new(config.mel2spec)?;
        Ok(Self {
            network,
            loss,
            train_params: config.train_params,
        })
    }

    /// Wrap an existing (e.g. loaded) network.
    pub fn from_network(network: RefinementNetwork, train_params: TrainParams) -> Result<Self> {
        Ok(Self {
            loss: LossEngine::from_params(&train_params)?,
            network,
            train_params,
        })
    }

    /// The refinement network.
    pub fn network(&self) -> &RefinementNetwork {
        &self.network
    }

    /// The refinement network, mutably (relocation, parameter updates).
    pub fn network_mut(&mut self) -> &mut RefinementNetwork {
        &mut self.network
    }

    /// The loss engine.
    pub fn loss_engine(&self) -> &LossEngine {
        &self.loss
    }

    /// Training parameters.
    pub fn train_params(&self) -> &TrainParams {
        &self.train_params
    }

    /// Full configuration, as persisted.
    pub fn config(&self) -> Mel2SpecConfig {
        Mel2SpecConfig {
            mel2spec: self.network.config().clone(),
            train_params: self.train_params.clone(),
        }
    }

    /// Refine `mel` in the given mode.
    pub fn forward(&mut self, mel: &Array, mode: OperationMode) -> Result<Array> {
        self.network.forward(mel, mode)
    }

    /// Inference-mode conversion of `[B, 1, mel_freq, T]` mel spectrograms.
    pub fn convert_mel_to_linear(&mut self, mel: &Array) -> Result<Array> {
        self.network.forward(mel, OperationMode::Infer)
    }

    /// Training loss for one batch.
    ///
    /// The mel input is derived from the target (`M·y`), so the
    /// regularization term compares that input with `M·prediction`.
    pub fn compute_training_loss(&mut self, batch: &SpectrogramBatch) -> Result<LossBreakdown> {
        let (_, losses) = self.evaluate(batch, OperationMode::Training)?;
        check_finite("training loss", &losses.total)?;
        Ok(losses)
    }

    /// Validation metrics for one batch: `val_loss`, `loss_L1`, `loss_reg`
    /// and `loss_{k}_{s}` per smoothness window.
    ///
    /// With `validate_scores` set and `scoring` supplied, also reports
    /// `{metric}_real` (prediction reconstruction against the recording) and
    /// `{metric}_est` (prediction reconstruction against the target
    /// reconstruction), averaged over the batch.
    pub fn compute_validation_metrics(
        &mut self,
        batch: &SpectrogramBatch,
        scoring: Option<ValidationScoring<'_>>,
    ) -> Result<BTreeMap<String, f32>> {
        let (prediction, losses) = self.evaluate(batch, OperationMode::Validation)?;
        check_finite("validation loss", &losses.total)?;

        let mut metrics = losses.scalars();
        if let Some(total) = metrics.remove("loss") {
            metrics.insert("val_loss".to_string(), total);
        }

        if self.train_params.validate_scores {
            match scoring {
                Some(scoring) => {
                    let scores = self.perceptual_scores(batch, &prediction, &scoring)?;
                    metrics.extend(scores);
                }
                None => warn!("validate_scores is set but no scoring components were supplied"),
            }
        }
        Ok(metrics)
    }

    fn evaluate(
        &mut self,
        batch: &SpectrogramBatch,
        mode: OperationMode,
    ) -> Result<(Array, LossBreakdown)> {
        batch.validate()?;
        let target = &batch.spectrogram;
        let n_freq = self.network.config().n_freq();
        if target.dim(2) != n_freq {
            return Err(Mel2SpecError::ShapeMismatch {
                expected: vec![target.dim(0), 1, n_freq, target.dim(3)],
                actual: target.shape().to_vec(),
            });
        }

        self.network.ensure_same_device()?;
        let mel = self.network.projector().linear_to_mel(target)?;
        let prediction = self.network.forward(&mel, mode)?;
        let losses = self.loss.compute(
            self.network.projector(),
            &prediction,
            target,
            &batch.valid_lengths,
        )?;
        Ok((prediction, losses))
    }

    fn perceptual_scores(
        &self,
        batch: &SpectrogramBatch,
        prediction: &Array,
        scoring: &ValidationScoring<'_>,
    ) -> Result<BTreeMap<String, f32>> {
        let config = self.network.config();
        let iters = self.train_params.griffin_lim_iters;
        let invert = |spec: &Array, b: usize, len: i32| {
            let magnitude = spec.index((b as i32, 0, .., ..len));
            scoring.reconstructor.invert(&magnitude, iters, config.n_fft)
        };

        let mut sums: BTreeMap<String, f32> = BTreeMap::new();
        let count = batch.sample_ids.len();
        for (b, sample_id) in batch.sample_ids.iter().enumerate() {
            let len = batch.valid_lengths[b];
            let recorded = scoring.references.load(sample_id)?;
            let target_wave = invert(&batch.spectrogram, b, len)?;
            let estimate_wave = invert(prediction, b, len)?;

            let n = recorded.len().min(target_wave.len()).min(estimate_wave.len());
            let sr = config.sampling_rate;
            let real = scoring
                .scorer
                .evaluate(&estimate_wave[..n], &recorded[..n], sr)?;
            let est = scoring
                .scorer
                .evaluate(&estimate_wave[..n], &target_wave[..n], sr)?;

            for (name, value) in real {
                *sums.entry(format!("{}_real", name.to_lowercase())).or_default() += value;
            }
            for (name, value) in est {
                *sums.entry(format!("{}_est", name.to_lowercase())).or_default() += value;
            }
        }

        for value in sums.values_mut() {
            *value /= count.max(1) as f32;
        }
        Ok(sums)
    }
}

fn check_finite(what: &str, value: &Array) -> Result<()> {
    let v = value.item::<f32>();
    if !v.is_finite() {
        return Err(Mel2SpecError::NonFinite(format!("{what} ({v})")));
    }
    Ok(())
}

/// Running per-key means of validation metrics over an epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
}

impl MetricsAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch worth of metrics.
    pub fn push(&mut self, metrics: &BTreeMap<String, f32>) {
        for (name, value) in metrics {
            *self.sums.entry(name.clone()).or_default() += f64::from(*value);
            *self.counts.entry(name.clone()).or_default() += 1;
        }
    }

    /// Number of batches that reported `name`.
    pub fn count(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    /// Mean of every key seen so far.
    pub fn means(&self) -> BTreeMap<String, f32> {
        self.sums
            .iter()
            .map(|(name, sum)| {
                let n = self.count(name).max(1) as f64;
                (name.clone(), (sum / n) as f32)
            })
            .collect()
    }

    /// Clear for the next epoch.
    pub fn reset(&mut self) {
        self.sums.clear();
        self.counts.clear();
    }
}
