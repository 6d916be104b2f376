//! Learned transition hyperparameters of the k-mer HMM, one block per
//! read strand, re-estimated from posterior decodes.

use crate::khmm::AlignOp;
use serde::{Deserialize, Serialize};

/// Width of one skip-probability bin, in picoamps of level difference.
pub const SKIP_BIN_WIDTH: f64 = 0.5;
/// Number of bins; differences beyond the last bin clamp into it.
pub const SKIP_N_BINS: usize = 30;
/// Minimum observations a bin needs before training replaces its value.
const MIN_BIN_OBSERVATIONS: usize = 20;

/// One decoded k-mer transition, recorded for training.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransitionObservation {
    pub level_from: f64,
    pub level_to: f64,
    pub kind: AlignOp,
}

/// Observations accumulated from posterior decodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingData {
    pub transitions: Vec<TransitionObservation>,
    pub emissions_for_matches: Vec<f64>,
    pub n_matches: usize,
    pub n_merges: usize,
    pub n_skips: usize,
}

impl TrainingData {
    fn clear(&mut self) {
        self.transitions.clear();
        self.emissions_for_matches.clear();
        self.n_matches = 0;
        self.n_merges = 0;
        self.n_skips = 0;
    }
}

/// Per-strand HMM hyperparameters. The skip probability is tabulated
/// over the absolute difference of the two k-mer levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KhmmParameters {
    pub self_transition: f64,
    skip_probabilities: Vec<f64>,
    pub fit_quality: f64,
    pub training_data: TrainingData,
}

impl Default for KhmmParameters {
    fn default() -> Self {
        let skip_probabilities = (0..SKIP_N_BINS)
            .map(|bin| default_skip_probability(bin as f64 * SKIP_BIN_WIDTH))
            .collect();
        Self {
            self_transition: 0.3,
            skip_probabilities,
            fit_quality: 0.0,
            training_data: TrainingData::default(),
        }
    }
}

// Untrained prior: skip mass decays toward a random-skip floor of 0.05
// as the two levels separate.
fn default_skip_probability(level_diff: f64) -> f64 {
    0.05 + 0.25 * (-level_diff / 4.0).exp()
}

fn skip_bin(level_from: f64, level_to: f64) -> usize {
    let diff = (level_from - level_to).abs();
    ((diff / SKIP_BIN_WIDTH) as usize).min(SKIP_N_BINS - 1)
}

impl KhmmParameters {
    /// Probability that the event stream skips straight over the
    /// transition between two k-mers with the given levels.
    pub fn skip_probability(&self, level_from: f64, level_to: f64) -> f64 {
        self.skip_probabilities[skip_bin(level_from, level_to)]
    }

    /// Re-estimate `self_transition`, the skip table and `fit_quality`
    /// from the accumulated observations, then reset the accumulator.
    pub fn train(&mut self) {
        let data = &self.training_data;
        let total = data.n_matches + data.n_merges + data.n_skips;
        if total > 0 {
            self.self_transition = data.n_merges as f64 / total as f64;
        }

        let mut skips = vec![0usize; SKIP_N_BINS];
        let mut steps = vec![0usize; SKIP_N_BINS];
        for obs in data.transitions.iter() {
            let bin = skip_bin(obs.level_from, obs.level_to);
            steps[bin] += 1;
            if obs.kind == AlignOp::Skip {
                skips[bin] += 1;
            }
        }
        let table = self.skip_probabilities.iter_mut();
        for ((p, &n_skip), &n_step) in table.zip(skips.iter()).zip(steps.iter()) {
            if n_step >= MIN_BIN_OBSERVATIONS {
                *p = (n_skip as f64 + 1.0) / (n_step as f64 + 2.0);
            }
        }

        let residuals = &data.emissions_for_matches;
        if residuals.len() >= 2 {
            let n = residuals.len() as f64;
            let mean = residuals.iter().sum::<f64>() / n;
            let var = residuals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
            self.fit_quality = var.sqrt();
        }
        self.training_data.clear();
    }
}
