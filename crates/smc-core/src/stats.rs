//! Counters threaded explicitly through sampling and filtering calls.

use serde::Serialize;
use std::fmt;

/// Log-sum-exp of two log-space values.
pub fn log_sum(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Likelihood-weighting statistics, per trial and across all trials.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SamplerStats {
    pub total_samples: u64,
    pub total_consistent: u64,
    pub trial_samples: u64,
    pub trial_consistent: u64,
    pub trial_log_sum_weights: f64,
}

impl Default for SamplerStats {
    fn default() -> Self {
        Self {
            total_samples: 0,
            total_consistent: 0,
            trial_samples: 0,
            trial_consistent: 0,
            trial_log_sum_weights: f64::NEG_INFINITY,
        }
    }
}

impl SamplerStats {
    /// Starts a new trial; running totals are kept.
    pub fn begin_trial(&mut self) {
        self.trial_samples = 0;
        self.trial_consistent = 0;
        self.trial_log_sum_weights = f64::NEG_INFINITY;
    }

    pub fn record(&mut self, log_weight: f64, consistent: bool) {
        self.total_samples += 1;
        self.trial_samples += 1;
        if consistent {
            self.total_consistent += 1;
            self.trial_consistent += 1;
        }
        self.trial_log_sum_weights = log_sum(self.trial_log_sum_weights, log_weight);
    }

    pub fn trial_log_average_weight(&self) -> Option<f64> {
        (self.trial_samples > 0)
            .then(|| self.trial_log_sum_weights - (self.trial_samples as f64).ln())
    }

    pub fn trial_consistent_fraction(&self) -> Option<f64> {
        (self.trial_samples > 0).then(|| self.trial_consistent as f64 / self.trial_samples as f64)
    }

    pub fn total_consistent_fraction(&self) -> Option<f64> {
        (self.total_samples > 0).then(|| self.total_consistent as f64 / self.total_samples as f64)
    }
}

impl fmt::Display for SamplerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "======== Sampler trial stats ========")?;
        if let Some(log_avg) = self.trial_log_average_weight() {
            writeln!(f, "Log of average likelihood weight (this trial): {log_avg}")?;
            writeln!(f, "Average likelihood weight (this trial): {}", log_avg.exp())?;
        }
        if let Some(fraction) = self.trial_consistent_fraction() {
            writeln!(f, "Fraction of consistent worlds (this trial): {fraction}")?;
        }
        match self.total_consistent_fraction() {
            Some(fraction) => write!(
                f,
                "Fraction of consistent worlds (running avg, all trials): {fraction}"
            ),
            None => write!(f, "No samples yet."),
        }
    }
}

/// Work done by one particle filter.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FilterMetrics {
    pub evidence_steps: u64,
    pub resamples: u64,
    pub copies: u64,
    pub rejuvenation_moves: u64,
    pub accepted_moves: u64,
    pub particles_dropped: u64,
    pub perturbed_values: u64,
}
