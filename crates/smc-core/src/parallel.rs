//! Independent particle filters run side by side on a thread pool.

use crate::config::{ConfigError, FilterConfig};
use crate::evidence::Evidence;
use crate::filter::{FilterError, ParticleFilter};
use crate::model::Model;
use crate::query::{Query, SharedQuery};
use crate::stats::FilterMetrics;
use rayon::prelude::*;
use std::io;
use std::sync::Arc;
use tracing::{Level, event};

/// A set of filters with their own samplers, random streams and populations
/// that answer the same queries.
#[derive(Debug)]
pub struct ParallelFilters {
    filters: Vec<ParticleFilter>,
}

impl ParallelFilters {
    /// Builds `count` filters from `config`. With a configured seed, filter
    /// `i` is seeded with `seed + i`.
    pub fn new(model: Arc<Model>, config: &FilterConfig, count: usize) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::InvalidField {
                field: "filters",
                message: "at least one filter is required".to_string(),
            });
        }
        let filters = (0..count)
            .map(|index| {
                let mut own = config.clone();
                own.seed = config.seed.map(|seed| seed.wrapping_add(index as u64));
                ParticleFilter::new(Arc::clone(&model), own)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    pub fn filters(&self) -> &[ParticleFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs every filter over `evidence`, each on its own worker, and
    /// returns once all of them have finished. Shared queries are updated
    /// under their own locks; per-filter reports are discarded. Returns each
    /// filter's data log likelihood, or the first failure.
    pub fn run<Q: Query>(
        &mut self,
        evidence: &Evidence,
        queries: &[SharedQuery<Q>],
    ) -> Result<Vec<f64>, FilterError> {
        let outcomes: Vec<Result<f64, FilterError>> = self
            .filters
            .par_iter_mut()
            .map(|filter| {
                let mut handles = queries.to_vec();
                filter.run(evidence, &mut handles, &mut io::sink())?;
                Ok(filter.data_log_likelihood())
            })
            .collect();
        let log_likelihoods = outcomes.into_iter().collect::<Result<Vec<_>, _>>()?;
        event!(
            target: "smc_core::parallel",
            Level::INFO,
            filters = self.filters.len(),
            log_likelihoods = ?log_likelihoods,
            "parallel filters joined"
        );
        Ok(log_likelihoods)
    }

    /// Sum of the work counters of all filters.
    pub fn total_metrics(&self) -> FilterMetrics {
        self.filters
            .iter()
            .map(ParticleFilter::metrics)
            .fold(FilterMetrics::default(), |mut total, metrics| {
                total.evidence_steps += metrics.evidence_steps;
                total.resamples += metrics.resamples;
                total.copies += metrics.copies;
                total.rejuvenation_moves += metrics.rejuvenation_moves;
                total.accepted_moves += metrics.accepted_moves;
                total.particles_dropped += metrics.particles_dropped;
                total.perturbed_values += metrics.perturbed_values;
                total
            })
    }
}
