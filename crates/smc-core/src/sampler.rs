//! Importance samplers that extend a base world to support a batch of evidence.

use crate::evidence::Evidence;
use crate::model::{Model, ModelError};
use crate::stats::SamplerStats;
use crate::world::World;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, event};

/// Log weights below this floor are treated as zero weight.
pub const NEGLIGIBLE_LOG_WEIGHT: f64 = -1e100;

/// A sampled world and its importance log weight.
#[derive(Debug, Clone)]
pub struct WeightedWorld {
    pub world: World,
    pub log_weight: f64,
}

impl WeightedWorld {
    pub fn weight(&self) -> f64 {
        self.log_weight.exp()
    }

    pub fn is_negligible(&self) -> bool {
        self.log_weight < NEGLIGIBLE_LOG_WEIGHT
    }
}

/// Draws one world consistent with `evidence`, starting from `base`.
///
/// Samplers hold no per-draw state; everything a draw produces is returned,
/// so one instance can serve any number of particles.
pub trait Sampler: fmt::Debug + Send + Sync {
    fn kind(&self) -> SamplerKind;

    fn sample(
        &self,
        base: World,
        evidence: &Evidence,
        rng: &mut dyn RngCore,
        stats: &mut SamplerStats,
    ) -> Result<WeightedWorld, ModelError>;
}

/// Likelihood weighting: observed variables are clamped first, then each
/// contributes its conditional probability given its (sampled or observed)
/// parents to the weight.
#[derive(Debug)]
pub struct LikelihoodWeighting {
    model: Arc<Model>,
}

impl LikelihoodWeighting {
    pub fn new(model: Arc<Model>) -> Self {
        Self { model }
    }
}

impl Sampler for LikelihoodWeighting {
    fn kind(&self) -> SamplerKind {
        SamplerKind::LikelihoodWeighting
    }

    fn sample(
        &self,
        base: World,
        evidence: &Evidence,
        rng: &mut dyn RngCore,
        stats: &mut SamplerStats,
    ) -> Result<WeightedWorld, ModelError> {
        let mut world = base;
        // Every observation is clamped before any is scored.
        for obs in evidence.observations() {
            world.set_value(obs.var.clone(), obs.value.clone());
        }
        let mut log_weight = 0.0;
        for obs in evidence.observations() {
            log_weight += self.model.observe(&mut world, &obs.var, &obs.value, rng)?;
        }
        stats.record(log_weight, log_weight > NEGLIGIBLE_LOG_WEIGHT);
        Ok(WeightedWorld { world, log_weight })
    }
}

/// Rejection sampling: observed variables are sampled like any other, and
/// the draw gets weight zero unless every sample matches its observation.
#[derive(Debug)]
pub struct Rejection {
    model: Arc<Model>,
}

impl Rejection {
    pub fn new(model: Arc<Model>) -> Self {
        Self { model }
    }
}

impl Sampler for Rejection {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Rejection
    }

    fn sample(
        &self,
        base: World,
        evidence: &Evidence,
        rng: &mut dyn RngCore,
        stats: &mut SamplerStats,
    ) -> Result<WeightedWorld, ModelError> {
        let mut world = base;
        let mut log_weight = 0.0;
        for obs in evidence.observations() {
            let drawn = match world.basic_value(&obs.var) {
                Some(existing) => existing.clone(),
                None => self.model.sample_conditional(&mut world, &obs.var, rng)?,
            };
            if drawn != obs.value {
                log_weight = f64::NEG_INFINITY;
                if tracing::enabled!(Level::TRACE) {
                    event!(
                        target: "smc_core::sampler",
                        Level::TRACE,
                        var = %obs.var,
                        drawn = %drawn,
                        observed = %obs.value,
                        "rejected draw"
                    );
                }
                break;
            }
            world.set_value(obs.var.clone(), drawn);
        }
        stats.record(log_weight, log_weight > NEGLIGIBLE_LOG_WEIGHT);
        Ok(WeightedWorld { world, log_weight })
    }
}

/// Registry key selecting a [`Sampler`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    #[serde(alias = "lw")]
    LikelihoodWeighting,
    Rejection,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 2] = [SamplerKind::LikelihoodWeighting, SamplerKind::Rejection];

    pub fn key(self) -> &'static str {
        match self {
            SamplerKind::LikelihoodWeighting => "likelihood_weighting",
            SamplerKind::Rejection => "rejection",
        }
    }

    pub fn build(self, model: Arc<Model>) -> Arc<dyn Sampler> {
        match self {
            SamplerKind::LikelihoodWeighting => Arc::new(LikelihoodWeighting::new(model)),
            SamplerKind::Rejection => Arc::new(Rejection::new(model)),
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for SamplerKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lw" | "likelihood_weighting" => Ok(SamplerKind::LikelihoodWeighting),
            "rejection" => Ok(SamplerKind::Rejection),
            other => Err(format!("unknown sampler '{other}'")),
        }
    }
}
