//! A single weighted hypothesis of the particle filter.

use crate::evidence::Evidence;
use crate::model::{IdTypeSet, Model, ModelError, Timestep};
use crate::query::Query;
use crate::sampler::{NEGLIGIBLE_LOG_WEIGHT, Sampler, WeightedWorld};
use crate::stats::SamplerStats;
use crate::world::World;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARTICLE_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a particle object; copies receive a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParticleId(u64);

impl ParticleId {
    fn next() -> Self {
        ParticleId(NEXT_PARTICLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A world paired with its importance weight under the last evidence it
/// was conditioned on. Fresh particles have weight one.
#[derive(Debug)]
pub struct Particle {
    id: ParticleId,
    world: World,
    log_weight: f64,
    id_types: Arc<IdTypeSet>,
    history_window: usize,
}

impl Particle {
    pub fn new(id_types: Arc<IdTypeSet>, history_window: usize) -> Self {
        Self {
            id: ParticleId::next(),
            world: World::new(Arc::clone(&id_types)),
            log_weight: 0.0,
            id_types,
            history_window: history_window.max(1),
        }
    }

    pub fn id(&self) -> ParticleId {
        self.id
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn set_world(&mut self, world: World) {
        self.world = world;
    }

    pub fn weight(&self) -> f64 {
        self.log_weight.exp()
    }

    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    #[cfg(test)]
    pub(crate) fn set_log_weight(&mut self, log_weight: f64) {
        self.log_weight = log_weight;
    }

    pub fn id_types(&self) -> &IdTypeSet {
        &self.id_types
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Conditions this particle's world on `evidence` with one draw from
    /// `sampler`, replacing both the world and the weight. On error the
    /// particle is left as it was.
    pub fn take(
        &mut self,
        evidence: &Evidence,
        sampler: &dyn Sampler,
        rng: &mut dyn RngCore,
        stats: &mut SamplerStats,
    ) -> Result<(), ModelError> {
        let drawn = self.draw(evidence, sampler, rng, stats)?;
        self.commit(drawn);
        Ok(())
    }

    /// One draw from `sampler` extending a copy of this particle's world.
    pub fn draw(
        &self,
        evidence: &Evidence,
        sampler: &dyn Sampler,
        rng: &mut dyn RngCore,
        stats: &mut SamplerStats,
    ) -> Result<WeightedWorld, ModelError> {
        sampler.sample(self.world.clone(), evidence, rng, stats)
    }

    /// Replaces the world and weight with a completed draw.
    pub fn commit(&mut self, drawn: WeightedWorld) {
        self.world = drawn.world;
        self.log_weight = drawn.log_weight;
    }

    /// Adds this particle's world to every query's statistics, first
    /// instantiating whatever each query reads. Zero-weight particles are
    /// skipped.
    pub fn answer<'q, Q: Query + 'q>(
        &mut self,
        queries: impl IntoIterator<Item = &'q mut Q>,
        model: &Model,
        rng: &mut dyn RngCore,
    ) -> Result<(), ModelError> {
        if self.log_weight < NEGLIGIBLE_LOG_WEIGHT {
            return Ok(());
        }
        let weight = self.weight();
        for query in queries {
            model.ensure_supported(&mut self.world, query.variables().iter(), rng)?;
            query.update_stats(&self.world, weight);
        }
        Ok(())
    }

    /// Independent particle with the same weight. The world is cloned
    /// structurally; neither side sees the other's later writes.
    pub fn copy(&self) -> Particle {
        Particle {
            id: ParticleId::next(),
            world: self.world.clone(),
            log_weight: self.log_weight,
            id_types: Arc::clone(&self.id_types),
            history_window: self.history_window,
        }
    }

    /// Drops temporal variables outside the retention window, measured back
    /// from the latest timestep in the world.
    pub fn uninstantiate_previous_timeslices(&mut self) {
        if let Some(latest) = self.world.latest_timestep() {
            self.remove_prior_time_slice(latest);
        }
    }

    /// Drops temporal variables outside the retention window ending at
    /// `timestep`.
    pub fn remove_prior_time_slice(&mut self, timestep: Timestep) {
        let keep = u32::try_from(self.history_window.saturating_sub(1)).unwrap_or(u32::MAX);
        let first_kept = Timestep(timestep.index().saturating_sub(keep));
        self.world.retain_from(first_kept);
    }

    pub fn remove_all_derived_vars(&mut self) {
        self.world.remove_all_derived();
    }
}

impl fmt::Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(particle {} with {} vars, weight {})",
            self.id.0,
            self.world.len(),
            self.weight()
        )
    }
}
