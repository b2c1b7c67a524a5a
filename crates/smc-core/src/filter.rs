//! Sequential Monte Carlo over a fixed-size particle population.

use crate::config::{ConfigError, EngineKind, FilterConfig};
use crate::evidence::{Evidence, EvidenceError};
use crate::liu_west::{LiuWest, NoiseSource, RngNoise};
use crate::model::{IdTypeSet, Model, ModelError, Timestep, Var};
use crate::particle::Particle;
use crate::query::Query;
use crate::rejuvenate::{DecayedMetropolisHastings, Rejuvenator};
use crate::sampler::{NEGLIGIBLE_LOG_WEIGHT, Sampler};
use crate::stats::{FilterMetrics, SamplerStats, log_sum};
use crate::world::World;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{Level, event, warn};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("all particles have zero weight after evidence step {step}")]
    AllParticlesExtinguished { step: u64 },
    #[error("cannot resample a population whose weights sum to zero")]
    ZeroWeightSum,
    #[error("filter population is extinguished; reset before taking more evidence")]
    Extinguished,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("failed to write query report")]
    Report(#[source] io::Error),
}

/// Where the filter is in its evidence cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Uninitialized,
    /// Fresh population of unit-weight particles.
    Ready,
    /// Conditioned on evidence; the next non-empty batch first rejuvenates
    /// and resamples.
    NeedsRejuvenateAndResample,
    /// The last batch left no particle with positive weight.
    Extinguished,
}

/// Picks an index from a normalized probability vector.
pub trait CategoricalDraw {
    fn draw(&mut self, probs: &[f64]) -> usize;
}

/// Inverse-CDF draw from an RNG.
pub struct RngDraw<'a, R: ?Sized>(pub &'a mut R);

impl<R: RngCore + ?Sized> CategoricalDraw for RngDraw<'_, R> {
    fn draw(&mut self, probs: &[f64]) -> usize {
        let u: f64 = self.0.gen_range(0.0..1.0);
        let mut cumulative = 0.0;
        for (index, prob) in probs.iter().enumerate().take(probs.len().saturating_sub(1)) {
            cumulative += prob;
            if u < cumulative {
                return index;
            }
        }
        probs.len().saturating_sub(1)
    }
}

/// Replays a fixed sequence of indices, wrapping around at the end.
#[derive(Debug, Clone)]
pub struct ScriptedDraw {
    indices: Vec<usize>,
    next: usize,
}

impl ScriptedDraw {
    pub fn new(indices: Vec<usize>) -> Self {
        Self { indices, next: 0 }
    }
}

impl CategoricalDraw for ScriptedDraw {
    fn draw(&mut self, _probs: &[f64]) -> usize {
        if self.indices.is_empty() {
            return 0;
        }
        let index = self.indices[self.next % self.indices.len()];
        self.next += 1;
        index
    }
}

/// Replaces `particles` with `target` draws proportional to weight.
///
/// The first draw of a source index moves the original particle into its
/// slot; further draws of the same index receive copies. Returns the number
/// of copies made. On error the population is left untouched.
pub fn resample_population(
    particles: &mut Vec<Particle>,
    target: usize,
    draw: &mut dyn CategoricalDraw,
) -> Result<u64, FilterError> {
    let log_total = particles
        .iter()
        .fold(f64::NEG_INFINITY, |acc, particle| log_sum(acc, particle.log_weight()));
    if particles.is_empty() || !(log_total > f64::NEG_INFINITY) {
        return Err(FilterError::ZeroWeightSum);
    }
    let probs: Vec<f64> = particles
        .iter()
        .map(|particle| (particle.log_weight() - log_total).exp())
        .collect();

    let last = particles.len() - 1;
    let mut taken = vec![false; particles.len()];
    let mut slots: Vec<Option<Particle>> = Vec::with_capacity(target);
    let mut originals = Vec::new();
    let mut copies = 0;
    for slot in 0..target {
        let source = draw.draw(&probs).min(last);
        if taken[source] {
            slots.push(Some(particles[source].copy()));
            copies += 1;
        } else {
            taken[source] = true;
            slots.push(None);
            originals.push((slot, source));
        }
    }

    let mut sources: Vec<Option<Particle>> = std::mem::take(particles).into_iter().map(Some).collect();
    for (slot, source) in originals {
        slots[slot] = sources[source].take();
    }
    *particles = slots.into_iter().flatten().collect();
    Ok(copies)
}

pub type EvidenceHook = Box<dyn FnMut(&Evidence, &[Particle]) + Send>;
pub type ParticleHook = Box<dyn FnMut(&Particle, &Evidence) + Send>;

/// Optional callbacks around evidence conditioning.
#[derive(Default)]
pub struct FilterHooks {
    pub before_takes_evidence: Option<EvidenceHook>,
    pub after_takes_evidence: Option<EvidenceHook>,
    pub before_particle_takes_evidence: Option<ParticleHook>,
    pub after_particle_takes_evidence: Option<ParticleHook>,
}

impl fmt::Debug for FilterHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterHooks")
            .field("before_takes_evidence", &self.before_takes_evidence.is_some())
            .field("after_takes_evidence", &self.after_takes_evidence.is_some())
            .field(
                "before_particle_takes_evidence",
                &self.before_particle_takes_evidence.is_some(),
            )
            .field(
                "after_particle_takes_evidence",
                &self.after_particle_takes_evidence.is_some(),
            )
            .finish()
    }
}

/// Particle filter with optional decayed-MCMC rejuvenation and Liu–West
/// parameter perturbation.
#[derive(Debug)]
pub struct ParticleFilter {
    model: Arc<Model>,
    config: FilterConfig,
    target: usize,
    id_types: Arc<IdTypeSet>,
    sampler: Arc<dyn Sampler>,
    rejuvenator: Option<Box<dyn Rejuvenator>>,
    liu_west: Option<LiuWest>,
    particles: Vec<Particle>,
    state: FilterState,
    rng: SmallRng,
    hooks: FilterHooks,
    stats: SamplerStats,
    metrics: FilterMetrics,
    data_log_likelihood: f64,
}

impl ParticleFilter {
    pub fn new(model: Arc<Model>, config: FilterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let target = config.particle_count()?;
        let id_types = Arc::new(config.id_type_set(&model)?);
        let sampler = config.sampler_class.build(Arc::clone(&model));
        let rejuvenator: Option<Box<dyn Rejuvenator>> = config.use_decayed_mcmc.then(|| {
            Box::new(DecayedMetropolisHastings::new(
                Arc::clone(&model),
                config.max_recall,
                config.atemporal_var_factor,
            )) as Box<dyn Rejuvenator>
        });
        let liu_west = match config.engine {
            EngineKind::ParticleFilter => None,
            EngineKind::LiuWest => Some(LiuWest::new(&model, config.rho)?),
        };
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        event!(
            target: "smc_core::filter",
            Level::INFO,
            particles = target,
            sampler = %sampler.kind(),
            engine = %config.engine,
            decayed_mcmc = config.use_decayed_mcmc,
            "constructed particle filter"
        );
        Ok(Self {
            model,
            config,
            target,
            id_types,
            sampler,
            rejuvenator,
            liu_west,
            particles: Vec::new(),
            state: FilterState::Uninitialized,
            rng,
            hooks: FilterHooks::default(),
            stats: SamplerStats::default(),
            metrics: FilterMetrics::default(),
            data_log_likelihood: 0.0,
        })
    }

    /// Replaces the sampler shared by all particles.
    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Replaces the rejuvenation kernel, enabling rejuvenation.
    pub fn with_rejuvenator(mut self, rejuvenator: Box<dyn Rejuvenator>) -> Self {
        self.rejuvenator = Some(rejuvenator);
        self
    }

    pub fn with_hooks(mut self, hooks: FilterHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn hooks_mut(&mut self) -> &mut FilterHooks {
        &mut self.hooks
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn metrics(&self) -> &FilterMetrics {
        &self.metrics
    }

    pub fn sampler_stats(&self) -> &SamplerStats {
        &self.stats
    }

    /// Log of the product over evidence steps of the mean importance weight.
    pub fn data_log_likelihood(&self) -> f64 {
        self.data_log_likelihood
    }

    /// Number of timesteps each particle keeps in memory.
    pub fn retention_window(&self) -> usize {
        self.rejuvenator
            .as_ref()
            .map_or(1, |rejuvenator| rejuvenator.max_recall_window())
    }

    pub fn print_stats(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "{}", self.stats)
    }

    /// Discards the population and creates `target` fresh particles.
    pub fn reset(&mut self) {
        let window = self.retention_window();
        if let Some(rejuvenator) = self.rejuvenator.as_mut() {
            rejuvenator.initialize(&Evidence::new(), &[]);
        }
        self.particles = (0..self.target)
            .map(|_| Particle::new(Arc::clone(&self.id_types), window))
            .collect();
        self.state = FilterState::Ready;
        self.data_log_likelihood = 0.0;
        event!(
            target: "smc_core::filter",
            Level::DEBUG,
            particles = self.target,
            window,
            "reset particle population"
        );
    }

    /// Conditions every particle on `evidence`.
    ///
    /// Empty evidence is a no-op. Zero-weight particles are dropped; if none
    /// survive, the population is cleared, the filter becomes
    /// [`FilterState::Extinguished`] and the step fails. A model error
    /// while sampling leaves every particle's world and weight as they were.
    pub fn take(&mut self, evidence: &Evidence) -> Result<(), FilterError> {
        match self.state {
            FilterState::Uninitialized => self.reset(),
            FilterState::Extinguished => return Err(FilterError::Extinguished),
            FilterState::Ready | FilterState::NeedsRejuvenateAndResample => {}
        }
        if evidence.is_empty() {
            return Ok(());
        }
        let mut evidence = evidence.clone();
        if !evidence.is_compiled() {
            evidence.compile(&self.model)?;
        }

        if self.state == FilterState::NeedsRejuvenateAndResample {
            self.rejuvenate()?;
            self.resample()?;
            self.state = FilterState::Ready;
        }

        if let Some(hook) = self.hooks.before_takes_evidence.as_mut() {
            hook(&evidence, &self.particles);
        }
        let stats_before = self.stats;
        self.stats.begin_trial();
        let mut staged = Vec::with_capacity(self.particles.len());
        for particle in &self.particles {
            if let Some(hook) = self.hooks.before_particle_takes_evidence.as_mut() {
                hook(particle, &evidence);
            }
            match particle.draw(&evidence, self.sampler.as_ref(), &mut self.rng, &mut self.stats) {
                Ok(drawn) => staged.push(drawn),
                Err(err) => {
                    self.stats = stats_before;
                    warn!(
                        target: "smc_core::filter",
                        particle = ?particle.id(),
                        error = %err,
                        "sampler failed; population left unconditioned"
                    );
                    return Err(err.into());
                }
            }
        }
        for (particle, drawn) in self.particles.iter_mut().zip(staged) {
            particle.commit(drawn);
            if let Some(hook) = self.hooks.after_particle_takes_evidence.as_mut() {
                hook(particle, &evidence);
            }
        }

        self.metrics.evidence_steps += 1;
        let conditioned = self.particles.len();
        self.particles
            .retain(|particle| particle.log_weight() >= NEGLIGIBLE_LOG_WEIGHT);
        let dropped = conditioned - self.particles.len();
        self.metrics.particles_dropped += dropped as u64;

        if self.particles.is_empty() {
            self.state = FilterState::Extinguished;
            let step = self.metrics.evidence_steps;
            warn!(
                target: "smc_core::filter",
                step,
                observations = evidence.len(),
                "all particles extinguished"
            );
            return Err(FilterError::AllParticlesExtinguished { step });
        }

        let log_total = self
            .particles
            .iter()
            .fold(f64::NEG_INFINITY, |acc, particle| log_sum(acc, particle.log_weight()));
        let step_log_likelihood = log_total - (conditioned as f64).ln();
        self.data_log_likelihood += step_log_likelihood;
        self.state = FilterState::NeedsRejuvenateAndResample;
        if let Some(rejuvenator) = self.rejuvenator.as_mut() {
            rejuvenator.add(&evidence);
        }

        if tracing::enabled!(Level::DEBUG) {
            event!(
                target: "smc_core::filter",
                Level::DEBUG,
                step = self.metrics.evidence_steps,
                observations = evidence.len(),
                survivors = self.particles.len(),
                dropped,
                step_log_likelihood,
                "conditioned population on evidence"
            );
        }

        if let Some(hook) = self.hooks.after_takes_evidence.as_mut() {
            hook(&evidence, &self.particles);
        }
        Ok(())
    }

    /// Adds every particle's world to the statistics of `queries`.
    pub fn answer<Q: Query>(&mut self, queries: &mut [Q]) -> Result<(), FilterError> {
        if self.state == FilterState::Uninitialized {
            self.reset();
        }
        if let Some(rejuvenator) = self.rejuvenator.as_mut() {
            let vars: Vec<Var> = queries.iter().flat_map(|query| query.variables()).collect();
            rejuvenator.add_queries(&vars);
        }
        for particle in self.particles.iter_mut() {
            particle.answer(queries.iter_mut(), &self.model, &mut self.rng)?;
        }
        Ok(())
    }

    /// Resamples the population back to its target size, then applies the
    /// Liu–West step when enabled.
    pub fn resample(&mut self) -> Result<(), FilterError> {
        let copies = resample_population(&mut self.particles, self.target, &mut RngDraw(&mut self.rng))?;
        self.record_resample(copies);
        if let Some(liu_west) = self.liu_west.as_ref() {
            let mut noise = RngNoise::new(&mut self.rng)?;
            self.metrics.perturbed_values += liu_west.perturb(&mut self.particles, &mut noise);
        }
        Ok(())
    }

    /// [`ParticleFilter::resample`] with injected randomness.
    pub fn resample_with(
        &mut self,
        draw: &mut dyn CategoricalDraw,
        noise: &mut dyn NoiseSource,
    ) -> Result<(), FilterError> {
        let copies = resample_population(&mut self.particles, self.target, draw)?;
        self.record_resample(copies);
        if let Some(liu_west) = self.liu_west.as_ref() {
            self.metrics.perturbed_values += liu_west.perturb(&mut self.particles, noise);
        }
        Ok(())
    }

    fn record_resample(&mut self, copies: u64) {
        self.metrics.resamples += 1;
        self.metrics.copies += copies;
        event!(
            target: "smc_core::filter",
            Level::TRACE,
            copies,
            particles = self.particles.len(),
            "resampled population"
        );
    }

    /// Applies `numMoves` rounds of the rejuvenation kernel to every
    /// particle. Does nothing when rejuvenation is off. The moved worlds
    /// are installed only once every round has succeeded.
    pub fn rejuvenate(&mut self) -> Result<(), FilterError> {
        let Some(rejuvenator) = self.rejuvenator.as_ref() else {
            return Ok(());
        };
        let mut staged: Vec<World> = self.particles.iter().map(|particle| particle.world().clone()).collect();
        let mut moves = 0u64;
        let mut accepted = 0u64;
        for _ in 0..self.config.num_moves {
            let mut moved = Vec::with_capacity(staged.len());
            for world in staged {
                let transition = rejuvenator.next_sample(world, &mut self.rng)?;
                moved.push(transition.world);
                moves += 1;
                accepted += u64::from(transition.accepted);
            }
            staged = moved;
        }
        for (particle, world) in self.particles.iter_mut().zip(staged) {
            particle.set_world(world);
        }
        self.metrics.rejuvenation_moves += moves;
        self.metrics.accepted_moves += accepted;
        Ok(())
    }

    /// Drops history older than each particle's retention window, counted
    /// back from `timestep`.
    pub fn remove_prior_time_slice(&mut self, timestep: Timestep) {
        for particle in self.particles.iter_mut() {
            particle.remove_prior_time_slice(timestep);
        }
    }

    /// Runs the filter over a whole evidence stream.
    ///
    /// The population is reset, atemporal evidence is taken first, then
    /// timesteps are processed in order: the slice's evidence is taken, the
    /// queries about that timestep are answered, and old history is pruned.
    /// Every `queryReportInterval` timesteps with answered queries, all query
    /// results are written to `report`. Atemporal queries are answered last.
    pub fn run<Q: Query>(
        &mut self,
        evidence: &Evidence,
        queries: &mut [Q],
        report: &mut dyn Write,
    ) -> Result<(), FilterError> {
        let mut evidence = evidence.clone();
        evidence.compile(&self.model)?;

        self.reset();
        if let Some(rejuvenator) = self.rejuvenator.as_mut() {
            let vars: Vec<Var> = queries.iter().flat_map(|query| query.variables()).collect();
            rejuvenator.initialize(&evidence, &vars);
        }

        let evidence_slices = evidence.split_by_timestep();
        let mut query_slices: BTreeMap<Option<Timestep>, BTreeSet<usize>> = BTreeMap::new();
        for (index, query) in queries.iter().enumerate() {
            query_slices.entry(query.timestep()).or_default().insert(index);
        }

        if let Some(atemporal) = evidence_slices.get(&None) {
            self.take(atemporal)?;
        }

        let timesteps: BTreeSet<Timestep> = evidence_slices
            .keys()
            .chain(query_slices.keys())
            .flatten()
            .copied()
            .collect();
        for timestep in timesteps {
            if let Some(slice) = evidence_slices.get(&Some(timestep)) {
                self.take(slice)?;
            }
            if let Some(selected) = query_slices.get(&Some(timestep)) {
                self.answer_selected(queries, selected)?;
                if timestep.index() % self.config.query_report_interval == 0 {
                    write_report(report, &format!("After timestep {}", timestep.index()), queries)
                        .map_err(FilterError::Report)?;
                }
            }
            self.remove_prior_time_slice(timestep);
        }

        if let Some(selected) = query_slices.get(&None) {
            self.answer_selected(queries, selected)?;
        }

        event!(
            target: "smc_core::filter",
            Level::INFO,
            steps = self.metrics.evidence_steps,
            data_log_likelihood = self.data_log_likelihood,
            "finished evidence stream"
        );
        Ok(())
    }

    fn answer_selected<Q: Query>(
        &mut self,
        queries: &mut [Q],
        selected: &BTreeSet<usize>,
    ) -> Result<(), FilterError> {
        for particle in self.particles.iter_mut() {
            let chosen = queries
                .iter_mut()
                .enumerate()
                .filter(|(index, _)| selected.contains(index))
                .map(|(_, query)| query);
            particle.answer(chosen, &self.model, &mut self.rng)?;
        }
        Ok(())
    }
}

/// Writes a header line followed by every query's results.
pub fn write_report<Q: Query>(out: &mut dyn Write, header: &str, queries: &[Q]) -> io::Result<()> {
    writeln!(out, "======== {header} ========")?;
    for query in queries {
        query.print_results(out)?;
    }
    Ok(())
}
