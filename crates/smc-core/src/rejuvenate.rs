//! MCMC kernels that restore particle diversity between evidence batches.

use crate::evidence::Evidence;
use crate::model::{Model, ModelError, Timestep, Var};
use crate::world::World;
use rand::{Rng, RngCore};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

/// Default number of timesteps a decayed kernel can reach back.
pub const DEFAULT_MAX_RECALL: usize = 30;
/// Largest accepted recall window, in timesteps.
pub const MAX_RECALL: usize = 10_000;

/// Default relative weight of atemporal variables when picking what to move.
pub const DEFAULT_ATEMPORAL_VAR_FACTOR: f64 = 1.0;

/// Result of one kernel transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub world: World,
    pub accepted: bool,
}

/// A Markov kernel applied to particle worlds.
///
/// The kernel keeps track of all evidence it has been shown so it never
/// moves an observed variable.
pub trait Rejuvenator: fmt::Debug + Send {
    /// Forgets previously added evidence and starts from `evidence` and the
    /// variables the caller intends to query.
    fn initialize(&mut self, evidence: &Evidence, query_vars: &[Var]);

    fn add(&mut self, evidence: &Evidence);

    fn add_queries(&mut self, query_vars: &[Var]);

    fn next_sample(&self, world: World, rng: &mut dyn RngCore) -> Result<Transition, ModelError>;

    /// Number of timesteps of history the kernel may touch.
    fn max_recall_window(&self) -> usize;
}

/// Single-site Metropolis–Hastings whose attention decays with age.
///
/// Atemporal variables are picked with probability `f / (f + max_time)`.
/// Otherwise a slice `k` steps back from the latest one is chosen with
/// probability proportional to `1 / (k + 1)^2`, limited to the last
/// `max_recall` slices, and a variable is picked uniformly within it. The
/// chosen variable is resampled from its prior conditional and the move is
/// accepted with the ratio of the remaining joint factors.
#[derive(Debug)]
pub struct DecayedMetropolisHastings {
    model: Arc<Model>,
    max_recall: usize,
    atemporal_var_factor: f64,
    decay: Vec<f64>,
    evidence_vars: BTreeSet<Var>,
    query_vars: BTreeSet<Var>,
}

impl DecayedMetropolisHastings {
    pub fn new(model: Arc<Model>, max_recall: usize, atemporal_var_factor: f64) -> Self {
        let max_recall = max_recall.clamp(1, MAX_RECALL);
        let decay = (0..max_recall)
            .map(|k| 1.0 / ((k + 1) as f64).powi(2))
            .collect();
        Self {
            model,
            max_recall,
            atemporal_var_factor,
            decay,
            evidence_vars: BTreeSet::new(),
            query_vars: BTreeSet::new(),
        }
    }

    pub fn with_defaults(model: Arc<Model>) -> Self {
        Self::new(model, DEFAULT_MAX_RECALL, DEFAULT_ATEMPORAL_VAR_FACTOR)
    }

    pub fn atemporal_var_factor(&self) -> f64 {
        self.atemporal_var_factor
    }

    pub fn is_evidence(&self, var: &Var) -> bool {
        self.evidence_vars.contains(var)
    }

    /// Chooses the variable to move, or `None` when nothing unobserved is
    /// instantiated within reach.
    pub fn pick_var(&self, world: &World, rng: &mut dyn RngCore) -> Option<Var> {
        let max_time = world.latest_timestep().map(|t| t.index());
        let slices = max_time.map_or(0, |t| self.max_recall.min(t as usize + 1));

        let mut atemporal = Vec::new();
        let mut temporal: Vec<Vec<&Var>> = vec![Vec::new(); slices];
        for (var, _) in world.basic_vars() {
            if self.evidence_vars.contains(var) {
                continue;
            }
            match (var.timestep(), max_time) {
                (None, _) => atemporal.push(var),
                (Some(t), Some(max)) => {
                    let back = (max - t.index()) as usize;
                    if back < slices {
                        temporal[back].push(var);
                    }
                }
                (Some(_), None) => {}
            }
        }
        let temporal_count: usize = temporal.iter().map(Vec::len).sum();
        if atemporal.is_empty() && temporal_count == 0 {
            return None;
        }

        let max_time_f = max_time.map_or(-1.0, f64::from);
        let atemporal_share = self.atemporal_var_factor / (self.atemporal_var_factor + max_time_f);
        let roll: f64 = rng.gen_range(0.0..1.0);
        if !atemporal.is_empty() && (temporal_count == 0 || roll < atemporal_share) {
            let index = rng.gen_range(0..atemporal.len());
            return Some(atemporal[index].clone());
        }

        let back = self.draw_slice(slices, rng);
        let slice = &temporal[back];
        if slice.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..slice.len());
        Some(slice[index].clone())
    }

    /// Query variables inside the recall window of `world`. Atemporal
    /// queries are always reachable.
    fn reachable_queries(&self, world: &World) -> Vec<Var> {
        let latest = world.latest_timestep();
        self.query_vars
            .iter()
            .filter(|var| match (var.timestep(), latest) {
                (None, _) => true,
                (Some(t), Some(latest)) => {
                    t <= latest && ((latest.index() - t.index()) as usize) < self.max_recall
                }
                (Some(_), None) => false,
            })
            .cloned()
            .collect()
    }

    /// Drops evidence and query variables that fall out of the recall
    /// window ending at `latest`; no world keeps them within reach.
    fn forget_before(&mut self, latest: Timestep) {
        let reach = u32::try_from(self.max_recall - 1).unwrap_or(u32::MAX);
        let first_kept = latest.index().saturating_sub(reach);
        let in_window = |var: &Var| var.timestep().is_none_or(|t| t.index() >= first_kept);
        self.evidence_vars.retain(in_window);
        self.query_vars.retain(in_window);
    }

    fn draw_slice(&self, slices: usize, rng: &mut dyn RngCore) -> usize {
        let weights = &self.decay[..slices];
        let total: f64 = weights.iter().sum();
        let u = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (k, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if u < cumulative {
                return k;
            }
        }
        slices - 1
    }
}

impl Rejuvenator for DecayedMetropolisHastings {
    fn initialize(&mut self, evidence: &Evidence, query_vars: &[Var]) {
        self.evidence_vars = evidence.observed_vars().cloned().collect();
        self.query_vars = query_vars.iter().cloned().collect();
    }

    fn add(&mut self, evidence: &Evidence) {
        self.evidence_vars.extend(evidence.observed_vars().cloned());
        if let Some(latest) = self.evidence_vars.iter().filter_map(Var::timestep).max() {
            self.forget_before(latest);
        }
    }

    fn add_queries(&mut self, query_vars: &[Var]) {
        self.query_vars.extend(query_vars.iter().cloned());
    }

    fn next_sample(&self, world: World, rng: &mut dyn RngCore) -> Result<Transition, ModelError> {
        let mut current = world;
        current.remove_all_derived();
        let reachable = self.reachable_queries(&current);
        self.model.ensure_supported(&mut current, reachable.iter(), rng)?;
        let Some(var) = self.pick_var(&current, rng) else {
            return Ok(Transition {
                world: current,
                accepted: false,
            });
        };
        // Variables whose parents were pruned stay frozen.
        if self.model.conditional_log_prob(&current, &var)?.is_none() {
            return Ok(Transition {
                world: current,
                accepted: false,
            });
        }

        let mut proposed = current.clone();
        let value = self.model.sample_conditional(&mut proposed, &var, rng)?;
        proposed.set_value(var.clone(), value);

        let old_log = self.model.log_joint_excluding(&current, &var)?;
        let new_log = self.model.log_joint_excluding(&proposed, &var)?;
        let log_ratio = new_log - old_log;
        let accepted = log_ratio >= 0.0 || rng.gen_range(0.0..1.0_f64).ln() < log_ratio;

        if tracing::enabled!(Level::TRACE) {
            event!(
                target: "smc_core::rejuvenate",
                Level::TRACE,
                var = %var,
                log_ratio,
                accepted,
                "metropolis-hastings move"
            );
        }

        Ok(Transition {
            world: if accepted { proposed } else { current },
            accepted,
        })
    }

    fn max_recall_window(&self) -> usize {
        self.max_recall
    }
}
