//! Liu–West artificial evolution of static parameters.
//!
//! After resampling, every nullary atemporal real-valued random function is
//! shrunk toward its population mean and jittered so that the population
//! variance is preserved in expectation (Liu & West 2001, eq. 3.6):
//!
//! `v' = rho * v + (1 - rho) * mean + sqrt(1 - rho^2) * sd * N(0, 1)`

use crate::config::ConfigError;
use crate::model::{Model, ModelError, Value, Var};
use crate::particle::Particle;
use rand::Rng;
use rand::distributions::Distribution;
use statrs::distribution::Normal;
use std::sync::Arc;
use tracing::{Level, event, warn};

pub const DEFAULT_RHO: f64 = 0.97;

/// Source of independent standard normal draws.
pub trait NoiseSource {
    fn standard_normal(&mut self) -> f64;
}

/// Standard normal noise drawn from an RNG.
pub struct RngNoise<'a, R: ?Sized> {
    rng: &'a mut R,
    normal: Normal,
}

impl<'a, R: Rng + ?Sized> RngNoise<'a, R> {
    pub fn new(rng: &'a mut R) -> Result<Self, ModelError> {
        let normal =
            Normal::new(0.0, 1.0).map_err(|err| ModelError::InvalidDistribution(err.to_string()))?;
        Ok(Self { rng, normal })
    }
}

impl<R: Rng + ?Sized> NoiseSource for RngNoise<'_, R> {
    fn standard_normal(&mut self) -> f64 {
        self.normal.sample(&mut *self.rng)
    }
}

/// Noise that is always zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroNoise;

impl NoiseSource for ZeroNoise {
    fn standard_normal(&mut self) -> f64 {
        0.0
    }
}

/// Perturbation step for a fixed set of static parameters.
#[derive(Debug, Clone)]
pub struct LiuWest {
    rho: f64,
    parameters: Vec<Arc<str>>,
}

impl LiuWest {
    pub fn new(model: &Model, rho: f64) -> Result<Self, ConfigError> {
        if !(rho > 0.0 && rho <= 1.0) {
            return Err(ConfigError::InvalidField {
                field: "rho",
                message: format!("must lie in (0, 1], got {rho}"),
            });
        }
        let parameters = select_parameters(model);
        event!(
            target: "smc_core::liu_west",
            Level::INFO,
            rho,
            parameters = ?parameters,
            "liu-west perturbation enabled"
        );
        Ok(Self { rho, parameters })
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }

    pub fn parameters(&self) -> &[Arc<str>] {
        &self.parameters
    }

    /// Perturbs every selected parameter across `particles` and returns how
    /// many values were rewritten. Particles that have not instantiated a
    /// parameter are left alone for that parameter.
    pub fn perturb(&self, particles: &mut [Particle], noise: &mut dyn NoiseSource) -> u64 {
        let mut rewritten = 0;
        for name in &self.parameters {
            let var = Var::from_parts(Arc::clone(name), Vec::new(), None);
            let present: Vec<(usize, f64)> = particles
                .iter()
                .enumerate()
                .filter_map(|(index, particle)| {
                    particle
                        .world()
                        .value(&var)
                        .and_then(Value::as_real)
                        .map(|value| (index, value))
                })
                .collect();

            if present.is_empty() {
                event!(
                    target: "smc_core::liu_west",
                    Level::DEBUG,
                    parameter = %name,
                    "skipping parameter not present in this round"
                );
                continue;
            }
            if present.len() < particles.len() {
                warn!(
                    target: "smc_core::liu_west",
                    parameter = %name,
                    present = present.len(),
                    population = particles.len(),
                    "parameter instantiated in only part of the population"
                );
            }

            let (mean, sd) = population_moments(present.iter().map(|(_, value)| *value));
            if tracing::enabled!(Level::DEBUG) {
                event!(
                    target: "smc_core::liu_west",
                    Level::DEBUG,
                    parameter = %name,
                    mean,
                    sd,
                    "perturbing parameter"
                );
            }

            let jitter = (1.0 - self.rho * self.rho).sqrt() * sd;
            for (index, value) in present {
                let shifted = self.rho * value
                    + (1.0 - self.rho) * mean
                    + jitter * noise.standard_normal();
                particles[index]
                    .world_mut()
                    .set_value(var.clone(), Value::Real(shifted));
                rewritten += 1;
            }
        }
        rewritten
    }
}

/// Random, atemporal, real-valued functions without arguments.
pub fn select_parameters(model: &Model) -> Vec<Arc<str>> {
    model
        .functions()
        .iter()
        .filter(|function| {
            function.is_random()
                && !function.is_time_indexed()
                && function.return_type().is_real()
                && function.arity() == 0
        })
        .map(|function| Arc::clone(function.name_arc()))
        .collect()
}

/// Mean and population standard deviation (divided by `n`).
fn population_moments(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let (count, sum) = values.clone().fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
    let mean = sum / count as f64;
    let squares: f64 = values.map(|v| (v - mean) * (v - mean)).sum();
    (mean, (squares / count as f64).sqrt())
}
