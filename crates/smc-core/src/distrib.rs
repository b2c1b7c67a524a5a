//! Conditional probability distributions attached to random functions.

use crate::model::{ModelError, Value};
use rand::RngCore;
use rand::distributions::Distribution;
use statrs::distribution::{Categorical, Continuous, Discrete, Normal, Uniform};
use std::fmt;

/// Distribution of a variable given the values of its parents.
pub trait Cpd: fmt::Debug + Send + Sync {
    fn sample(&self, parents: &[Value], rng: &mut dyn RngCore) -> Result<Value, ModelError>;

    /// Log probability (or log density) of `value` given `parents`.
    fn log_prob(&self, parents: &[Value], value: &Value) -> Result<f64, ModelError>;
}

/// Gaussian whose mean is an affine function of real-valued parents.
#[derive(Debug, Clone)]
pub struct LinearGaussian {
    intercept: f64,
    coefficients: Vec<f64>,
    std_dev: f64,
}

impl LinearGaussian {
    pub fn new(intercept: f64, coefficients: Vec<f64>, std_dev: f64) -> Result<Self, ModelError> {
        if !(std_dev.is_finite() && std_dev > 0.0) {
            return Err(ModelError::InvalidDistribution(format!(
                "gaussian standard deviation must be positive, got {std_dev}"
            )));
        }
        Ok(Self {
            intercept,
            coefficients,
            std_dev,
        })
    }

    /// Gaussian with no parents.
    pub fn fixed(mean: f64, std_dev: f64) -> Result<Self, ModelError> {
        Self::new(mean, Vec::new(), std_dev)
    }

    fn normal(&self, parents: &[Value]) -> Result<Normal, ModelError> {
        if parents.len() != self.coefficients.len() {
            return Err(ModelError::InvalidDistribution(format!(
                "gaussian expects {} parents, got {}",
                self.coefficients.len(),
                parents.len()
            )));
        }
        let mut mean = self.intercept;
        for (coefficient, parent) in self.coefficients.iter().zip(parents) {
            let x = parent.as_real().ok_or_else(|| {
                ModelError::InvalidDistribution(format!("gaussian parent {parent} is not numeric"))
            })?;
            mean += coefficient * x;
        }
        Normal::new(mean, self.std_dev)
            .map_err(|err| ModelError::InvalidDistribution(err.to_string()))
    }
}

impl Cpd for LinearGaussian {
    fn sample(&self, parents: &[Value], rng: &mut dyn RngCore) -> Result<Value, ModelError> {
        let normal = self.normal(parents)?;
        Ok(Value::Real(normal.sample(rng)))
    }

    fn log_prob(&self, parents: &[Value], value: &Value) -> Result<f64, ModelError> {
        let x = value
            .as_real()
            .ok_or_else(|| ModelError::InvalidDistribution(format!("{value} is not real")))?;
        Ok(self.normal(parents)?.ln_pdf(x))
    }
}

/// Continuous uniform over `[low, high]`, independent of parents.
#[derive(Debug, Clone)]
pub struct UniformReal {
    inner: Uniform,
}

impl UniformReal {
    pub fn new(low: f64, high: f64) -> Result<Self, ModelError> {
        let inner = Uniform::new(low, high)
            .map_err(|err| ModelError::InvalidDistribution(err.to_string()))?;
        Ok(Self { inner })
    }
}

impl Cpd for UniformReal {
    fn sample(&self, _parents: &[Value], rng: &mut dyn RngCore) -> Result<Value, ModelError> {
        Ok(Value::Real(self.inner.sample(rng)))
    }

    fn log_prob(&self, _parents: &[Value], value: &Value) -> Result<f64, ModelError> {
        let x = value
            .as_real()
            .ok_or_else(|| ModelError::InvalidDistribution(format!("{value} is not real")))?;
        Ok(self.inner.ln_pdf(x))
    }
}

/// Categorical table over a fixed outcome list, one row per parent assignment.
#[derive(Debug, Clone)]
pub struct Tabular {
    outcomes: Vec<Value>,
    rows: Vec<(Vec<Value>, Categorical)>,
}

impl Tabular {
    pub fn new(outcomes: Vec<Value>) -> Self {
        Self {
            outcomes,
            rows: Vec::new(),
        }
    }

    /// Tabular distribution with no parents.
    pub fn prior(outcomes: Vec<Value>, probs: &[f64]) -> Result<Self, ModelError> {
        Self::new(outcomes).row(Vec::new(), probs)
    }

    /// Adds the outcome probabilities used when the parents take `key`.
    pub fn row(mut self, key: Vec<Value>, probs: &[f64]) -> Result<Self, ModelError> {
        if probs.len() != self.outcomes.len() {
            return Err(ModelError::InvalidDistribution(format!(
                "row has {} probabilities for {} outcomes",
                probs.len(),
                self.outcomes.len()
            )));
        }
        let categorical = Categorical::new(probs)
            .map_err(|err| ModelError::InvalidDistribution(err.to_string()))?;
        self.rows.retain(|(existing, _)| existing != &key);
        self.rows.push((key, categorical));
        Ok(self)
    }

    pub fn outcomes(&self) -> &[Value] {
        &self.outcomes
    }

    fn lookup(&self, parents: &[Value]) -> Result<&Categorical, ModelError> {
        self.rows
            .iter()
            .find(|(key, _)| key.as_slice() == parents)
            .map(|(_, categorical)| categorical)
            .ok_or_else(|| {
                let rendered: Vec<String> = parents.iter().map(Value::to_string).collect();
                ModelError::InvalidDistribution(format!(
                    "no table row for parents [{}]",
                    rendered.join(", ")
                ))
            })
    }
}

impl Cpd for Tabular {
    fn sample(&self, parents: &[Value], rng: &mut dyn RngCore) -> Result<Value, ModelError> {
        let categorical = self.lookup(parents)?;
        let index = categorical.sample(rng) as usize;
        self.outcomes
            .get(index)
            .cloned()
            .ok_or_else(|| ModelError::InvalidDistribution(format!("outcome {index} out of range")))
    }

    fn log_prob(&self, parents: &[Value], value: &Value) -> Result<f64, ModelError> {
        let categorical = self.lookup(parents)?;
        match self.outcomes.iter().position(|outcome| outcome == value) {
            Some(index) => Ok(categorical.ln_pmf(index as u64)),
            None => Ok(f64::NEG_INFINITY),
        }
    }
}
