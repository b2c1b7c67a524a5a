//! Query statistics accumulated from weighted worlds.

use crate::model::{Timestep, Value, Var};
use crate::world::World;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

/// A statistic estimated from weighted particle worlds.
pub trait Query: Send {
    /// Variables that must be instantiated before [`Query::update_stats`].
    fn variables(&self) -> Vec<Var>;

    fn update_stats(&mut self, world: &World, weight: f64);

    fn print_results(&self, out: &mut dyn Write) -> io::Result<()>;

    /// Latest timestep referenced by the query, `None` if atemporal.
    fn timestep(&self) -> Option<Timestep> {
        self.variables().iter().filter_map(Var::timestep).max()
    }
}

impl<Q: Query + ?Sized> Query for Box<Q> {
    fn variables(&self) -> Vec<Var> {
        (**self).variables()
    }

    fn update_stats(&mut self, world: &World, weight: f64) {
        (**self).update_stats(world, weight);
    }

    fn print_results(&self, out: &mut dyn Write) -> io::Result<()> {
        (**self).print_results(out)
    }

    fn timestep(&self) -> Option<Timestep> {
        (**self).timestep()
    }
}

/// Weighted histogram over values.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    weights: BTreeMap<Value, f64>,
    total: f64,
}

impl Histogram {
    pub fn add(&mut self, value: Value, weight: f64) {
        *self.weights.entry(value).or_insert(0.0) += weight;
        self.total += weight;
    }

    pub fn total_weight(&self) -> f64 {
        self.total
    }

    /// Normalized probability of `value`, zero for an empty histogram.
    pub fn prob(&self, value: &Value) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        self.weights.get(value).copied().unwrap_or(0.0) / self.total
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Value, f64)> {
        self.weights.iter().map(|(value, weight)| (value, *weight))
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn clear(&mut self) {
        self.weights.clear();
        self.total = 0.0;
    }
}

/// Posterior of a single variable: a histogram of its values, plus a
/// weighted mean and variance when the values are numeric.
#[derive(Debug, Clone)]
pub struct ValueQuery {
    var: Var,
    histogram: Histogram,
    sum: f64,
    sum_sq: f64,
    numeric_weight: f64,
}

impl ValueQuery {
    pub fn new(var: Var) -> Self {
        Self {
            var,
            histogram: Histogram::default(),
            sum: 0.0,
            sum_sq: 0.0,
            numeric_weight: 0.0,
        }
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    pub fn prob(&self, value: &Value) -> f64 {
        self.histogram.prob(value)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.numeric_weight > 0.0).then(|| self.sum / self.numeric_weight)
    }

    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        Some((self.sum_sq / self.numeric_weight - mean * mean).max(0.0))
    }

    pub fn reset(&mut self) {
        self.histogram.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
        self.numeric_weight = 0.0;
    }
}

impl Query for ValueQuery {
    fn variables(&self) -> Vec<Var> {
        vec![self.var.clone()]
    }

    fn update_stats(&mut self, world: &World, weight: f64) {
        let Some(value) = world.value(&self.var) else {
            return;
        };
        if let Some(x) = value.as_real() {
            self.sum += weight * x;
            self.sum_sq += weight * x * x;
            self.numeric_weight += weight;
        }
        self.histogram.add(value.clone(), weight);
    }

    fn print_results(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Distribution of values for {}", self.var)?;
        if let (Some(mean), Some(variance)) = (self.mean(), self.variance()) {
            writeln!(out, "\tmean {mean:.6}\tvariance {variance:.6}")?;
            return Ok(());
        }
        let mut entries: Vec<(&Value, f64)> = self.histogram.entries().collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1));
        for (value, _) in entries {
            writeln!(out, "\t{:.6}\t{}", self.histogram.prob(value), value)?;
        }
        Ok(())
    }
}

/// A query shared between filters running on different threads. Each
/// update takes the query's own lock.
#[derive(Debug)]
pub struct SharedQuery<Q>(Arc<Mutex<Q>>);

impl<Q> Clone for SharedQuery<Q> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<Q: Query> SharedQuery<Q> {
    pub fn new(query: Q) -> Self {
        Self(Arc::new(Mutex::new(query)))
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Q> {
        self.0.lock()
    }
}

impl<Q: Query> Query for SharedQuery<Q> {
    fn variables(&self) -> Vec<Var> {
        self.0.lock().variables()
    }

    fn update_stats(&mut self, world: &World, weight: f64) {
        self.0.lock().update_stats(world, weight);
    }

    fn print_results(&self, out: &mut dyn Write) -> io::Result<()> {
        self.0.lock().print_results(out)
    }

    fn timestep(&self) -> Option<Timestep> {
        self.0.lock().timestep()
    }
}
