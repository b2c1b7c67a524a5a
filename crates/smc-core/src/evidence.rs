//! Observed values that condition particle worlds.

use crate::model::{Model, ModelError, Timestep, Value, Var};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("observation of {var}: {source}")]
    Scope {
        var: String,
        #[source]
        source: ModelError,
    },
    #[error("{var} is a non-random function and cannot be observed")]
    NonRandom { var: String },
    #[error("{var} observed with type-incorrect value {value}")]
    TypeMismatch { var: String, value: Value },
    #[error("{var} observed with conflicting values {first} and {second}")]
    Conflict {
        var: String,
        first: Value,
        second: Value,
    },
}

/// A single observation `var = value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub var: Var,
    pub value: Value,
}

/// An ordered batch of observations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    observations: Vec<Observation>,
    #[serde(skip)]
    compiled: bool,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(mut self, var: Var, value: impl Into<Value>) -> Self {
        self.add(var, value);
        self
    }

    pub fn add(&mut self, var: Var, value: impl Into<Value>) {
        self.observations.push(Observation {
            var,
            value: value.into(),
        });
        self.compiled = false;
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn observed_vars(&self) -> impl Iterator<Item = &Var> {
        self.observations.iter().map(|obs| &obs.var)
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// Checks that every observed variable names a random function of the
    /// model, applied correctly, and that its value has the return type.
    pub fn check_types_and_scope(&self, model: &Model) -> Result<(), EvidenceError> {
        for obs in &self.observations {
            let function = model
                .check_var(&obs.var)
                .map_err(|source| EvidenceError::Scope {
                    var: obs.var.to_string(),
                    source,
                })?;
            if !function.is_random() {
                return Err(EvidenceError::NonRandom {
                    var: obs.var.to_string(),
                });
            }
            if !model.value_has_type(&obs.value, function.return_type()) {
                return Err(EvidenceError::TypeMismatch {
                    var: obs.var.to_string(),
                    value: obs.value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Type-checks, drops repeated identical observations, rejects
    /// conflicting ones, and orders observations by timestep (atemporal first).
    pub fn compile(&mut self, model: &Model) -> Result<(), EvidenceError> {
        self.check_types_and_scope(model)?;
        let mut seen: BTreeMap<Var, Value> = BTreeMap::new();
        let mut kept = Vec::with_capacity(self.observations.len());
        for obs in self.observations.drain(..) {
            match seen.get(&obs.var) {
                Some(existing) if existing == &obs.value => continue,
                Some(existing) => {
                    return Err(EvidenceError::Conflict {
                        var: obs.var.to_string(),
                        first: existing.clone(),
                        second: obs.value,
                    });
                }
                None => {
                    seen.insert(obs.var.clone(), obs.value.clone());
                    kept.push(obs);
                }
            }
        }
        kept.sort_by_key(|obs| obs.var.timestep());
        self.observations = kept;
        self.compiled = true;
        Ok(())
    }

    /// Observations of both batches, `self` first.
    pub fn union(&self, other: &Evidence) -> Evidence {
        let mut observations = self.observations.clone();
        observations.extend(other.observations.iter().cloned());
        Evidence {
            observations,
            compiled: false,
        }
    }

    /// Groups observations by the timestep of the observed variable. The
    /// atemporal slice, if any, is keyed by `None` and sorts first.
    pub fn split_by_timestep(&self) -> BTreeMap<Option<Timestep>, Evidence> {
        let mut slices: BTreeMap<Option<Timestep>, Evidence> = BTreeMap::new();
        for obs in &self.observations {
            let slice = slices.entry(obs.var.timestep()).or_default();
            slice.observations.push(obs.clone());
            slice.compiled = self.compiled;
        }
        slices
    }
}
