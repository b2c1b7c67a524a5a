//! Built-in models and the synthetic observation streams they are run on.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smc_core::distrib::{LinearGaussian, Tabular};
use smc_core::model::{Dependency, Function, ParentRef};
use smc_core::{Evidence, Model, ModelError, Value, ValueType, Var};
use statrs::distribution::Normal;
use thiserror::Error;

use crate::config::{ScenarioConfig, ScenarioKind};

const READING_STD_DEV: f64 = 0.5;
const DRIFT_PRIOR_STD_DEV: f64 = 1.0;

/// Transition table rows keyed by (region, previous weather), probability of rain.
const WEATHER_TRANSITIONS: [(bool, bool, f64); 4] = [
    (true, true, 0.8),
    (true, false, 0.3),
    (false, true, 0.6),
    (false, false, 0.2),
];
const INITIAL_RAIN_GIVEN_RAINY_REGION: f64 = 0.7;
const INITIAL_RAIN_GIVEN_DRY_REGION: f64 = 0.3;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to build {scenario} model: {source}")]
    Model {
        scenario: &'static str,
        #[source]
        source: ModelError,
    },
    #[error("invalid observation noise: {0}")]
    Noise(String),
}

/// A model, the evidence stream it is filtered on, and the hidden values
/// that generated the stream.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub kind: ScenarioKind,
    pub model: Arc<Model>,
    pub evidence: Evidence,
    pub queries: Vec<Var>,
    pub truth: BTreeMap<Var, Value>,
}

impl Scenario {
    pub fn build(config: &ScenarioConfig) -> Result<Self, ScenarioError> {
        let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or(0));
        match config.kind {
            ScenarioKind::Weather => weather(config.timesteps, &mut rng),
            ScenarioKind::Drift => drift(config.timesteps, config.true_drift, &mut rng),
        }
    }

    pub fn truth_for(&self, var: &Var) -> Option<&Value> {
        self.truth.get(var)
    }
}

fn rain_event(rainy: bool) -> Value {
    Value::symbol(if rainy { "Rainy" } else { "Dry" })
}

pub fn weather_model() -> Result<Model, ModelError> {
    let outcomes = vec![rain_event(true), rain_event(false)];
    let mut transition = Tabular::new(outcomes.clone());
    for (region, previous, rain) in WEATHER_TRANSITIONS {
        transition = transition.row(
            vec![rain_event(region), rain_event(previous)],
            &[rain, 1.0 - rain],
        )?;
    }
    let initial = Tabular::new(outcomes.clone())
        .row(
            vec![rain_event(true)],
            &[INITIAL_RAIN_GIVEN_RAINY_REGION, 1.0 - INITIAL_RAIN_GIVEN_RAINY_REGION],
        )?
        .row(
            vec![rain_event(false)],
            &[INITIAL_RAIN_GIVEN_DRY_REGION, 1.0 - INITIAL_RAIN_GIVEN_DRY_REGION],
        )?;

    Model::builder()
        .guaranteed_type("RainEvent", &["Rainy", "Dry"])
        .function(Function::random(
            "RainyRegion",
            ValueType::symbol("RainEvent"),
            Dependency::random(Vec::new(), Tabular::prior(outcomes, &[0.5, 0.5])?),
        ))
        .function(
            Function::random(
                "Weather",
                ValueType::symbol("RainEvent"),
                Dependency::random(
                    vec![ParentRef::atemporal("RainyRegion"), ParentRef::prev("Weather")],
                    transition,
                ),
            )
            .temporal()
            .with_initial(Dependency::random(
                vec![ParentRef::atemporal("RainyRegion")],
                initial,
            )),
        )
        .build()
}

pub fn drift_model() -> Result<Model, ModelError> {
    Model::builder()
        .function(Function::random(
            "Drift",
            ValueType::Real,
            Dependency::random(Vec::new(), LinearGaussian::fixed(0.0, DRIFT_PRIOR_STD_DEV)?),
        ))
        .function(
            Function::random(
                "Reading",
                ValueType::Real,
                Dependency::random(
                    vec![ParentRef::atemporal("Drift")],
                    LinearGaussian::new(0.0, vec![1.0], READING_STD_DEV)?,
                ),
            )
            .temporal(),
        )
        .build()
}

fn weather(timesteps: u32, rng: &mut StdRng) -> Result<Scenario, ScenarioError> {
    let model = weather_model().map_err(|source| ScenarioError::Model {
        scenario: "weather",
        source,
    })?;
    let region = rng.gen_bool(0.5);
    let mut truth = BTreeMap::new();
    truth.insert(Var::nullary("RainyRegion"), rain_event(region));

    let mut evidence = Evidence::new();
    let initial = if region {
        INITIAL_RAIN_GIVEN_RAINY_REGION
    } else {
        INITIAL_RAIN_GIVEN_DRY_REGION
    };
    let mut rain = rng.gen_bool(initial);
    // The final step is held out as a one-step-ahead prediction.
    for t in 0..=timesteps {
        if t > 0 {
            let p = WEATHER_TRANSITIONS
                .iter()
                .find(|(r, previous, _)| *r == region && *previous == rain)
                .map_or(0.5, |(_, _, p)| *p);
            rain = rng.gen_bool(p);
        }
        let var = Var::at("Weather", t);
        if t < timesteps {
            evidence.add(var.clone(), rain_event(rain));
        }
        truth.insert(var, rain_event(rain));
    }

    Ok(Scenario {
        kind: ScenarioKind::Weather,
        model: Arc::new(model),
        evidence,
        queries: vec![Var::nullary("RainyRegion"), Var::at("Weather", timesteps)],
        truth,
    })
}

fn drift(timesteps: u32, true_drift: Option<f64>, rng: &mut StdRng) -> Result<Scenario, ScenarioError> {
    let model = drift_model().map_err(|source| ScenarioError::Model {
        scenario: "drift",
        source,
    })?;
    let prior = Normal::new(0.0, DRIFT_PRIOR_STD_DEV).map_err(|err| ScenarioError::Noise(err.to_string()))?;
    let drift = true_drift.unwrap_or_else(|| prior.sample(rng));
    let noise = Normal::new(drift, READING_STD_DEV).map_err(|err| ScenarioError::Noise(err.to_string()))?;

    let mut truth = BTreeMap::new();
    truth.insert(Var::nullary("Drift"), Value::Real(drift));
    let mut evidence = Evidence::new();
    for t in 0..=timesteps {
        let var = Var::at("Reading", t);
        let reading = noise.sample(rng);
        if t < timesteps {
            evidence.add(var.clone(), reading);
        }
        truth.insert(var, Value::Real(reading));
    }

    Ok(Scenario {
        kind: ScenarioKind::Drift,
        model: Arc::new(model),
        evidence,
        queries: vec![Var::nullary("Drift"), Var::at("Reading", timesteps)],
        truth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: ScenarioKind, seed: u64) -> ScenarioConfig {
        ScenarioConfig {
            kind,
            timesteps: 8,
            seed: Some(seed),
            true_drift: None,
        }
    }

    #[test]
    fn weather_stream_holds_out_the_last_step() {
        let scenario = Scenario::build(&config(ScenarioKind::Weather, 3)).unwrap();
        assert_eq!(scenario.evidence.len(), 8);
        assert!(scenario.truth_for(&Var::at("Weather", 8)).is_some());
        assert!(
            scenario
                .evidence
                .observed_vars()
                .all(|var| var != &Var::at("Weather", 8))
        );
        scenario.evidence.check_types_and_scope(&scenario.model).unwrap();
    }

    #[test]
    fn streams_are_reproducible_from_the_seed() {
        let a = Scenario::build(&config(ScenarioKind::Drift, 5)).unwrap();
        let b = Scenario::build(&config(ScenarioKind::Drift, 5)).unwrap();
        let c = Scenario::build(&config(ScenarioKind::Drift, 6)).unwrap();
        assert_eq!(a.evidence, b.evidence);
        assert_ne!(a.evidence, c.evidence);
    }

    #[test]
    fn fixed_drift_is_recorded_as_truth() {
        let scenario = Scenario::build(&ScenarioConfig {
            true_drift: Some(0.25),
            ..config(ScenarioKind::Drift, 1)
        })
        .unwrap();
        assert_eq!(scenario.truth_for(&Var::nullary("Drift")), Some(&Value::Real(0.25)));
        assert_eq!(scenario.queries.len(), 2);
    }
}
