use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::RngCore;
use smc_core::distrib::{LinearGaussian, Tabular};
use smc_core::model::{Dependency, Function, IdTypeSet, ModelError, ParentRef};
use smc_core::stats::SamplerStats;
use smc_core::{
    EngineKind, Evidence, FilterConfig, FilterError, FilterState, Model, Particle, ParticleFilter,
    RngDraw, RngNoise, Sampler, SamplerKind, ScriptedDraw, Value, ValueQuery, ValueType,
    Var, WeightedWorld, World, ZeroNoise, resample_population,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

const TOLERANCE: f64 = 0.05;

fn rainy() -> Value {
    Value::symbol("Rainy")
}

fn dry() -> Value {
    Value::symbol("Dry")
}

/// Two-state weather chain whose transition depends on a hidden region.
fn weather_model() -> Arc<Model> {
    let outcomes = vec![rainy(), dry()];
    Arc::new(
        Model::builder()
            .guaranteed_type("RainEvent", &["Rainy", "Dry"])
            .function(Function::random(
                "RainyRegion",
                ValueType::symbol("RainEvent"),
                Dependency::random(Vec::new(), Tabular::prior(outcomes.clone(), &[0.5, 0.5]).unwrap()),
            ))
            .function(
                Function::random(
                    "Weather",
                    ValueType::symbol("RainEvent"),
                    Dependency::random(
                        vec![ParentRef::atemporal("RainyRegion"), ParentRef::prev("Weather")],
                        Tabular::new(outcomes.clone())
                            .row(vec![rainy(), rainy()], &[0.8, 0.2])
                            .unwrap()
                            .row(vec![rainy(), dry()], &[0.3, 0.7])
                            .unwrap()
                            .row(vec![dry(), rainy()], &[0.6, 0.4])
                            .unwrap()
                            .row(vec![dry(), dry()], &[0.2, 0.8])
                            .unwrap(),
                    ),
                )
                .temporal()
                .with_initial(Dependency::random(
                    vec![ParentRef::atemporal("RainyRegion")],
                    Tabular::new(outcomes)
                        .row(vec![rainy()], &[0.7, 0.3])
                        .unwrap()
                        .row(vec![dry()], &[0.3, 0.7])
                        .unwrap(),
                )),
            )
            .build()
            .unwrap(),
    )
}

/// Static real parameter observed through noisy readings.
fn drift_model() -> Arc<Model> {
    Arc::new(
        Model::builder()
            .function(Function::random(
                "Drift",
                ValueType::Real,
                Dependency::random(Vec::new(), LinearGaussian::fixed(0.0, 1.0).unwrap()),
            ))
            .function(
                Function::random(
                    "Reading",
                    ValueType::Real,
                    Dependency::random(
                        vec![ParentRef::atemporal("Drift")],
                        LinearGaussian::new(0.0, vec![1.0], 0.5).unwrap(),
                    ),
                )
                .temporal(),
            )
            .build()
            .unwrap(),
    )
}

fn config(particles: usize, seed: u64) -> FilterConfig {
    FilterConfig {
        num_particles: Some(particles),
        seed: Some(seed),
        ..FilterConfig::default()
    }
}

fn weather_obs(t: u32, value: Value) -> Evidence {
    Evidence::new().observe(Var::at("Weather", t), value)
}

fn tag_of(particle: &Particle) -> Option<i64> {
    match particle.world().value(&Var::nullary("Tag")) {
        Some(Value::Integer(tag)) => Some(*tag),
        _ => None,
    }
}

/// Writes a fixed tag into the world and reports a fixed weight.
#[derive(Debug)]
struct Tagged {
    tag: i64,
    log_weight: f64,
}

impl Sampler for Tagged {
    fn kind(&self) -> SamplerKind {
        SamplerKind::LikelihoodWeighting
    }

    fn sample(
        &self,
        base: World,
        _evidence: &Evidence,
        _rng: &mut dyn RngCore,
        stats: &mut SamplerStats,
    ) -> Result<WeightedWorld, ModelError> {
        let mut world = base;
        world.set_value(Var::nullary("Tag"), Value::Integer(self.tag));
        stats.record(self.log_weight, true);
        Ok(WeightedWorld {
            world,
            log_weight: self.log_weight,
        })
    }
}

/// Hands out weights from a script in call order, tagging each world with
/// its position in the script.
#[derive(Debug)]
struct ScriptedWeights {
    weights: Vec<f64>,
    next: Mutex<usize>,
}

impl ScriptedWeights {
    fn new(weights: Vec<f64>) -> Self {
        Self {
            weights,
            next: Mutex::new(0),
        }
    }
}

impl Sampler for ScriptedWeights {
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
        let mut next = self.next.lock().unwrap();
        let index = *next % self.weights.len();
        *next += 1;
        Tagged {
            tag: index as i64,
            log_weight: self.weights[index].ln(),
        }
        .sample(base, evidence, rng, stats)
    }
}

fn tagged_population(weights: &[f64]) -> Vec<Particle> {
    let id_types = Arc::new(IdTypeSet::none());
    let evidence = weather_obs(0, rainy());
    let mut rng = SmallRng::seed_from_u64(0);
    let mut stats = SamplerStats::default();
    weights
        .iter()
        .enumerate()
        .map(|(index, weight)| {
            let mut particle = Particle::new(Arc::clone(&id_types), 1);
            let sampler = Tagged {
                tag: index as i64,
                log_weight: weight.ln(),
            };
            particle.take(&evidence, &sampler, &mut rng, &mut stats).unwrap();
            particle
        })
        .collect()
}

fn query(var: Var) -> ValueQuery {
    ValueQuery::new(var)
}

fn answer_prob(filter: &mut ParticleFilter, var: Var, value: &Value) -> f64 {
    let mut queries = vec![query(var)];
    filter.answer(&mut queries).unwrap();
    queries[0].prob(value)
}

#[test]
fn resampling_frequencies_follow_weights() {
    let weights = [1.0, 3.0, 0.0, 6.0];
    let mut particles = tagged_population(&weights);
    let draws = 20_000;
    let mut rng = SmallRng::seed_from_u64(42);
    resample_population(&mut particles, draws, &mut RngDraw(&mut rng)).unwrap();
    assert_eq!(particles.len(), draws);

    let mut counts = [0usize; 4];
    for particle in &particles {
        counts[tag_of(particle).unwrap() as usize] += 1;
    }
    for (count, weight) in counts.iter().zip(weights) {
        let frequency = *count as f64 / draws as f64;
        assert!(
            (frequency - weight / 10.0).abs() < 0.015,
            "frequency {frequency} for weight {weight}"
        );
    }
    assert_eq!(counts[2], 0);
}

#[test]
fn resampled_particles_never_alias() {
    let mut particles = tagged_population(&[0.5, 0.5]);
    resample_population(
        &mut particles,
        6,
        &mut ScriptedDraw::new(vec![0, 0, 0, 1, 1, 0]),
    )
    .unwrap();
    let ids: HashSet<_> = particles.iter().map(Particle::id).collect();
    assert_eq!(ids.len(), 6);

    let weights_before: Vec<f64> = particles.iter().map(Particle::weight).collect();
    particles[1]
        .world_mut()
        .set_value(Var::nullary("Tag"), Value::Integer(99));
    particles[4]
        .world_mut()
        .set_value(Var::at("Weather", 0), dry());

    let tags: Vec<i64> = particles.iter().map(|p| tag_of(p).unwrap()).collect();
    assert_eq!(tags, vec![0, 99, 0, 1, 1, 0]);
    for (index, particle) in particles.iter().enumerate() {
        if index != 4 {
            assert!(!particle.world().is_instantiated(&Var::at("Weather", 0)));
        }
    }
    let weights_after: Vec<f64> = particles.iter().map(Particle::weight).collect();
    assert_eq!(weights_before, weights_after);
}

#[test]
fn four_particle_resample_moves_originals_and_copies_repeats() {
    let mut filter = ParticleFilter::new(weather_model(), config(4, 1))
        .unwrap()
        .with_sampler(Arc::new(ScriptedWeights::new(vec![0.4, 0.3, 0.2, 0.1])));
    filter.take(&weather_obs(0, rainy())).unwrap();
    let weights: Vec<f64> = filter.particles().iter().map(Particle::weight).collect();
    for (weight, expected) in weights.iter().zip([0.4, 0.3, 0.2, 0.1]) {
        assert!((weight - expected).abs() < 1e-12);
    }
    let ids: Vec<_> = filter.particles().iter().map(Particle::id).collect();

    filter
        .resample_with(&mut ScriptedDraw::new(vec![0, 0, 1, 3]), &mut ZeroNoise)
        .unwrap();
    let resampled = filter.particles();
    assert_eq!(resampled.len(), 4);
    assert_eq!(resampled[0].id(), ids[0]);
    assert!(!ids.contains(&resampled[1].id()));
    assert_eq!(tag_of(&resampled[1]), Some(0));
    assert!((resampled[1].weight() - 0.4).abs() < 1e-12);
    assert_eq!(resampled[2].id(), ids[1]);
    assert_eq!(resampled[3].id(), ids[3]);
    assert!(resampled.iter().all(|p| p.id() != ids[2]));
    assert_eq!(filter.metrics().copies, 1);
}

#[test]
fn weather_posterior_matches_exact_inference() {
    let mut filter = ParticleFilter::new(weather_model(), config(4000, 11)).unwrap();
    for t in 0..3 {
        filter.take(&weather_obs(t, rainy())).unwrap();
        let p = answer_prob(&mut filter, Var::at("Weather", t), &rainy());
        assert!((p - 1.0).abs() < 1e-12);
    }
    let weather = answer_prob(&mut filter, Var::at("Weather", 3), &rainy());
    assert!((weather - 0.761_151_079_136_690_7).abs() < TOLERANCE, "Weather@3 {weather}");
    let region = answer_prob(&mut filter, Var::nullary("RainyRegion"), &rainy());
    assert!((region - 0.805_755_395_683_453_2).abs() < TOLERANCE, "RainyRegion {region}");
}

#[test]
fn weather_prior_without_evidence() {
    let mut filter = ParticleFilter::new(weather_model(), config(4000, 12)).unwrap();
    let weather = answer_prob(&mut filter, Var::at("Weather", 3), &rainy());
    assert!((weather - 0.471_85).abs() < TOLERANCE, "Weather@3 {weather}");
    let region = answer_prob(&mut filter, Var::nullary("RainyRegion"), &rainy());
    assert!((region - 0.5).abs() < TOLERANCE, "RainyRegion {region}");
}

#[test]
fn rejection_sampler_agrees_with_likelihood_weighting() {
    let mut filter = ParticleFilter::new(
        weather_model(),
        FilterConfig {
            sampler_class: SamplerKind::Rejection,
            ..config(4000, 13)
        },
    )
    .unwrap();
    for t in 0..3 {
        filter.take(&weather_obs(t, rainy())).unwrap();
    }
    assert!(filter.metrics().particles_dropped > 0);
    let region = answer_prob(&mut filter, Var::nullary("RainyRegion"), &rainy());
    assert!((region - 0.805_755_395_683_453_2).abs() < TOLERANCE, "RainyRegion {region}");
}

#[test]
fn split_and_joint_evidence_give_the_same_posterior() {
    let e1 = weather_obs(0, rainy());
    let e2 = weather_obs(1, rainy()).union(&weather_obs(2, rainy()));

    let mut split = ParticleFilter::new(weather_model(), config(4000, 21)).unwrap();
    split.take(&e1).unwrap();
    split.take(&e2).unwrap();
    let split_region = answer_prob(&mut split, Var::nullary("RainyRegion"), &rainy());

    let mut joint = ParticleFilter::new(weather_model(), config(4000, 21)).unwrap();
    joint.take(&e1.union(&e2)).unwrap();
    let joint_region = answer_prob(&mut joint, Var::nullary("RainyRegion"), &rainy());

    assert!(
        (split_region - joint_region).abs() < TOLERANCE,
        "split {split_region} vs joint {joint_region}"
    );
    assert!((split.data_log_likelihood() - joint.data_log_likelihood()).abs() < 0.1);
}

#[test]
fn extinction_is_reported_and_leaves_no_population() {
    let model = Arc::new(
        Model::builder()
            .guaranteed_type("Side", &["Heads", "Tails"])
            .function(
                Function::random(
                    "Toss",
                    ValueType::symbol("Side"),
                    Dependency::random(
                        Vec::new(),
                        Tabular::prior(vec![Value::symbol("Heads"), Value::symbol("Tails")], &[1.0, 0.0])
                            .unwrap(),
                    ),
                )
                .temporal(),
            )
            .build()
            .unwrap(),
    );
    let mut filter = ParticleFilter::new(model, config(50, 3)).unwrap();
    filter
        .take(&Evidence::new().observe(Var::at("Toss", 0), Value::symbol("Heads")))
        .unwrap();

    let result = filter.take(&Evidence::new().observe(Var::at("Toss", 1), Value::symbol("Tails")));
    assert!(matches!(result, Err(FilterError::AllParticlesExtinguished { step: 2 })));
    assert_eq!(filter.state(), FilterState::Extinguished);
    assert!(filter.particles().is_empty());

    let again = filter.take(&Evidence::new().observe(Var::at("Toss", 2), Value::symbol("Heads")));
    assert!(matches!(again, Err(FilterError::Extinguished)));
    let mut queries = vec![query(Var::at("Toss", 0))];
    filter.answer(&mut queries).unwrap();
    assert!(queries[0].histogram().is_empty());

    filter.reset();
    assert_eq!(filter.state(), FilterState::Ready);
    assert_eq!(filter.particles().len(), 50);
}

#[test]
fn liu_west_with_rho_one_is_the_identity() {
    let mut filter = ParticleFilter::new(
        drift_model(),
        FilterConfig {
            engine: EngineKind::LiuWest,
            rho: 1.0,
            ..config(20, 5)
        },
    )
    .unwrap();
    filter
        .take(&Evidence::new().observe(Var::at("Reading", 0), 0.3))
        .unwrap();
    let drift_of = |p: &Particle| p.world().value(&Var::nullary("Drift")).and_then(Value::as_real);
    let before: Vec<Option<f64>> = filter.particles().iter().map(drift_of).collect();

    let mut rng = SmallRng::seed_from_u64(8);
    let mut noise = RngNoise::new(&mut rng).unwrap();
    filter
        .resample_with(&mut ScriptedDraw::new((0..20).collect()), &mut noise)
        .unwrap();
    let after: Vec<Option<f64>> = filter.particles().iter().map(drift_of).collect();
    assert_eq!(before, after);
    assert_eq!(filter.metrics().perturbed_values, 20);
}

#[test]
fn liu_west_with_zero_noise_shrinks_toward_the_mean() {
    let rho = 0.9;
    let mut filter = ParticleFilter::new(
        drift_model(),
        FilterConfig {
            engine: EngineKind::LiuWest,
            rho,
            ..config(10, 6)
        },
    )
    .unwrap();
    filter
        .take(&Evidence::new().observe(Var::at("Reading", 0), -0.2))
        .unwrap();
    let drift_of = |p: &Particle| {
        p.world()
            .value(&Var::nullary("Drift"))
            .and_then(Value::as_real)
            .unwrap()
    };
    let before: Vec<f64> = filter.particles().iter().map(drift_of).collect();
    let mean = before.iter().sum::<f64>() / before.len() as f64;

    filter
        .resample_with(&mut ScriptedDraw::new((0..10).collect()), &mut ZeroNoise)
        .unwrap();
    for (particle, v) in filter.particles().iter().zip(&before) {
        let expected = rho * v + (1.0 - rho) * mean;
        assert!((drift_of(particle) - expected).abs() < 1e-12);
    }
}

#[test]
fn liu_west_tracks_a_static_parameter_over_a_stream() {
    let mut filter = ParticleFilter::new(
        drift_model(),
        FilterConfig {
            engine: EngineKind::LiuWest,
            ..config(1000, 17)
        },
    )
    .unwrap();
    let mut evidence = Evidence::new();
    for t in 0..20 {
        evidence.add(Var::at("Reading", t), 1.0);
    }
    let mut queries = vec![query(Var::nullary("Drift"))];
    filter.run(&evidence, &mut queries, &mut std::io::sink()).unwrap();
    let mean = queries[0].mean().unwrap();
    // Conjugate posterior mean is 80 / 81.
    assert!((mean - 80.0 / 81.0).abs() < 0.15, "posterior mean {mean}");
    assert!(filter.metrics().perturbed_values > 0);
}

#[test]
fn decayed_mcmc_keeps_evidence_and_estimates_the_parameter() {
    let mut filter = ParticleFilter::new(
        drift_model(),
        FilterConfig {
            use_decayed_mcmc: true,
            num_moves: 2,
            max_recall: 5,
            ..config(300, 19)
        },
    )
    .unwrap();
    let mut evidence = Evidence::new();
    for t in 0..10 {
        evidence.add(Var::at("Reading", t), 1.0);
    }
    let mut queries = vec![query(Var::nullary("Drift"))];
    filter.run(&evidence, &mut queries, &mut std::io::sink()).unwrap();
    let mean = queries[0].mean().unwrap();
    // Conjugate posterior mean is 40 / 41.
    assert!((mean - 40.0 / 41.0).abs() < 0.15, "posterior mean {mean}");
    assert!(filter.metrics().rejuvenation_moves > 0);
    for particle in filter.particles() {
        assert_eq!(
            particle.world().value(&Var::at("Reading", 9)),
            Some(&Value::Real(1.0))
        );
        assert!(!particle.world().is_instantiated(&Var::at("Reading", 4)));
    }
}
