#![deny(warnings)]

pub mod config;
pub mod distrib;
pub mod evidence;
pub mod filter;
pub mod liu_west;
pub mod model;
pub mod parallel;
pub mod particle;
pub mod query;
pub mod rejuvenate;
pub mod sampler;
pub mod stats;
pub mod world;

pub use config::{ConfigError, EngineKind, FilterConfig};
pub use evidence::{Evidence, EvidenceError, Observation};
pub use filter::{
    CategoricalDraw, FilterError, FilterHooks, FilterState, ParticleFilter, RngDraw, ScriptedDraw,
    resample_population,
};
pub use liu_west::{LiuWest, NoiseSource, RngNoise, ZeroNoise};
pub use model::{Model, ModelError, Timestep, Value, ValueType, Var};
pub use parallel::ParallelFilters;
pub use particle::{Particle, ParticleId};
pub use query::{Query, SharedQuery, ValueQuery};
pub use rejuvenate::{DecayedMetropolisHastings, MAX_RECALL, Rejuvenator, Transition};
pub use sampler::{NEGLIGIBLE_LOG_WEIGHT, Sampler, SamplerKind, WeightedWorld};
pub use stats::{FilterMetrics, SamplerStats};
pub use world::World;

pub struct EngineInfo;

impl EngineInfo {
    pub const fn name() -> &'static str {
        "smc-core"
    }

    pub const fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
