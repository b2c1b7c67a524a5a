//! Construction options for particle filters.

use crate::liu_west::DEFAULT_RHO;
use crate::model::{IdTypeSet, Model};
use crate::rejuvenate::{DEFAULT_ATEMPORAL_VAR_FACTOR, DEFAULT_MAX_RECALL, MAX_RECALL};
use crate::sampler::SamplerKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{Level, event};

pub const DEFAULT_NUM_PARTICLES: usize = 1000;
const DEFAULT_NUM_MOVES: usize = 1;
const DEFAULT_ID_TYPES: &str = "none";
const DEFAULT_QUERY_REPORT_INTERVAL: u32 = 10;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error(
        "numParticles ({num_particles}) and numSamples ({num_samples}) were both given with distinct values"
    )]
    ConflictingParticleCounts {
        num_particles: usize,
        num_samples: usize,
    },
    #[error("invalid value '{value}' for {key}: {message}")]
    Unparsable {
        key: String,
        value: String,
        message: String,
    },
    #[error("invalid {field}: {message}")]
    InvalidField { field: &'static str, message: String },
    #[error("invalid idTypes list '{0}'")]
    InvalidIdTypes(String),
}

/// Filter variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    ParticleFilter,
    LiuWest,
}

impl EngineKind {
    pub fn key(self) -> &'static str {
        match self {
            EngineKind::ParticleFilter => "particle_filter",
            EngineKind::LiuWest => "liu_west",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "particle_filter" | "pf" => Ok(EngineKind::ParticleFilter),
            "liu_west" | "liuwest" => Ok(EngineKind::LiuWest),
            other => Err(format!("unknown engine '{other}'")),
        }
    }
}

/// Options recognized by [`crate::ParticleFilter::new`].
///
/// Field names follow the camelCase option keys, both when deserialized and
/// when read from a property map with [`FilterConfig::from_properties`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub num_particles: Option<usize>,
    #[serde(default)]
    pub num_samples: Option<usize>,
    #[serde(default, rename = "useDecayedMCMC")]
    pub use_decayed_mcmc: bool,
    #[serde(default = "default_num_moves")]
    pub num_moves: usize,
    #[serde(default = "default_id_types")]
    pub id_types: String,
    #[serde(default)]
    pub sampler_class: SamplerKind,
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default = "default_rho")]
    pub rho: f64,
    #[serde(default = "default_query_report_interval")]
    pub query_report_interval: u32,
    #[serde(default = "default_max_recall")]
    pub max_recall: usize,
    #[serde(default = "default_atemporal_var_factor")]
    pub atemporal_var_factor: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            num_particles: None,
            num_samples: None,
            use_decayed_mcmc: false,
            num_moves: DEFAULT_NUM_MOVES,
            id_types: DEFAULT_ID_TYPES.to_string(),
            sampler_class: SamplerKind::default(),
            engine: EngineKind::default(),
            rho: DEFAULT_RHO,
            query_report_interval: DEFAULT_QUERY_REPORT_INTERVAL,
            max_recall: DEFAULT_MAX_RECALL,
            atemporal_var_factor: DEFAULT_ATEMPORAL_VAR_FACTOR,
            seed: None,
        }
    }
}

impl FilterConfig {
    /// Builds a configuration from string-valued options. Keys this filter
    /// does not recognize are ignored, since other components may share the
    /// same property map; a recognized key with a malformed value is an error.
    pub fn from_properties<'a, I>(properties: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = FilterConfig::default();
        for (key, value) in properties {
            match key {
                "numParticles" => config.num_particles = Some(parse_value(key, value)?),
                "numSamples" => config.num_samples = Some(parse_value(key, value)?),
                "useDecayedMCMC" => config.use_decayed_mcmc = parse_bool(key, value)?,
                "numMoves" => config.num_moves = parse_value(key, value)?,
                "idTypes" => config.id_types = value.to_string(),
                "samplerClass" => config.sampler_class = parse_value(key, value)?,
                "engine" => config.engine = parse_value(key, value)?,
                "rho" => config.rho = parse_value(key, value)?,
                "queryReportInterval" => config.query_report_interval = parse_value(key, value)?,
                "maxRecall" => config.max_recall = parse_value(key, value)?,
                "atemporalVarFactor" => config.atemporal_var_factor = parse_value(key, value)?,
                "seed" => config.seed = Some(parse_value(key, value)?),
                other => {
                    event!(
                        target: "smc_core::config",
                        Level::DEBUG,
                        key = other,
                        "ignoring unrecognized option"
                    );
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Resolved population size. `numParticles` and `numSamples` are
    /// synonyms and must agree when both are present.
    pub fn particle_count(&self) -> Result<usize, ConfigError> {
        let count = match (self.num_particles, self.num_samples) {
            (Some(num_particles), Some(num_samples)) if num_particles != num_samples => {
                return Err(ConfigError::ConflictingParticleCounts {
                    num_particles,
                    num_samples,
                });
            }
            (Some(count), _) | (None, Some(count)) => count,
            (None, None) => DEFAULT_NUM_PARTICLES,
        };
        if count == 0 {
            return Err(ConfigError::InvalidField {
                field: "numParticles",
                message: "number of particles must be greater than zero".to_string(),
            });
        }
        Ok(count)
    }

    /// Checks every option that can be checked without a model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.particle_count()?;
        if self.num_moves == 0 {
            return Err(ConfigError::InvalidField {
                field: "numMoves",
                message: "number of moves must be at least 1".to_string(),
            });
        }
        if self.query_report_interval == 0 {
            return Err(ConfigError::InvalidField {
                field: "queryReportInterval",
                message: "reporting interval must be at least 1".to_string(),
            });
        }
        if self.max_recall == 0 || self.max_recall > MAX_RECALL {
            return Err(ConfigError::InvalidField {
                field: "maxRecall",
                message: format!("maximum recall must lie in [1, {MAX_RECALL}], got {}", self.max_recall),
            });
        }
        if !(self.atemporal_var_factor.is_finite() && self.atemporal_var_factor >= 0.0) {
            return Err(ConfigError::InvalidField {
                field: "atemporalVarFactor",
                message: format!("must be a non-negative number, got {}", self.atemporal_var_factor),
            });
        }
        if !(self.rho > 0.0 && self.rho <= 1.0) {
            return Err(ConfigError::InvalidField {
                field: "rho",
                message: format!("must lie in (0, 1], got {}", self.rho),
            });
        }
        Ok(())
    }

    /// Resolves `idTypes` against the types `model` declares.
    pub fn id_type_set(&self, model: &Model) -> Result<IdTypeSet, ConfigError> {
        model
            .listed_types(&self.id_types)
            .ok_or_else(|| ConfigError::InvalidIdTypes(self.id_types.clone()))
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::Unparsable {
        key: key.to_string(),
        value: value.to_string(),
        message: err.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::Unparsable {
            key: key.to_string(),
            value: value.to_string(),
            message: "expected true or false".to_string(),
        }),
    }
}

fn default_num_moves() -> usize {
    DEFAULT_NUM_MOVES
}

fn default_id_types() -> String {
    DEFAULT_ID_TYPES.to_string()
}

fn default_rho() -> f64 {
    DEFAULT_RHO
}

fn default_query_report_interval() -> u32 {
    DEFAULT_QUERY_REPORT_INTERVAL
}

fn default_max_recall() -> usize {
    DEFAULT_MAX_RECALL
}

fn default_atemporal_var_factor() -> f64 {
    DEFAULT_ATEMPORAL_VAR_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FilterConfig::default();
        assert_eq!(config.particle_count().unwrap(), 1000);
        assert!(!config.use_decayed_mcmc);
        assert_eq!(config.num_moves, 1);
        assert_eq!(config.id_types, "none");
        assert_eq!(config.sampler_class, SamplerKind::LikelihoodWeighting);
        assert_eq!(config.rho, 0.97);
        assert_eq!(config.query_report_interval, 10);
        assert_eq!(config.max_recall, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn particle_count_synonyms_must_agree() {
        let agreeing = FilterConfig::from_properties([("numParticles", "50"), ("numSamples", "50")]);
        assert_eq!(agreeing.unwrap().particle_count().unwrap(), 50);

        let only_samples = FilterConfig::from_properties([("numSamples", "7")]).unwrap();
        assert_eq!(only_samples.particle_count().unwrap(), 7);

        let conflicting = FilterConfig::from_properties([("numParticles", "50"), ("numSamples", "60")]);
        assert_eq!(
            conflicting,
            Err(ConfigError::ConflictingParticleCounts {
                num_particles: 50,
                num_samples: 60
            })
        );
    }

    #[test]
    fn malformed_values_are_not_defaulted() {
        for (key, value) in [
            ("numParticles", "many"),
            ("numMoves", "-1"),
            ("useDecayedMCMC", "yes"),
            ("rho", "high"),
            ("samplerClass", "blog.sample.MHSampler"),
            ("engine", "gibbs"),
        ] {
            let result = FilterConfig::from_properties([(key, value)]);
            assert!(
                matches!(result, Err(ConfigError::Unparsable { .. })),
                "{key}={value} gave {result:?}"
            );
        }
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for (key, value) in [
            ("numParticles", "0"),
            ("numMoves", "0"),
            ("rho", "0"),
            ("rho", "1.01"),
            ("queryReportInterval", "0"),
            ("maxRecall", "0"),
            ("maxRecall", "1000000000"),
        ] {
            let result = FilterConfig::from_properties([(key, value)]);
            assert!(
                matches!(result, Err(ConfigError::InvalidField { .. })),
                "{key}={value} gave {result:?}"
            );
        }
    }

    #[test]
    fn property_map_selects_components() {
        let config = FilterConfig::from_properties([
            ("samplerClass", "rejection"),
            ("engine", "liu_west"),
            ("useDecayedMCMC", "TRUE"),
            ("numMoves", "3"),
            ("seed", "42"),
            ("unrelatedOption", "ignored"),
        ])
        .unwrap();
        assert_eq!(config.sampler_class, SamplerKind::Rejection);
        assert_eq!(config.engine, EngineKind::LiuWest);
        assert!(config.use_decayed_mcmc);
        assert_eq!(config.num_moves, 3);
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn yaml_uses_option_keys() {
        let yaml = "numParticles: 200\nuseDecayedMCMC: true\nsamplerClass: lw\nengine: liu_west\nrho: 0.95\n";
        let config: FilterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.particle_count().unwrap(), 200);
        assert!(config.use_decayed_mcmc);
        assert_eq!(config.sampler_class, SamplerKind::LikelihoodWeighting);
        assert_eq!(config.engine, EngineKind::LiuWest);
        assert_eq!(config.rho, 0.95);
        assert_eq!(config.max_recall, 30);

        let typo = serde_yaml::from_str::<FilterConfig>("numParticle: 200\n");
        assert!(typo.is_err());
    }
}
