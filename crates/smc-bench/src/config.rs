use serde::Deserialize;
use std::collections::BTreeMap;
use smc_core::FilterConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::Level;

const DEFAULT_TIMESTEPS: u32 = 25;
const DEFAULT_FILTERS: usize = 1;
const RUN_ID_ALLOWED: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789._-";

/// Root run configuration loaded from YAML.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RunConfig {
    pub run_id: String,
    pub scenario: ScenarioConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default = "default_filters")]
    pub filters: usize,
    pub outputs: OutputsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RunConfig {
    /// Load configuration from a YAML file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let path_buf = path.to_path_buf();
        let file = File::open(path).map_err(|source| ConfigError::Read {
            source,
            path: path_buf.clone(),
        })?;
        let reader = BufReader::new(file);
        let mut cfg: RunConfig =
            serde_yaml::from_reader(reader).map_err(|source| ConfigError::Parse {
                source,
                path: path_buf.clone(),
            })?;
        cfg.validate().map_err(|source| ConfigError::Invalid {
            path: path_buf,
            source,
        })?;
        Ok(cfg)
    }

    /// Validate the configuration without performing I/O.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        validate_run_id(&self.run_id)?;
        self.scenario.validate()?;
        self.filter.validate()?;
        if self.filters == 0 {
            return Err(ValidationError::InvalidField {
                field: "filters".to_string(),
                message: "at least one filter must run".to_string(),
            });
        }
        self.outputs.validate(&self.run_id)?;
        self.logging.normalize();
        self.logging.validate()?;
        Ok(())
    }

    /// Resolve `{run_id}` placeholders into concrete paths.
    pub fn resolved_outputs(&self) -> ResolvedOutputs {
        ResolvedOutputs {
            jsonl: resolve_template(&self.run_id, &self.outputs.jsonl),
            summary_md: resolve_template(&self.run_id, &self.outputs.summary_md),
        }
    }
}

/// Which built-in model to run and how to synthesize its observations.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScenarioConfig {
    pub kind: ScenarioKind,
    #[serde(default = "default_timesteps")]
    pub timesteps: u32,
    /// Seed for the synthetic observation stream.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Hidden parameter value for the drift scenario.
    #[serde(default)]
    pub true_drift: Option<f64>,
}

impl ScenarioConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.timesteps == 0 {
            return Err(ValidationError::InvalidField {
                field: "scenario.timesteps".to_string(),
                message: "number of timesteps must be greater than zero".to_string(),
            });
        }
        if let Some(drift) = self.true_drift {
            if self.kind != ScenarioKind::Drift {
                return Err(ValidationError::InvalidField {
                    field: "scenario.true_drift".to_string(),
                    message: "only the drift scenario has a drift parameter".to_string(),
                });
            }
            if !drift.is_finite() {
                return Err(ValidationError::InvalidField {
                    field: "scenario.true_drift".to_string(),
                    message: "drift must be finite".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn default_timesteps() -> u32 {
    DEFAULT_TIMESTEPS
}

fn default_filters() -> usize {
    DEFAULT_FILTERS
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    /// Two-state weather chain driven by a hidden region.
    Weather,
    /// Static Gaussian drift observed through noisy readings.
    Drift,
}

impl ScenarioKind {
    pub fn key(self) -> &'static str {
        match self {
            ScenarioKind::Weather => "weather",
            ScenarioKind::Drift => "drift",
        }
    }
}

/// Output artifact configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OutputsConfig {
    pub jsonl: String,
    pub summary_md: String,
}

impl OutputsConfig {
    fn validate(&self, run_id: &str) -> Result<(), ValidationError> {
        for (label, value) in [
            ("outputs.jsonl", &self.jsonl),
            ("outputs.summary_md", &self.summary_md),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::InvalidField {
                    field: label.to_string(),
                    message: "path must not be empty".to_string(),
                });
            }

            let resolved = resolve_template(run_id, value);
            if resolved.components().count() == 0 {
                return Err(ValidationError::InvalidField {
                    field: label.to_string(),
                    message: "resolved path is invalid".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Logging configuration defaults to disabled structured logs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enable_structured: bool,
    #[serde(default = "default_tracing_level")]
    pub tracing_level: String,
    /// Per-target level overrides, e.g. `smc_core::rejuvenate: trace`.
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_structured: false,
            tracing_level: default_tracing_level(),
            targets: BTreeMap::new(),
        }
    }
}

impl LoggingConfig {
    fn normalize(&mut self) {
        if self.tracing_level.trim().is_empty() {
            self.tracing_level = default_tracing_level();
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (target, level) in &self.targets {
            let valid_target = !target.is_empty()
                && target.split("::").all(|part| {
                    !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                });
            if !valid_target {
                return Err(ValidationError::InvalidField {
                    field: "logging.targets".to_string(),
                    message: format!("'{target}' is not a module path"),
                });
            }
            if parse_level(level).is_none() {
                return Err(ValidationError::InvalidField {
                    field: format!("logging.targets.{target}"),
                    message: format!("unknown level '{level}'"),
                });
            }
        }
        Ok(())
    }

    pub fn level(&self) -> Option<Level> {
        parse_level(&self.tracing_level)
    }

    /// Overrides in target order, with their parsed levels.
    pub fn target_levels(&self) -> impl Iterator<Item = (&str, Level)> {
        self.targets
            .iter()
            .filter_map(|(target, level)| parse_level(level).map(|level| (target.as_str(), level)))
    }
}

fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

fn default_tracing_level() -> String {
    "info".to_string()
}

fn validate_run_id(run_id: &str) -> Result<(), ValidationError> {
    if run_id.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field: "run_id".to_string(),
            message: "run_id must not be empty".to_string(),
        });
    }

    if !run_id.chars().all(|c| RUN_ID_ALLOWED.contains(c)) {
        return Err(ValidationError::InvalidField {
            field: "run_id".to_string(),
            message: "run_id may only contain alphanumeric characters, '.', '_' or '-'".to_string(),
        });
    }

    Ok(())
}

fn resolve_template(run_id: &str, template: &str) -> PathBuf {
    PathBuf::from(template.replace("{run_id}", run_id))
}

/// Fully resolved output paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutputs {
    pub jsonl: PathBuf,
    pub summary_md: PathBuf,
}

/// Errors surfaced when loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[error("invalid configuration in {path:?}: {source}")]
    Invalid {
        path: PathBuf,
        source: ValidationError,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path.as_path(),
        }
    }
}

/// Validation failures captured with contextual metadata.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field}: {message}")]
    InvalidField { field: String, message: String },
    #[error("filter: {0}")]
    Filter(#[from] smc_core::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use smc_core::{EngineKind, SamplerKind};

    const BASIC_YAML: &str = r#"
run_id: "drift_smoke"
scenario:
  kind: "drift"
  timesteps: 12
  seed: 7
  true_drift: 0.4
filter:
  numParticles: 250
  engine: "liu_west"
  rho: 0.95
  samplerClass: "lw"
  seed: 99
filters: 3
outputs:
  jsonl: "bench/out/{run_id}/filters.jsonl"
  summary_md: "bench/out/{run_id}/summary.md"
logging:
  enable_structured: true
  tracing_level: "debug"
"#;

    #[test]
    fn loads_and_validates_basic_config() {
        let mut cfg: RunConfig = serde_yaml::from_str(BASIC_YAML).expect("parse yaml");
        cfg.validate().expect("validate");

        assert_eq!(cfg.scenario.kind, ScenarioKind::Drift);
        assert_eq!(cfg.filter.particle_count().expect("count"), 250);
        assert_eq!(cfg.filter.engine, EngineKind::LiuWest);
        assert_eq!(cfg.filter.sampler_class, SamplerKind::LikelihoodWeighting);
        assert_eq!(cfg.filters, 3);
        assert_eq!(cfg.logging.level(), Some(Level::DEBUG));

        let outputs = cfg.resolved_outputs();
        assert_eq!(
            outputs.jsonl,
            PathBuf::from("bench/out/drift_smoke/filters.jsonl")
        );
        assert_eq!(
            outputs.summary_md,
            PathBuf::from("bench/out/drift_smoke/summary.md")
        );
    }

    #[test]
    fn defaults_fill_optional_blocks() {
        let yaml = r#"
run_id: "weather"
scenario:
  kind: "weather"
outputs:
  jsonl: "out/rows.jsonl"
  summary_md: "out/summary.md"
"#;
        let mut cfg: RunConfig = serde_yaml::from_str(yaml).expect("parse yaml");
        cfg.validate().expect("validate");
        assert_eq!(cfg.scenario.timesteps, DEFAULT_TIMESTEPS);
        assert_eq!(cfg.filters, DEFAULT_FILTERS);
        assert_eq!(cfg.filter, FilterConfig::default());
        assert!(!cfg.logging.enable_structured);
    }

    #[test]
    fn rejects_invalid_run_id() {
        let mut cfg: RunConfig = serde_yaml::from_str(BASIC_YAML).expect("parse yaml");
        cfg.run_id = "bad id".to_string();
        let err = cfg.validate().expect_err("run_id rejected");
        assert!(matches!(err, ValidationError::InvalidField { field, .. } if field == "run_id"));
    }

    #[test]
    fn rejects_drift_on_weather_scenario() {
        let mut cfg: RunConfig = serde_yaml::from_str(BASIC_YAML).expect("parse yaml");
        cfg.scenario.kind = ScenarioKind::Weather;
        let err = cfg.validate().expect_err("drift rejected");
        assert!(
            matches!(err, ValidationError::InvalidField { field, .. } if field == "scenario.true_drift")
        );
    }

    #[test]
    fn surfaces_filter_validation_errors() {
        let mut cfg: RunConfig = serde_yaml::from_str(BASIC_YAML).expect("parse yaml");
        cfg.filter.rho = 1.5;
        let err = cfg.validate().expect_err("rho rejected");
        assert!(matches!(err, ValidationError::Filter(_)));
    }

    #[test]
    fn target_overrides_are_checked() {
        let yaml = BASIC_YAML.replace(
            "  tracing_level: \"debug\"",
            "  tracing_level: \"debug\"\n  targets:\n    smc_core::rejuvenate: \"trace\"",
        );
        let mut cfg: RunConfig = serde_yaml::from_str(&yaml).expect("parse yaml");
        cfg.validate().expect("validate");
        let levels: Vec<_> = cfg.logging.target_levels().collect();
        assert_eq!(levels, vec![("smc_core::rejuvenate", Level::TRACE)]);

        cfg.logging.targets.insert("smc_core".to_string(), "loud".to_string());
        let err = cfg.validate().expect_err("level rejected");
        assert!(
            matches!(err, ValidationError::InvalidField { field, .. } if field == "logging.targets.smc_core")
        );

        cfg.logging.targets.clear();
        cfg.logging.targets.insert("smc core".to_string(), "info".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_filter_keys_fail_to_parse() {
        let yaml = BASIC_YAML.replace("rho: 0.95", "rhoo: 0.95");
        assert!(serde_yaml::from_str::<RunConfig>(&yaml).is_err());
    }
}
