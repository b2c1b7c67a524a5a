//! Structured telemetry for bench runs.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{Level, event};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LoggingConfig, ResolvedOutputs, RunConfig};

pub const TELEMETRY_FILE: &str = "telemetry.jsonl";

/// Crates whose events follow the configured level; everything else is
/// held at `warn`.
const OWN_TARGETS: [&str; 2] = ["smc_core", "smc_bench"];

/// Keeps the background writer alive; dropping it flushes the log.
pub struct LoggingGuard {
    _guard: WorkerGuard,
    pub telemetry_path: PathBuf,
}

/// Directory that holds the summary, and therefore the telemetry log.
pub fn telemetry_dir(outputs: &ResolvedOutputs) -> PathBuf {
    outputs
        .summary_md
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `EnvFilter` directives for a logging block: the base level applies to
/// the smc crates, then per-target overrides are appended.
pub fn filter_directives(logging: &LoggingConfig) -> String {
    let level = logging.level().unwrap_or(Level::INFO);
    let mut directives = vec![Level::WARN.as_str().to_ascii_lowercase()];
    directives.extend(
        OWN_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.as_str().to_ascii_lowercase())),
    );
    directives.extend(
        logging
            .target_levels()
            .map(|(target, level)| format!("{target}={}", level.as_str().to_ascii_lowercase())),
    );
    directives.join(",")
}

/// Installs a JSON subscriber writing to `telemetry.jsonl` next to the
/// summary and records the run's filter settings as the first event.
/// `RUST_LOG` takes precedence over the configured directives. Returns
/// `None` when structured logging is disabled.
pub fn init_logging(config: &RunConfig, outputs: &ResolvedOutputs) -> Result<Option<LoggingGuard>> {
    if !config.logging.enable_structured {
        return Ok(None);
    }

    let dir = telemetry_dir(outputs);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating telemetry directory at {}", dir.display()))?;
    let telemetry_path = dir.join(TELEMETRY_FILE);
    let file = File::create(&telemetry_path)
        .with_context(|| format!("creating telemetry file at {}", telemetry_path.display()))?;
    let (writer, guard) = NonBlockingBuilder::default().lossy(false).finish(file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.logging)));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_events(FmtSpan::NONE)
        .with_writer(writer)
        .finish();
    // Tests may already have installed a subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);

    event!(
        target: "smc_bench::runner",
        Level::INFO,
        run_id = %config.run_id,
        scenario = config.scenario.kind.key(),
        engine = %config.filter.engine,
        sampler = %config.filter.sampler_class,
        filters = config.filters,
        decayed_mcmc = config.filter.use_decayed_mcmc,
        "telemetry started"
    );

    Ok(Some(LoggingGuard {
        _guard: guard,
        telemetry_path,
    }))
}
