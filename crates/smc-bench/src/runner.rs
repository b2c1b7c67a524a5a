use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use smc_core::query::ValueQuery;
use smc_core::{
    EngineKind, FilterError, FilterMetrics, ParallelFilters, SamplerKind, SamplerStats,
    SharedQuery, Value,
};
use statrs::statistics::Statistics;
use thiserror::Error;
use tracing::{Level, event};

use crate::config::{ResolvedOutputs, RunConfig};
use crate::logging::{TELEMETRY_FILE, telemetry_dir};
use crate::scenario::{Scenario, ScenarioError};

/// Builds the scenario and filters described by a run configuration and
/// records what they infer.
pub struct ScenarioRunner {
    config: RunConfig,
    outputs: ResolvedOutputs,
    scenario: Scenario,
}

/// Summary details returned after a run.
#[derive(Debug)]
pub struct RunSummary {
    pub filters: usize,
    pub observations: usize,
    pub rows_written: usize,
    pub elapsed: Duration,
    pub jsonl_path: PathBuf,
    pub summary_path: PathBuf,
    pub telemetry_path: Option<PathBuf>,
}

impl ScenarioRunner {
    /// Build a runner from a validated configuration.
    pub fn new(config: RunConfig, outputs: ResolvedOutputs) -> Result<Self, RunnerError> {
        let scenario = Scenario::build(&config.scenario)?;
        Ok(Self {
            config,
            outputs,
            scenario,
        })
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Run every filter over the scenario's evidence, streaming JSONL rows
    /// to disk and writing the Markdown summary.
    pub fn run(&self) -> Result<RunSummary, RunnerError> {
        ensure_parent(self.outputs.jsonl.parent())?;
        ensure_parent(self.outputs.summary_md.parent())?;

        let mut filters = ParallelFilters::new(
            self.scenario.model.clone(),
            &self.config.filter,
            self.config.filters,
        )?;
        let queries: Vec<SharedQuery<ValueQuery>> = self
            .scenario
            .queries
            .iter()
            .map(|var| SharedQuery::new(ValueQuery::new(var.clone())))
            .collect();

        let start = Instant::now();
        let log_likelihoods = filters.run(&self.scenario.evidence, &queries)?;
        let elapsed = start.elapsed();
        event!(
            target: "smc_bench::runner",
            Level::INFO,
            run_id = %self.config.run_id,
            scenario = self.scenario.kind.key(),
            filters = filters.len(),
            elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
            "run complete"
        );

        let filter_rows: Vec<FilterRow> = filters
            .filters()
            .iter()
            .zip(&log_likelihoods)
            .enumerate()
            .map(|(index, (filter, log_likelihood))| FilterRow {
                run_id: self.config.run_id.clone(),
                scenario: self.scenario.kind.key(),
                filter_index: index,
                particles: filter.target(),
                engine: filter.config().engine,
                sampler: filter.config().sampler_class,
                data_log_likelihood: *log_likelihood,
                metrics: *filter.metrics(),
                sampler_stats: *filter.sampler_stats(),
            })
            .collect();
        let query_rows: Vec<QueryRow> = queries
            .iter()
            .map(|query| QueryRow::from_query(&self.config.run_id, &self.scenario, &query.lock()))
            .collect();

        let mut writer = BufWriter::new(File::create(&self.outputs.jsonl)?);
        let mut rows_written = 0usize;
        for row in filter_rows.iter().map(LogRow::Filter).chain(query_rows.iter().map(LogRow::Query)) {
            serde_json::to_writer(&mut writer, &row)?;
            writer.write_all(b"\n")?;
            rows_written += 1;
        }
        writer.flush()?;

        write_markdown(
            &self.outputs.summary_md,
            &self.config,
            &filter_rows,
            &query_rows,
            elapsed,
        )?;

        let telemetry_path = self
            .config
            .logging
            .enable_structured
            .then(|| telemetry_dir(&self.outputs).join(TELEMETRY_FILE));

        Ok(RunSummary {
            filters: filters.len(),
            observations: self.scenario.evidence.len(),
            rows_written,
            elapsed,
            jsonl_path: self.outputs.jsonl.clone(),
            summary_path: self.outputs.summary_md.clone(),
            telemetry_path,
        })
    }
}

fn ensure_parent(path: Option<&Path>) -> Result<(), RunnerError> {
    if let Some(dir) = path.filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(tag = "row", rename_all = "snake_case")]
enum LogRow<'a> {
    Filter(&'a FilterRow),
    Query(&'a QueryRow),
}

#[derive(Debug, Serialize)]
pub struct FilterRow {
    pub run_id: String,
    pub scenario: &'static str,
    pub filter_index: usize,
    pub particles: usize,
    pub engine: EngineKind,
    pub sampler: SamplerKind,
    pub data_log_likelihood: f64,
    #[serde(flatten)]
    pub metrics: FilterMetrics,
    pub sampler_stats: SamplerStats,
}

#[derive(Debug, Serialize)]
pub struct QueryRow {
    pub run_id: String,
    pub variable: String,
    pub mean: Option<f64>,
    pub variance: Option<f64>,
    pub mode: Option<Value>,
    pub mode_prob: Option<f64>,
    pub truth: Option<Value>,
}

impl QueryRow {
    fn from_query(run_id: &str, scenario: &Scenario, query: &ValueQuery) -> Self {
        let histogram = query.histogram();
        let mode = histogram
            .entries()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(value, _)| value.clone());
        let mode_prob = mode.as_ref().map(|value| histogram.prob(value));
        Self {
            run_id: run_id.to_string(),
            variable: query.var().to_string(),
            mean: query.mean(),
            variance: query.variance(),
            mode,
            mode_prob,
            truth: scenario.truth_for(query.var()).cloned(),
        }
    }
}

fn write_markdown(
    path: &Path,
    config: &RunConfig,
    filters: &[FilterRow],
    queries: &[QueryRow],
    elapsed: Duration,
) -> Result<(), RunnerError> {
    let mut rows = String::new();
    rows.push_str("# Filter Run Summary\n\n");
    rows.push_str(&format!(
        "Run `{}` on the {} scenario: {} timesteps, {} filter(s), {:.1} ms\n\n",
        config.run_id,
        config.scenario.kind.key(),
        config.scenario.timesteps,
        filters.len(),
        elapsed.as_secs_f64() * 1_000.0
    ));

    let log_likelihoods: Vec<f64> = filters.iter().map(|row| row.data_log_likelihood).collect();
    let mean = log_likelihoods.iter().mean();
    let spread = if log_likelihoods.len() > 1 {
        log_likelihoods.iter().std_dev()
    } else {
        0.0
    };
    rows.push_str(&format!(
        "Data log likelihood: {mean:.4} (sd {spread:.4} across filters)\n\n"
    ));

    rows.push_str("| Filter | Particles | Engine | Sampler | Log likelihood | Resamples | Copies | Moves | Accepted | Dropped | Perturbed |\n");
    rows.push_str("|--------|-----------|--------|---------|----------------|-----------|--------|-------|----------|---------|-----------|\n");
    for row in filters {
        rows.push_str(&format!(
            "| {index} | {particles} | {engine} | {sampler} | {ll:.4} | {resamples} | {copies} | {moves} | {accepted} | {dropped} | {perturbed} |\n",
            index = row.filter_index,
            particles = row.particles,
            engine = row.engine,
            sampler = row.sampler,
            ll = row.data_log_likelihood,
            resamples = row.metrics.resamples,
            copies = row.metrics.copies,
            moves = row.metrics.rejuvenation_moves,
            accepted = row.metrics.accepted_moves,
            dropped = row.metrics.particles_dropped,
            perturbed = row.metrics.perturbed_values,
        ));
    }

    rows.push_str("\n| Query | Mean | Variance | Mode | P(mode) | Truth |\n");
    rows.push_str("|-------|------|----------|------|---------|-------|\n");
    for row in queries {
        rows.push_str(&format!(
            "| {var} | {mean} | {variance} | {mode} | {prob} | {truth} |\n",
            var = row.variable,
            mean = format_opt(row.mean),
            variance = format_opt(row.variance),
            mode = row.mode.as_ref().map_or("-".to_string(), Value::to_string),
            prob = format_opt(row.mode_prob),
            truth = row.truth.as_ref().map_or("-".to_string(), Value::to_string),
        ));
    }

    fs::write(path, rows)?;
    Ok(())
}

fn format_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("failed to serialize log row: {source}")]
    Serialize {
        #[from]
        source: serde_json::Error,
    },
    #[error("scenario error: {0}")]
    Scenario(#[from] ScenarioError),
    #[error("filter configuration rejected: {0}")]
    Config(#[from] smc_core::ConfigError),
    #[error("filter failed: {0}")]
    Filter(#[from] FilterError),
}
