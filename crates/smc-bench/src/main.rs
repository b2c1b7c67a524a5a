use std::path::PathBuf;

use clap::Parser;

use smc_bench::config::{ResolvedOutputs, RunConfig};
use smc_bench::logging::init_logging;
use smc_bench::runner::ScenarioRunner;
use smc_core::{EngineKind, EngineInfo, SamplerKind};

/// Runs particle filters over synthetic evidence streams.
#[derive(Debug, Parser)]
#[command(
    name = "smc-bench",
    author,
    version,
    about = "Seeded particle filter runs over built-in scenarios"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "bench/drift.yaml")]
    config: PathBuf,

    /// Override the run identifier (substitutes {run_id} templates).
    #[arg(long, value_name = "RUN_ID")]
    run_id: Option<String>,

    /// Override the number of particles per filter.
    #[arg(long, value_name = "COUNT")]
    particles: Option<usize>,

    /// Override the filter seed.
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Override the number of independent filters.
    #[arg(long, value_name = "COUNT")]
    filters: Option<usize>,

    /// Override the number of timesteps in the evidence stream.
    #[arg(long, value_name = "STEPS")]
    timesteps: Option<u32>,

    /// Override the inference engine (`particle_filter` or `liu_west`).
    #[arg(long, value_name = "ENGINE")]
    engine: Option<EngineKind>,

    /// Override the sampler (`lw` or `rejection`).
    #[arg(long, value_name = "SAMPLER")]
    sampler: Option<SamplerKind>,

    /// Exit after validating the configuration (no filter is run).
    #[arg(long)]
    validate_only: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RunConfig::from_path(&cli.config)?;

    if let Some(run_id) = cli.run_id {
        config.run_id = run_id;
    }

    if let Some(particles) = cli.particles {
        config.filter.num_particles = Some(particles);
        config.filter.num_samples = None;
    }

    if let Some(seed) = cli.seed {
        config.filter.seed = Some(seed);
    }

    if let Some(filters) = cli.filters {
        config.filters = filters;
    }

    if let Some(timesteps) = cli.timesteps {
        config.scenario.timesteps = timesteps;
    }

    if let Some(engine) = cli.engine {
        config.filter.engine = engine;
    }

    if let Some(sampler) = cli.sampler {
        config.filter.sampler_class = sampler;
    }

    config.validate()?;

    let outputs: ResolvedOutputs = config.resolved_outputs();
    let run_id = config.run_id.clone();
    let filters = config.filters;
    println!(
        "Loaded configuration '{run_id}' for {} {} ({} scenario, {} timesteps, {filters} filter{})",
        EngineInfo::name(),
        EngineInfo::version(),
        config.scenario.kind.key(),
        config.scenario.timesteps,
        if filters == 1 { "" } else { "s" }
    );

    let _logging_guard = init_logging(&config, &outputs)?;
    let runner = ScenarioRunner::new(config, outputs)?;

    if cli.validate_only {
        println!("Validation-only mode: filters not run.");
        return Ok(());
    }

    let summary = runner.run()?;
    println!(
        "Run complete for '{run_id}': {} observations × {} filters → {} rows at {} ({:.1} ms)",
        summary.observations,
        summary.filters,
        summary.rows_written,
        summary.jsonl_path.display(),
        summary.elapsed.as_secs_f64() * 1_000.0
    );
    println!("Summary table: {}", summary.summary_path.display());
    if let Some(telemetry_path) = summary.telemetry_path.as_ref() {
        println!("Telemetry log: {}", telemetry_path.display());
    }

    Ok(())
}
