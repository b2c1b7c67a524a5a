use std::fs;

use smc_bench::config::RunConfig;
use smc_bench::runner::ScenarioRunner;
use tempfile::tempdir;

fn load_config(output_dir: &std::path::Path, scenario: &str, filter: &str) -> RunConfig {
    let yaml = format!(
        r#"
run_id: "test_smoke"
scenario:
{scenario}
filter:
{filter}
filters: 2
outputs:
  jsonl: "{jsonl}"
  summary_md: "{summary}"
logging:
  enable_structured: false
"#,
        jsonl = output_dir.join("rows.jsonl").display(),
        summary = output_dir.join("summary.md").display(),
    );

    let mut cfg: RunConfig = serde_yaml::from_str(&yaml).expect("valid yaml");
    cfg.validate().expect("config validates");
    cfg
}

fn rows(path: &std::path::Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .expect("jsonl readable")
        .lines()
        .map(|line| serde_json::from_str(line).expect("row decodes to JSON"))
        .collect()
}

#[test]
fn drift_run_writes_filter_and_query_rows() {
    let dir = tempdir().expect("temp dir");
    let config = load_config(
        dir.path(),
        "  kind: drift\n  timesteps: 6\n  seed: 3\n  true_drift: 0.5",
        "  numParticles: 150\n  engine: liu_west\n  seed: 21",
    );
    let outputs = config.resolved_outputs();

    let runner = ScenarioRunner::new(config, outputs).expect("runner created");
    let summary = runner.run().expect("run completes");

    assert_eq!(summary.filters, 2);
    assert_eq!(summary.observations, 6);
    assert_eq!(summary.rows_written, 4);
    assert!(summary.telemetry_path.is_none());

    let rows = rows(&summary.jsonl_path);
    let filters: Vec<_> = rows.iter().filter(|row| row["row"] == "filter").collect();
    assert_eq!(filters.len(), 2);
    for row in &filters {
        assert_eq!(row["particles"], 150);
        assert_eq!(row["engine"], "liu_west");
        assert_eq!(row["evidence_steps"], 6);
        assert!(row["data_log_likelihood"].as_f64().expect("number").is_finite());
        assert!(row["perturbed_values"].as_u64().expect("count") > 0);
    }

    let drift = rows
        .iter()
        .find(|row| row["row"] == "query" && row["variable"] == "Drift")
        .expect("drift query row");
    assert_eq!(drift["truth"], 0.5);
    assert!(drift["mean"].as_f64().expect("mean").abs() < 3.0);

    let markdown = fs::read_to_string(&summary.summary_path).expect("summary readable");
    assert!(markdown.starts_with("# Filter Run Summary"));
    assert!(markdown.contains("| Drift |"));
}

#[test]
fn seeded_runs_are_reproducible() {
    let first = tempdir().expect("temp dir");
    let second = tempdir().expect("temp dir");
    let mut outputs = Vec::new();
    for dir in [&first, &second] {
        let config = load_config(
            dir.path(),
            "  kind: weather\n  timesteps: 5\n  seed: 9",
            "  numParticles: 80\n  useDecayedMCMC: true\n  maxRecall: 3\n  seed: 4",
        );
        let resolved = config.resolved_outputs();
        let summary = ScenarioRunner::new(config, resolved)
            .expect("runner created")
            .run()
            .expect("run completes");
        outputs.push(rows(&summary.jsonl_path));
    }

    let log_likelihoods = |rows: &[serde_json::Value]| -> Vec<f64> {
        rows.iter()
            .filter(|row| row["row"] == "filter")
            .map(|row| row["data_log_likelihood"].as_f64().expect("number"))
            .collect()
    };
    assert_eq!(log_likelihoods(&outputs[0]), log_likelihoods(&outputs[1]));
    let region = |rows: &[serde_json::Value]| {
        rows.iter()
            .find(|row| row["variable"] == "RainyRegion")
            .map(|row| row["truth"].clone())
    };
    assert_eq!(region(&outputs[0]), region(&outputs[1]));
}

#[test]
fn single_filter_weather_run_completes() {
    let dir = tempdir().expect("temp dir");
    let mut config = load_config(
        dir.path(),
        "  kind: weather\n  timesteps: 4\n  seed: 2",
        "  numParticles: 10\n  seed: 1",
    );
    config.filters = 1;
    let outputs = config.resolved_outputs();
    let runner = ScenarioRunner::new(config, outputs).expect("runner created");
    assert_eq!(runner.scenario().evidence.len(), 4);
    let summary = runner.run().expect("run completes");
    assert_eq!(summary.filters, 1);
    assert_eq!(summary.rows_written, 3);
}
