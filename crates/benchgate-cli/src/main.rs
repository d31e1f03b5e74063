//! benchgate - SWE-bench data point validation gate
//!
//! The `benchgate` command builds layered evaluation images, applies a
//! candidate patch and runs the instance's FAIL_TO_PASS / PASS_TO_PASS
//! test collections in an isolated container.
//!
//! ## Commands
//!
//! - `validate-file`: Validate a single data point JSON file
//! - `validate-dir`: Validate every data point file in a directory

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use benchgate_core::{classify, load_data_point, Dataset, ValidationConfig, ValidationReport};
use benchgate_engine::orchestrator::{ValidationSummary, Validator};
use benchgate_engine::runtime::{ContainerRuntime, DockerRuntime};
use benchgate_engine::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "benchgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validation gate for SWE-bench data points", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a single data point file
    ValidateFile {
        /// Path to the data point (JSON)
        path: PathBuf,

        #[command(flatten)]
        options: ValidateOptions,
    },

    /// Validate every data point file in a directory
    ValidateDir {
        /// Directory containing data point files
        dir: PathBuf,

        /// Filename pattern for data point files
        #[arg(long, default_value = "*.json")]
        pattern: String,

        /// Worker pool size for independent instances
        #[arg(long)]
        max_workers: Option<usize>,

        #[command(flatten)]
        options: ValidateOptions,
    },
}

#[derive(clap::Args)]
struct ValidateOptions {
    /// JSONL dataset of known instances; ids outside it are rejected
    #[arg(long, env = "BENCHGATE_DATASET")]
    dataset: Option<PathBuf>,

    /// Override the default test-phase timeout, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Rebuild every image layer, bypassing cache hits
    #[arg(long)]
    force_rebuild: bool,

    /// Write one JSON report per instance into this directory
    #[arg(long, env = "BENCHGATE_REPORT_DIR")]
    report_dir: Option<PathBuf>,
}

impl ValidateOptions {
    fn apply(&self, config: &mut ValidationConfig) {
        if let Some(timeout) = self.timeout {
            config.default_timeout_secs = timeout;
            config.timeout_overrides.clear();
        }
        config.force_rebuild = self.force_rebuild;
        config.report_dir = self.report_dir.clone();
    }

    fn load_dataset(&self) -> Result<Option<Dataset>> {
        match &self.dataset {
            Some(path) => {
                let dataset = Dataset::load(path)
                    .with_context(|| format!("failed to load dataset {}", path.display()))?;
                info!(instances = dataset.len(), "Dataset index loaded");
                Ok(Some(dataset))
            }
            None => Ok(None),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::ValidateFile { path, options } => cmd_validate(&[path], None, &options).await,
        Commands::ValidateDir {
            dir,
            pattern,
            max_workers,
            options,
        } => {
            let paths = collect_data_points(&dir, &pattern)
                .with_context(|| format!("failed to scan {}", dir.display()))?;
            cmd_validate(&paths, max_workers, &options).await
        }
    }
}

async fn cmd_validate(
    paths: &[PathBuf],
    max_workers: Option<usize>,
    options: &ValidateOptions,
) -> Result<ExitCode> {
    let mut config = ValidationConfig::default();
    options.apply(&mut config);
    if let Some(workers) = max_workers {
        config.max_workers = workers;
    }
    let report_dir = config.report_dir.clone();

    // Files that fail to load still get a report, so one malformed data
    // point cannot abort the rest of the batch.
    let mut schema_failures = Vec::new();
    let mut records = Vec::new();
    for path in paths {
        match load_data_point(path) {
            Ok(record) => records.push(record),
            Err(err) => {
                let instance_id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                schema_failures.push(classify(&instance_id, &[], &[], Some(&err)));
            }
        }
    }

    let mut reports = schema_failures;
    if !records.is_empty() {
        let dataset = options.load_dataset()?;
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new());
        let validator = Validator::new(config, runtime, dataset);
        reports.extend(validator.validate_all(records).await);
    }

    if let Some(dir) = &report_dir {
        write_reports(dir, &reports)?;
    }

    for report in &reports {
        print_verdict(report);
    }
    let summary = ValidationSummary::from_reports(&reports);
    let rate = if summary.total == 0 {
        100.0
    } else {
        100.0 * summary.resolved as f64 / summary.total as f64
    };
    println!("{}", "=".repeat(50));
    println!(
        "{}/{} resolved ({} unresolved, {} errored) - {rate:.1}% success",
        summary.resolved, summary.total, summary.unresolved, summary.errored
    );

    Ok(if summary.all_resolved() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_verdict(report: &ValidationReport) {
    let verdict = if report.resolved {
        "RESOLVED"
    } else {
        "UNRESOLVED"
    };
    match &report.error {
        Some(err) => println!(
            "{verdict:<10} {} [{}: {}]",
            report.instance_id, err.kind, err.message
        ),
        None => println!(
            "{verdict:<10} {} [f2p {}/{}, p2p {}/{}]",
            report.instance_id,
            report.test_results.fail_to_pass.passed,
            report.test_results.fail_to_pass.failed,
            report.test_results.pass_to_pass.passed,
            report.test_results.pass_to_pass.failed,
        ),
    }
}

/// Collect data point files matching `pattern` ("*.json" style: a single
/// leading wildcard plus a literal suffix), sorted for stable output.
fn collect_data_points(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let suffix = pattern.trim_start_matches('*');

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(suffix) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    anyhow::ensure!(
        !paths.is_empty(),
        "no files matching {pattern} in {}",
        dir.display()
    );
    Ok(paths)
}

fn write_reports(dir: &Path, reports: &[ValidationReport]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report dir {}", dir.display()))?;
    for report in reports {
        let path = dir.join(format!("{}.report.json", report.instance_id));
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    info!(reports = reports.len(), dir = %dir.display(), "Reports written");
    Ok(())
}
