//! netlab — drives multi-process network simulations.
//!
//! Takes one JSON suite file (or a directory scanned recursively for
//! `*.json`), runs each suite's cases through the bounded worker pool, and
//! flushes the failure summary at the end. In `--integration` mode any case
//! failure ejects with diagnostics and a nonzero exit.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netlab_harness::failures::FailureSink;
use netlab_harness::runner::{self, RunOptions, TopologyFactory};
use netlab_harness::spec::SuiteConfig;
use netlab_harness::topo::{LoopbackTopology, Topology};
use netlab_net::star::StarTopology;

/// Multi-process network simulation driver.
#[derive(Parser, Debug)]
#[command(name = "netlab", about = "Drive multi-process network simulations")]
struct Cli {
    /// Suite config file, or a directory scanned recursively for *.json.
    cfg: PathBuf,

    /// Skip execution; re-run integration checks over existing logs.
    #[arg(long)]
    report_only: bool,

    /// Integration mode: eject on any case failure and exit nonzero.
    #[arg(long)]
    integration: bool,

    /// Comma-separated case prefixes to skip.
    #[arg(long)]
    skip: Option<String>,

    /// Only run cases whose prefix contains this substring.
    #[arg(long)]
    filter: Option<String>,

    /// Debug log level for spawned nodes.
    #[arg(long)]
    debug: bool,

    /// Max concurrent cases per batch.
    #[arg(long, default_value_t = 1)]
    max_workers: usize,

    /// Run on the loopback interface instead of network namespaces.
    #[arg(long)]
    local: bool,

    /// Directory for per-instance log files.
    #[arg(long, default_value = "logs")]
    logs: PathBuf,

    /// Directory for the failure summary artifact.
    #[arg(long, default_value = "report")]
    reports: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let paths = collect_configs(&cli.cfg)?;
    if paths.is_empty() {
        anyhow::bail!("no suite configs found under {}", cli.cfg.display());
    }

    let opts = RunOptions {
        integration: cli.integration,
        debug: cli.debug,
        max_workers: cli.max_workers,
        skip: cli
            .skip
            .as_deref()
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        filter: cli.filter.clone(),
        log_root: cli.logs.clone(),
        ..Default::default()
    };

    let factory: Box<TopologyFactory> = if cli.local {
        Box::new(|_prefix, _runner| Ok(Box::new(LoopbackTopology::new()) as Box<dyn Topology>))
    } else {
        Box::new(|_prefix, _runner| Ok(Box::new(StarTopology::new()?) as Box<dyn Topology>))
    };

    let sink = FailureSink::new();
    let mut result = Ok(());
    for path in paths {
        let suite = load_suite(&path)?;
        tracing::info!(suite = %suite.name, path = %path.display(), "starting suite");
        if cli.report_only {
            runner::run_reports_only(&suite, &opts, &sink);
            continue;
        }
        result = runner::run_suite(&suite, &opts, factory.as_ref(), &sink);
        if result.is_err() {
            break;
        }
    }

    // Flush everything recorded so far, even when a batch aborted.
    let summary = cli.reports.join("failures.json");
    sink.write_summary(&summary)
        .with_context(|| format!("writing {}", summary.display()))?;
    if !sink.is_empty() {
        tracing::warn!(
            failures = sink.len(),
            summary = %summary.display(),
            "completed with recorded failures"
        );
    }
    result
}

fn load_suite(path: &Path) -> anyhow::Result<SuiteConfig> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let suite: SuiteConfig =
        serde_json::from_reader(file).with_context(|| format!("parsing {}", path.display()))?;
    Ok(suite)
}

/// A single file, or every `*.json` under a directory (recursive, sorted
/// for a stable run order).
fn collect_configs(cfg: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if cfg.is_file() {
        return Ok(vec![cfg.to_path_buf()]);
    }
    let mut found = Vec::new();
    let mut stack = vec![cfg.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "json") {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}
