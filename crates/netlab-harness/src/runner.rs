//! Case execution and the bounded parallel scheduler.
//!
//! One case runs end-to-end on one worker thread: provision instances,
//! spawn groups in declared order (gating on parameter discovery between
//! groups), monitor short-lived processes with fault injection ticking,
//! validate integration requirements, tear everything down. Cases are
//! chunked into batches of `max_workers`; a batch is awaited fully before
//! the next starts, bounding peak topology and disk usage.
//!
//! Teardown is invariant under success and failure: processes die in the
//! supervisor's shutdown/drop, temp directories and the topology release on
//! drop, on every exit path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tempfile::TempDir;

use crate::actions::FaultSchedule;
use crate::discovery::{DiscoveryService, POLL_INTERVAL};
use crate::failures::FailureSink;
use crate::logs::{LogDir, LogReader};
use crate::parsers;
use crate::resolve::{resolve_command, ResolveInputs};
use crate::spec::{instance_name, CaseConfig, SuiteConfig};
use crate::supervisor::{Outcome, ProcessSupervisor, SupervisorConfig};
use crate::topo::Topology;

/// Lines of each instance log dumped on eject.
pub const EJECT_TAIL_LINES: usize = 50;

/// Builds one topology per case run. Shared across worker threads.
pub type TopologyFactory = dyn Fn(&str, u32) -> anyhow::Result<Box<dyn Topology>> + Sync;

/// Batch-wide execution options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Eject on any case failure and propagate a terminal error.
    pub integration: bool,
    /// Debug log level for spawned nodes.
    pub debug: bool,
    /// Worker pool width; cases are batched in chunks of this size.
    pub max_workers: usize,
    /// Case prefixes to skip (exact match).
    pub skip: Vec<String>,
    /// Only run cases whose prefix contains this substring.
    pub filter: Option<String>,
    /// Root directory for per-instance log files.
    pub log_root: PathBuf,
    pub supervisor: SupervisorConfig,
    pub discovery_poll: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            integration: false,
            debug: false,
            max_workers: 1,
            skip: Vec::new(),
            filter: None,
            log_root: PathBuf::from("logs"),
            supervisor: SupervisorConfig::default(),
            discovery_poll: POLL_INTERVAL,
        }
    }
}

/// Run every selected case of a suite through the bounded worker pool.
///
/// A case worker's error (or panic) aborts the whole invocation once its
/// batch has been awaited — deliberate fail-fast for suite runs.
pub fn run_suite(
    suite: &SuiteConfig,
    opts: &RunOptions,
    factory: &TopologyFactory,
    sink: &FailureSink,
) -> anyhow::Result<()> {
    suite.validate()?;
    let selected = select_cases(suite, opts);
    let width = opts.max_workers.max(1);

    for chunk in selected.chunks(width) {
        thread::scope(|s| -> anyhow::Result<()> {
            let handles: Vec<_> = chunk
                .iter()
                .enumerate()
                .map(|(i, case)| {
                    let name = suite.name.as_str();
                    s.spawn(move || run_case(name, case, i as u32, opts, factory, sink))
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(result) => result?,
                    Err(_) => anyhow::bail!("case worker panicked"),
                }
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Report-only pass: skip execution, re-run the integration checks over
/// logs left by a previous run.
pub fn run_reports_only(suite: &SuiteConfig, opts: &RunOptions, sink: &FailureSink) {
    let selected = select_cases(suite, opts);
    let width = opts.max_workers.max(1);
    for chunk in selected.chunks(width) {
        for (i, case) in chunk.iter().enumerate() {
            let prefix = format!("{}__{}", suite.name, case.name);
            let logs = LogDir::new(&opts.log_root, &prefix);
            check_integration(case, i as u32, &prefix, &logs, sink);
        }
    }
}

fn select_cases<'a>(suite: &'a SuiteConfig, opts: &RunOptions) -> Vec<&'a CaseConfig> {
    suite
        .cases
        .iter()
        .filter(|case| {
            let prefix = format!("{}__{}", suite.name, case.name);
            if opts.skip.iter().any(|s| s == &prefix) {
                tracing::info!(case = %prefix, "skipping");
                return false;
            }
            if let Some(filter) = &opts.filter {
                if !prefix.contains(filter.as_str()) {
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Execute one case end-to-end on the current thread.
pub fn run_case(
    suite: &str,
    case: &CaseConfig,
    runner: u32,
    opts: &RunOptions,
    factory: &TopologyFactory,
    sink: &FailureSink,
) -> anyhow::Result<()> {
    let prefix = format!("{suite}__{}", case.name);
    case.validate()?;
    tracing::info!(case = %prefix, runner, "running case");

    let logs = LogDir::new(&opts.log_root, &prefix);
    let mut topo = factory(&prefix, runner)
        .with_context(|| format!("building topology for {prefix}"))?;

    // Provision every instance up front and collect addresses; resolution
    // may reference any earlier group's address.
    let counts = case.group_counts();
    let mut addresses: BTreeMap<String, String> = BTreeMap::new();
    for group in &case.nodes {
        for index in 0..group.count {
            let instance = instance_name(&group.name, index, runner);
            topo.create_node(&instance, group.link.as_ref())
                .with_context(|| format!("creating instance {instance}"))?;
            if let Some(address) = topo.address(&instance) {
                addresses.insert(instance, address);
            }
        }
    }

    let mut supervisor = ProcessSupervisor::new(opts.supervisor.clone());
    let mut faults = FaultSchedule::from_case(case, runner);
    let mut temp_dirs: Vec<TempDir> = Vec::new();

    let result = spawn_and_monitor(
        case,
        runner,
        &prefix,
        opts,
        topo.as_ref(),
        &logs,
        &counts,
        &addresses,
        &mut supervisor,
        &mut faults,
        &mut temp_dirs,
    );

    // Unconditional teardown: long-running processes die now; temp dirs
    // and the topology release on drop below, on every path out.
    supervisor.shutdown();

    let outcomes = match result {
        Ok(outcomes) => outcomes,
        Err(e) => {
            dump_case_logs(&logs, case, runner);
            return Err(e.context(format!("case {prefix} aborted")));
        }
    };

    for (instance, outcome) in &outcomes {
        match outcome {
            Outcome::Success => {}
            Outcome::Failed(code) => sink.record(&prefix, instance, format!("exit code {code}")),
            Outcome::TimedOut => sink.record(
                &prefix,
                instance,
                format!("timeout after {}s", opts.supervisor.ceiling.as_secs()),
            ),
        }
    }

    check_integration(case, runner, &prefix, &logs, sink);

    let failures = sink.case_failures(&prefix);
    if opts.integration && !failures.is_empty() {
        dump_case_logs(&logs, case, runner);
        anyhow::bail!("case {prefix} failed with {} error(s)", failures.len());
    }

    tracing::info!(case = %prefix, failures = failures.len(), "case finished");
    Ok(())
}

/// Spawn groups in declared order with discovery gating, then monitor.
#[allow(clippy::too_many_arguments)]
fn spawn_and_monitor(
    case: &CaseConfig,
    runner: u32,
    prefix: &str,
    opts: &RunOptions,
    topo: &dyn Topology,
    logs: &LogDir,
    counts: &BTreeMap<String, u32>,
    addresses: &BTreeMap<String, String>,
    supervisor: &mut ProcessSupervisor,
    faults: &mut FaultSchedule,
    temp_dirs: &mut Vec<TempDir>,
) -> anyhow::Result<Vec<(String, Outcome)>> {
    let mut params = BTreeMap::new();

    for group in &case.nodes {
        for index in 0..group.count {
            let instance = instance_name(&group.name, index, runner);
            let inputs = ResolveInputs {
                counts,
                addresses,
                params: &params,
                runner,
            };
            let command = resolve_command(group, index, &inputs)
                .with_context(|| format!("resolving command for {instance}"))?;

            let data_dir = tempfile::Builder::new()
                .prefix("netlab")
                .suffix(&format!("_{prefix}_{instance}"))
                .tempdir()
                .with_context(|| format!("creating data dir for {instance}"))?;
            let env = node_env(data_dir.path(), &group.env, opts.debug);
            temp_dirs.push(data_dir);

            supervisor.spawn(topo, logs, &instance, &command, group.process, &env)?;
        }

        if let Some(tag) = &group.param_parser {
            let parser = parsers::param_parser(tag)
                .with_context(|| format!("param parser {tag} disappeared after validation"))?;
            let budget = Duration::from_secs(group.wait.max(1));
            let discovery = DiscoveryService::new(logs).with_poll_interval(opts.discovery_poll);
            match discovery.discover(&group.name, group.count, runner, parser, budget) {
                Ok(found) => params.extend(found),
                Err(partial) => {
                    for instance in &partial.missing {
                        tracing::warn!(
                            instance = %instance,
                            budget_s = budget.as_secs(),
                            "no parameter discovered within budget"
                        );
                    }
                    params.extend(partial.resolved);
                }
            }
        } else if group.wait > 0 {
            thread::sleep(Duration::from_secs(group.wait));
        }
    }

    Ok(supervisor.monitor(faults, topo))
}

/// Layered node environment: harness globals, debug overrides, then the
/// group's own overrides. The child inherits the parent environment
/// underneath this overlay.
fn node_env(
    data_dir: &std::path::Path,
    group_env: &BTreeMap<String, String>,
    debug: bool,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("RUST_LOG_STYLE".to_string(), "never".to_string());
    env.insert(
        "NETLAB_DATA_DIR".to_string(),
        data_dir.display().to_string(),
    );
    if debug {
        env.insert("RUST_LOG".to_string(), "debug".to_string());
    } else if std::env::var_os("RUST_LOG").is_none() {
        env.insert("RUST_LOG".to_string(), "warn".to_string());
    }
    for (key, value) in group_env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Validate each group's integration expectations against the fields its
/// parser derives from the instance logs.
pub fn check_integration(
    case: &CaseConfig,
    runner: u32,
    prefix: &str,
    logs: &LogDir,
    sink: &FailureSink,
) {
    for group in &case.nodes {
        let Some(integration) = &group.integration else {
            continue;
        };
        let Some(parser) = parsers::integration_parser(&integration.parser) else {
            tracing::warn!(tag = %integration.parser, "unknown integration parser");
            continue;
        };
        for index in 0..group.count {
            let instance = instance_name(&group.name, index, runner);
            let actual = parser.evaluate(&logs.read_all(&instance));
            for (field, expected) in &integration.expect {
                let got = actual.get(field).map(String::as_str).unwrap_or("");
                if got != expected {
                    sink.record(
                        prefix,
                        &instance,
                        format!("{field}={got}, expected={expected}"),
                    );
                }
            }
        }
    }
}

/// Flush every instance's log tail to stderr so a fatal abort can be
/// diagnosed without re-running.
fn dump_case_logs(logs: &LogDir, case: &CaseConfig, runner: u32) {
    for group in &case.nodes {
        for index in 0..group.count {
            let instance = instance_name(&group.name, index, runner);
            let tail = logs.tail(&instance, EJECT_TAIL_LINES);
            if tail.is_empty() {
                eprintln!("── {instance}: no log output ──");
                continue;
            }
            eprintln!("── log tail: {} ──", logs.path(&instance).display());
            for line in tail {
                eprintln!("[{instance}] {line}");
            }
        }
    }
}
