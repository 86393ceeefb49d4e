//! Process supervision for one case run.
//!
//! The supervisor owns every child it spawns. Short-lived processes are
//! polled to completion against a hard ceiling, with the fault schedule
//! ticking on every poll; long-running processes are terminated at
//! teardown. Termination escalates SIGTERM -> grace window -> SIGKILL.
//!
//! Teardown is unconditional: dropping the supervisor kills anything still
//! alive, so every exit path (success, error return, panic) releases its
//! processes.

use std::collections::BTreeMap;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::actions::FaultSchedule;
use crate::logs::LogDir;
use crate::spec::ProcessKind;
use crate::topo::Topology;

/// Monitoring poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Hard ceiling on short-lived process completion.
pub const MONITOR_CEILING: Duration = Duration::from_secs(300);
/// Grace window between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Supervision timing knobs. Defaults are the production constants; tests
/// shorten them.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub ceiling: Duration,
    pub grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            ceiling: MONITOR_CEILING,
            grace: TERM_GRACE,
        }
    }
}

/// Terminal state of one short-lived process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    /// Exit code 0.
    Success,
    /// Nonzero exit; signal deaths map to `128 + signo`.
    Failed(i32),
    /// Still running at the ceiling; terminated by the supervisor.
    TimedOut,
}

/// One spawned process and how to treat it.
#[derive(Debug)]
pub struct ProcessRecord {
    pub instance: String,
    pub command: String,
    pub kind: ProcessKind,
    child: Child,
}

/// Owns the lifecycle of every spawned process for one case run.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    records: Vec<ProcessRecord>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
        }
    }

    /// Open the instance's log sink (command header included), start the
    /// command through the topology with both streams attached, and file
    /// the child under its group's process kind.
    pub fn spawn(
        &mut self,
        topo: &dyn Topology,
        logs: &LogDir,
        instance: &str,
        command: &str,
        kind: ProcessKind,
        env: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let stdout = logs
            .open_sink(instance, command)
            .with_context(|| format!("opening log sink for {instance}"))?;
        let stderr = stdout
            .try_clone()
            .with_context(|| format!("cloning log sink for {instance}"))?;
        let child = topo
            .spawn(instance, command, env, stdout, stderr)
            .with_context(|| format!("spawning {instance}: {command}"))?;
        tracing::info!(instance, kind = ?kind, pid = child.id(), "process spawned");
        self.records.push(ProcessRecord {
            instance: instance.to_string(),
            command: command.to_string(),
            kind,
            child,
        });
        Ok(())
    }

    /// Poll short-lived processes to completion, ticking the fault schedule
    /// on every iteration. Stops as soon as no short-lived process is
    /// running, or at the ceiling. Returns one outcome per short-lived
    /// process; still-running ones are terminated and reported as timed
    /// out.
    pub fn monitor(
        &mut self,
        faults: &mut FaultSchedule,
        topo: &dyn Topology,
    ) -> Vec<(String, Outcome)> {
        let start = Instant::now();
        loop {
            thread::sleep(self.config.poll_interval);
            let elapsed = start.elapsed();
            faults.tick(elapsed, topo);

            let any_running = self
                .records
                .iter_mut()
                .filter(|r| r.kind == ProcessKind::Short)
                .any(|r| matches!(r.child.try_wait(), Ok(None)));
            if !any_running || elapsed >= self.config.ceiling {
                break;
            }
        }

        let grace = self.config.grace;
        let ceiling = self.config.ceiling;
        let mut outcomes = Vec::new();
        for record in self
            .records
            .iter_mut()
            .filter(|r| r.kind == ProcessKind::Short)
        {
            let outcome = match record.child.try_wait() {
                Ok(Some(status)) => classify(status),
                Ok(None) => {
                    tracing::warn!(
                        instance = %record.instance,
                        ceiling_s = ceiling.as_secs(),
                        "process still running at ceiling, terminating"
                    );
                    terminate(&mut record.child, grace);
                    Outcome::TimedOut
                }
                Err(e) => {
                    tracing::warn!(instance = %record.instance, error = %e, "poll failed");
                    Outcome::Failed(-1)
                }
            };
            if outcome != Outcome::Success {
                tracing::warn!(instance = %record.instance, outcome = ?outcome, "process did not succeed");
            }
            outcomes.push((record.instance.clone(), outcome));
        }
        outcomes
    }

    /// Terminate everything still alive: SIGTERM to all, one shared grace
    /// window, SIGKILL for stragglers. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        let mut live: Vec<&mut ProcessRecord> = Vec::new();
        for record in self.records.iter_mut() {
            if matches!(record.child.try_wait(), Ok(None)) {
                live.push(record);
            }
        }
        if live.is_empty() {
            self.records.clear();
            return;
        }

        for record in &live {
            tracing::info!(instance = %record.instance, "terminating");
            send_sigterm(&record.child);
        }

        let deadline = Instant::now() + self.config.grace;
        loop {
            live.retain_mut(|r| matches!(r.child.try_wait(), Ok(None)));
            if live.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }

        for record in &mut live {
            tracing::warn!(instance = %record.instance, "did not exit in grace window, killing");
            let _ = record.child.kill();
            let _ = record.child.wait();
        }
        self.records.clear();
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.records.is_empty() {
            self.shutdown();
        }
    }
}

fn classify(status: ExitStatus) -> Outcome {
    match status.code() {
        Some(0) => Outcome::Success,
        Some(code) => Outcome::Failed(code),
        // Killed by a signal: report it shell-style.
        None => {
            use std::os::unix::process::ExitStatusExt;
            Outcome::Failed(128 + status.signal().unwrap_or(0))
        }
    }
}

fn send_sigterm(child: &Child) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: `child.id()` is the OS process ID of a child we own. Sending
    // SIGTERM is safe; worst case is a no-op if the process already exited
    // (kill returns -1 / ESRCH).
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL and reap.
fn terminate(child: &mut Child, grace: Duration) {
    send_sigterm(child);
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() >= deadline => break,
            Ok(None) => thread::sleep(Duration::from_millis(100)),
            Err(_) => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}
