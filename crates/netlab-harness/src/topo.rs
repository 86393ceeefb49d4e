//! The topology capability the engine consumes.
//!
//! A provider owns node placement: it creates one slot per instance, hands
//! out addresses, executes shell commands "on" a node, and applies network
//! faults. The engine never talks to the network stack directly.
//!
//! [`LoopbackTopology`] runs everything on the host for local development
//! and tests; the namespace-backed provider lives in `netlab-net`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::process::{Child, Command, Stdio};

use crate::spec::{ActionKind, LinkSpec};

/// Capability contract between the engine and a network provider.
///
/// Instances are keyed by their identity string (`group_index_runner`); a
/// provider is owned by exactly one case run, so no internal locking is
/// required.
pub trait Topology {
    /// Provision the slot for one instance, applying link shaping if the
    /// provider supports it.
    fn create_node(&mut self, instance: &str, link: Option<&LinkSpec>) -> anyhow::Result<()>;

    /// The instance's address, once created.
    fn address(&self, instance: &str) -> Option<String>;

    /// Start `command` on the instance with both output streams attached to
    /// the given sinks. `env` contains only the harness overlay; the
    /// child inherits the parent environment underneath it.
    fn spawn(
        &self,
        instance: &str,
        command: &str,
        env: &BTreeMap<String, String>,
        stdout: File,
        stderr: File,
    ) -> io::Result<Child>;

    /// Apply one fault action to the instance. Best-effort: errors are
    /// reported to the caller, which logs and continues.
    fn apply_fault(&self, instance: &str, kind: &ActionKind) -> anyhow::Result<()>;
}

/// Host-local provider: every instance is a plain process on the loopback
/// interface. Faults are accepted and ignored, which keeps fault-carrying
/// cases runnable (if meaningless) in local mode.
#[derive(Debug, Default)]
pub struct LoopbackTopology {
    nodes: Vec<String>,
}

impl LoopbackTopology {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Topology for LoopbackTopology {
    fn create_node(&mut self, instance: &str, link: Option<&LinkSpec>) -> anyhow::Result<()> {
        if link.is_some() {
            tracing::debug!(instance, "loopback provider ignores link shaping");
        }
        self.nodes.push(instance.to_string());
        Ok(())
    }

    fn address(&self, instance: &str) -> Option<String> {
        self.nodes
            .iter()
            .any(|n| n == instance)
            .then(|| "127.0.0.1".to_string())
    }

    fn spawn(
        &self,
        _instance: &str,
        command: &str,
        env: &BTreeMap<String, String>,
        stdout: File,
        stderr: File,
    ) -> io::Result<Child> {
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    }

    fn apply_fault(&self, instance: &str, kind: &ActionKind) -> anyhow::Result<()> {
        tracing::debug!(instance, kind = ?kind, "loopback provider ignores fault");
        Ok(())
    }
}
