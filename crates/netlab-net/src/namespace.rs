//! Linux network namespaces managed via `ip netns`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::process::{Child, Command, Output, Stdio};

/// A network namespace owned by one instance.
///
/// Created on construction with loopback up, deleted on drop. Commands can
/// be executed to completion inside the namespace, or spawned as
/// supervised children with their output attached to log sinks.
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> io::Result<Self> {
        // Clear any stale namespace left by a previous run.
        let _ = Command::new("sudo")
            .args(["ip", "netns", "del", name])
            .output();

        let output = Command::new("sudo")
            .args(["ip", "netns", "add", name])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "failed to create netns {name}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let _ = Command::new("sudo")
            .args(["ip", "netns", "exec", name, "ip", "link", "set", "lo", "up"])
            .output();

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Run a command to completion inside the namespace.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        Command::new("sudo")
            .args(["ip", "netns", "exec", &self.name, cmd])
            .args(args)
            .output()
    }

    /// Like [`exec`](Self::exec), but fail on a nonzero exit with the
    /// command's stderr in the error.
    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> io::Result<()> {
        let output = self.exec(cmd, args)?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "{cmd} {} failed in {}: {}",
                args.join(" "),
                self.name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Spawn a shell command inside the namespace with both output streams
    /// attached to the given sinks. The environment overlay is preserved
    /// across sudo (`-E`), so spawned nodes see the harness variables.
    pub fn spawn(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        stdout: File,
        stderr: File,
    ) -> io::Result<Child> {
        Command::new("sudo")
            .arg("-E")
            .args(["ip", "netns", "exec", &self.name, "sh", "-c", command])
            .envs(env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = Command::new("sudo")
            .args(["ip", "netns", "del", &self.name])
            .status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_name};

    #[test]
    fn namespace_has_loopback() {
        if !check_privileges() {
            eprintln!("skipping, insufficient privileges or missing tools");
            return;
        }

        let ns = Namespace::new(&unique_name("nlt")).expect("create netns");
        let out = ns.exec("ip", &["link"]).expect("ip link");
        assert!(String::from_utf8_lossy(&out.stdout).contains("lo"));
    }

    #[test]
    fn exec_checked_reports_failures() {
        if !check_privileges() {
            eprintln!("skipping, insufficient privileges or missing tools");
            return;
        }

        let ns = Namespace::new(&unique_name("nle")).expect("create netns");
        let err = ns
            .exec_checked("ip", &["route", "del", "default"])
            .expect_err("no default route to delete");
        assert!(err.to_string().contains(&ns.name));
    }
}
