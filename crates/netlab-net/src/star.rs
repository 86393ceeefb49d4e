//! Star topology: every instance's namespace hangs off one host bridge.
//!
//! The bridge carries two gateway addresses so `switch_route` faults have a
//! real alternative to move the default route to. Each instance gets a veth
//! pair — host side enslaved to the bridge, peer side inside the
//! namespace — and one address from the topology's /24.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, Context};

use netlab_harness::spec::{ActionKind, LinkSpec};
use netlab_harness::topo::Topology;

use crate::namespace::Namespace;
use crate::shaping;

/// Distinguishes concurrently live topologies inside one harness process;
/// feeds resource names and subnet selection.
static NET_COUNTER: AtomicU32 = AtomicU32::new(0);

/// First host octet handed to instances; .1 and .2 are the gateways.
const FIRST_HOST_OCTET: u32 = 10;
const MAX_NODES: usize = 244;

struct NodeSlot {
    ns: Namespace,
    /// Interfaces by positional index, as faults address them.
    ifaces: Vec<String>,
    address: String,
}

impl NodeSlot {
    fn iface(&self, index: usize) -> anyhow::Result<&str> {
        self.ifaces
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("interface index {index} out of range"))
    }
}

/// Namespace-backed star network for one case run.
pub struct StarTopology {
    uid: String,
    bridge: String,
    subnet: u8,
    gateways: Vec<String>,
    nodes: BTreeMap<String, NodeSlot>,
}

impl StarTopology {
    /// Create the bridge and gateway addresses. Resource names and the
    /// subnet are unique among topologies of this process, so concurrent
    /// cases do not collide.
    pub fn new() -> anyhow::Result<Self> {
        let seq = NET_COUNTER.fetch_add(1, Ordering::Relaxed);
        let uid = format!("{:x}x{}", std::process::id() % 0xFFF, seq);
        let bridge = clamp_ifname(&format!("nlb{uid}"));
        let subnet = (16 + seq % 200) as u8;
        let gateways = vec![format!("10.67.{subnet}.1"), format!("10.67.{subnet}.2")];

        // Clear a stale bridge from an aborted earlier run.
        let _ = Command::new("sudo")
            .args(["ip", "link", "del", &bridge])
            .output();

        host_exec(&["ip", "link", "add", &bridge, "type", "bridge"])
            .context("creating bridge")?;
        for gateway in &gateways {
            host_exec(&["ip", "addr", "add", &format!("{gateway}/24"), "dev", &bridge])
                .context("assigning gateway address")?;
        }
        host_exec(&["ip", "link", "set", &bridge, "up"]).context("bringing bridge up")?;

        tracing::debug!(bridge = %bridge, subnet, "star topology created");
        Ok(Self {
            uid,
            bridge,
            subnet,
            gateways,
            nodes: BTreeMap::new(),
        })
    }

    pub fn gateways(&self) -> &[String] {
        &self.gateways
    }
}

impl Topology for StarTopology {
    fn create_node(&mut self, instance: &str, link: Option<&LinkSpec>) -> anyhow::Result<()> {
        let idx = self.nodes.len();
        if idx >= MAX_NODES {
            anyhow::bail!("subnet exhausted: more than {MAX_NODES} instances");
        }

        let ns_name = clamp_ifname(&format!("nl{}n{idx}", self.uid));
        let veth_host = clamp_ifname(&format!("nlh{}x{idx}", self.uid));
        let veth_ns = clamp_ifname(&format!("nle{}x{idx}", self.uid));

        let ns = Namespace::new(&ns_name)
            .with_context(|| format!("creating namespace for {instance}"))?;

        let _ = Command::new("sudo")
            .args(["ip", "link", "del", &veth_host])
            .output();
        host_exec(&[
            "ip", "link", "add", &veth_host, "type", "veth", "peer", "name", &veth_ns,
        ])
        .with_context(|| format!("creating veth pair for {instance}"))?;
        host_exec(&["ip", "link", "set", &veth_host, "master", &self.bridge])?;
        host_exec(&["ip", "link", "set", &veth_host, "up"])?;
        host_exec(&["ip", "link", "set", &veth_ns, "netns", &ns.name])?;

        let address = format!("10.67.{}.{}", self.subnet, FIRST_HOST_OCTET + idx as u32);
        ns.exec_checked("ip", &["addr", "add", &format!("{address}/24"), "dev", &veth_ns])?;
        ns.exec_checked("ip", &["link", "set", &veth_ns, "up"])?;
        ns.exec_checked(
            "ip",
            &["route", "replace", "default", "via", &self.gateways[0]],
        )?;

        if let Some(spec) = link {
            shaping::apply_link_shaping(&ns, &veth_ns, spec)
                .with_context(|| format!("shaping link of {instance}"))?;
        }

        tracing::debug!(instance, ns = %ns.name, address = %address, "instance provisioned");
        self.nodes.insert(
            instance.to_string(),
            NodeSlot {
                ns,
                ifaces: vec![veth_ns],
                address,
            },
        );
        Ok(())
    }

    fn address(&self, instance: &str) -> Option<String> {
        self.nodes.get(instance).map(|n| n.address.clone())
    }

    fn spawn(
        &self,
        instance: &str,
        command: &str,
        env: &BTreeMap<String, String>,
        stdout: File,
        stderr: File,
    ) -> io::Result<Child> {
        let node = self
            .nodes
            .get(instance)
            .ok_or_else(|| io::Error::other(format!("unknown instance {instance}")))?;
        node.ns.spawn(command, env, stdout, stderr)
    }

    fn apply_fault(&self, instance: &str, kind: &ActionKind) -> anyhow::Result<()> {
        let node = self
            .nodes
            .get(instance)
            .ok_or_else(|| anyhow!("unknown instance {instance}"))?;
        match kind {
            ActionKind::SwitchRoute { gateway } => {
                let via = self
                    .gateways
                    .get(*gateway)
                    .ok_or_else(|| anyhow!("gateway index {gateway} out of range"))?;
                node.ns
                    .exec_checked("ip", &["route", "replace", "default", "via", via])?;
            }
            ActionKind::LinkDown { interface } => {
                let iface = node.iface(*interface)?;
                node.ns.exec_checked("ip", &["link", "set", iface, "down"])?;
            }
            ActionKind::LinkUp { interface } => {
                let iface = node.iface(*interface)?;
                node.ns.exec_checked("ip", &["link", "set", iface, "up"])?;
            }
            ActionKind::ChangeIp { interface, address } => {
                let iface = node.iface(*interface)?;
                node.ns.exec_checked("ip", &["addr", "flush", "dev", iface])?;
                node.ns.exec_checked("ip", &["addr", "add", address, "dev", iface])?;
            }
        }
        Ok(())
    }
}

impl Drop for StarTopology {
    fn drop(&mut self) {
        // Namespaces (and their veth peers) go first, then the bridge.
        self.nodes.clear();
        let _ = Command::new("sudo")
            .args(["ip", "link", "del", &self.bridge])
            .status();
    }
}

/// Run a host-side command via sudo, failing on nonzero exit.
fn host_exec(args: &[&str]) -> io::Result<()> {
    let output = Command::new("sudo").args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// Truncate to the 15-character Linux interface name limit.
fn clamp_ifname(name: &str) -> String {
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::check_privileges;

    #[test]
    fn nodes_get_distinct_addresses_and_connectivity() {
        if !check_privileges() {
            eprintln!("skipping, insufficient privileges or missing tools");
            return;
        }

        let mut topo = StarTopology::new().expect("create topology");
        topo.create_node("a_0_r0", None).expect("node a");
        topo.create_node("b_0_r0", None).expect("node b");

        let addr_a = topo.address("a_0_r0").expect("address a");
        let addr_b = topo.address("b_0_r0").expect("address b");
        assert_ne!(addr_a, addr_b);

        let node = topo.nodes.get("a_0_r0").unwrap();
        let out = node
            .ns
            .exec("ping", &["-c", "1", "-W", "1", &addr_b])
            .expect("ping");
        assert!(
            out.status.success(),
            "ping failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    #[test]
    fn link_down_cuts_connectivity() {
        if !check_privileges() {
            eprintln!("skipping, insufficient privileges or missing tools");
            return;
        }

        let mut topo = StarTopology::new().expect("create topology");
        topo.create_node("a_0_r0", None).expect("node a");
        topo.create_node("b_0_r0", None).expect("node b");
        let addr_b = topo.address("b_0_r0").expect("address b");

        topo.apply_fault("a_0_r0", &ActionKind::LinkDown { interface: 0 })
            .expect("link down");
        let node = topo.nodes.get("a_0_r0").unwrap();
        let out = node
            .ns
            .exec("ping", &["-c", "1", "-W", "1", &addr_b])
            .expect("ping");
        assert!(!out.status.success(), "ping should fail with link down");

        topo.apply_fault("a_0_r0", &ActionKind::LinkUp { interface: 0 })
            .expect("link up");
    }

    #[test]
    fn out_of_range_fault_indices_error() {
        if !check_privileges() {
            eprintln!("skipping, insufficient privileges or missing tools");
            return;
        }

        let mut topo = StarTopology::new().expect("create topology");
        topo.create_node("a_0_r0", None).expect("node a");

        let err = topo
            .apply_fault("a_0_r0", &ActionKind::SwitchRoute { gateway: 7 })
            .expect_err("bad gateway index");
        assert!(err.to_string().contains("out of range"));

        let err = topo
            .apply_fault("a_0_r0", &ActionKind::LinkDown { interface: 4 })
            .expect_err("bad interface index");
        assert!(err.to_string().contains("out of range"));
    }
}
