//! Time-ordered fault injection.
//!
//! A case's scheduled actions are flattened into one list sorted by delay
//! (declaration order breaks ties) and fired against elapsed wall-clock
//! time from the supervisor's monitoring loop. Every entry fires at most
//! once; a failed action is logged and skipped — fault injection is
//! instrumentation, never a correctness-critical path.

use std::time::Duration;

use crate::spec::{instance_name, ActionKind, CaseConfig};
use crate::topo::Topology;

#[derive(Debug)]
struct Entry {
    at: Duration,
    instance: String,
    kind: ActionKind,
    fired: bool,
}

/// The flattened, delay-sorted action list for one case run.
#[derive(Debug, Default)]
pub struct FaultSchedule {
    entries: Vec<Entry>,
}

impl FaultSchedule {
    /// Flatten all groups' actions for one runner. Actions with no explicit
    /// instance target expand to one entry per instance of the group.
    pub fn from_case(case: &CaseConfig, runner: u32) -> Self {
        let mut entries = Vec::new();
        for group in &case.nodes {
            for action in &group.actions {
                let targets: Vec<u32> = match action.instance {
                    Some(index) => vec![index],
                    None => (0..group.count).collect(),
                };
                for index in targets {
                    entries.push(Entry {
                        at: Duration::from_secs_f64(action.delay_s.max(0.0)),
                        instance: instance_name(&group.name, index, runner),
                        kind: action.kind.clone(),
                        fired: false,
                    });
                }
            }
        }
        // Stable sort: equal delays keep declaration order.
        entries.sort_by(|a, b| a.at.cmp(&b.at));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Actions not yet fired.
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| !e.fired).count()
    }

    /// Fire every due, not-yet-fired action. Called on each supervisor poll
    /// tick; the fired flag makes repeated ticks past the same deadline
    /// idempotent.
    pub fn tick(&mut self, elapsed: Duration, topo: &dyn Topology) {
        for entry in &mut self.entries {
            if entry.fired || entry.at > elapsed {
                continue;
            }
            entry.fired = true;
            tracing::info!(
                instance = %entry.instance,
                kind = ?entry.kind,
                at_s = entry.at.as_secs_f64(),
                "firing network action"
            );
            if let Err(e) = topo.apply_fault(&entry.instance, &entry.kind) {
                tracing::warn!(
                    instance = %entry.instance,
                    error = %e,
                    "network action failed, skipping"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::LinkSpec;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::io;
    use std::process::Child;

    /// Records every fault application; optionally fails them all.
    struct Recorder {
        fired: RefCell<Vec<(String, ActionKind)>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Self {
            Self {
                fired: RefCell::new(Vec::new()),
                fail,
            }
        }
    }

    impl Topology for Recorder {
        fn create_node(&mut self, _: &str, _: Option<&LinkSpec>) -> anyhow::Result<()> {
            Ok(())
        }
        fn address(&self, _: &str) -> Option<String> {
            None
        }
        fn spawn(
            &self,
            _: &str,
            _: &str,
            _: &BTreeMap<String, String>,
            _: File,
            _: File,
        ) -> io::Result<Child> {
            Err(io::Error::other("not used"))
        }
        fn apply_fault(&self, instance: &str, kind: &ActionKind) -> anyhow::Result<()> {
            self.fired
                .borrow_mut()
                .push((instance.to_string(), kind.clone()));
            if self.fail {
                anyhow::bail!("interface index out of range");
            }
            Ok(())
        }
    }

    fn case(value: serde_json::Value) -> CaseConfig {
        serde_json::from_value(value).expect("case config")
    }

    #[test]
    fn fires_exactly_once_across_many_ticks() {
        let c = case(serde_json::json!({
            "name": "t",
            "nodes": [{
                "name": "n", "count": 1, "cmd": "run",
                "actions": [{"delay_s": 5.0, "instance": 0, "kind": "link_down", "interface": 0}]
            }]
        }));
        let mut schedule = FaultSchedule::from_case(&c, 0);
        let topo = Recorder::new(false);

        for tick in 0..30 {
            schedule.tick(Duration::from_millis(200 * (tick + 1) + 5000), &topo);
        }
        assert_eq!(topo.fired.borrow().len(), 1);
        assert_eq!(schedule.pending(), 0);
    }

    #[test]
    fn does_not_fire_before_delay() {
        let c = case(serde_json::json!({
            "name": "t",
            "nodes": [{
                "name": "n", "count": 1, "cmd": "run",
                "actions": [{"delay_s": 5.0, "kind": "link_up", "interface": 0}]
            }]
        }));
        let mut schedule = FaultSchedule::from_case(&c, 0);
        let topo = Recorder::new(false);
        schedule.tick(Duration::from_secs(4), &topo);
        assert!(topo.fired.borrow().is_empty());
        assert_eq!(schedule.pending(), 1);
    }

    #[test]
    fn ties_fire_in_declaration_order() {
        let c = case(serde_json::json!({
            "name": "t",
            "nodes": [{
                "name": "n", "count": 1, "cmd": "run",
                "actions": [
                    {"delay_s": 1.0, "kind": "link_down", "interface": 0},
                    {"delay_s": 1.0, "kind": "link_up", "interface": 0},
                    {"delay_s": 0.5, "kind": "switch_route", "gateway": 1}
                ]
            }]
        }));
        let mut schedule = FaultSchedule::from_case(&c, 0);
        let topo = Recorder::new(false);
        schedule.tick(Duration::from_secs(2), &topo);

        let fired = topo.fired.borrow();
        assert_eq!(fired[0].1, ActionKind::SwitchRoute { gateway: 1 });
        assert_eq!(fired[1].1, ActionKind::LinkDown { interface: 0 });
        assert_eq!(fired[2].1, ActionKind::LinkUp { interface: 0 });
    }

    #[test]
    fn wildcard_instance_expands_to_all() {
        let c = case(serde_json::json!({
            "name": "t",
            "nodes": [{
                "name": "n", "count": 3, "cmd": "run",
                "actions": [{"delay_s": 0.0, "kind": "link_down", "interface": 0}]
            }]
        }));
        let mut schedule = FaultSchedule::from_case(&c, 1);
        let topo = Recorder::new(false);
        schedule.tick(Duration::from_millis(1), &topo);

        let fired = topo.fired.borrow();
        let instances: Vec<&str> = fired.iter().map(|(i, _)| i.as_str()).collect();
        assert_eq!(instances, vec!["n_0_r1", "n_1_r1", "n_2_r1"]);
    }

    #[test]
    fn failed_action_is_skipped_not_retried() {
        let c = case(serde_json::json!({
            "name": "t",
            "nodes": [{
                "name": "n", "count": 1, "cmd": "run",
                "actions": [{"delay_s": 0.0, "kind": "change_ip", "interface": 9, "address": "10.0.0.9/24"}]
            }]
        }));
        let mut schedule = FaultSchedule::from_case(&c, 0);
        let topo = Recorder::new(true);
        schedule.tick(Duration::from_secs(1), &topo);
        schedule.tick(Duration::from_secs(2), &topo);

        // One attempt, no retry after failure.
        assert_eq!(topo.fired.borrow().len(), 1);
        assert_eq!(schedule.pending(), 0);
    }
}
