//! Parameter discovery: polls per-instance logs until every instance of a
//! group has yielded a parameter, or the group's budget is exhausted.
//!
//! Logs are append-only, so every poll re-reads the full tail of the
//! instances still unresolved — a marker absent on one poll may appear on
//! the next. The loop is bounded by `budget / poll_interval` iterations and
//! never blocks indefinitely. Line interpretation is entirely delegated to
//! the group's [`ParamParser`].

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::logs::LogReader;
use crate::parsers::ParamParser;
use crate::spec::{instance_name, DiscoveredParam};

/// How often unresolved instances are re-polled.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Discovery ran out of budget with instances still unresolved.
///
/// Carries what *was* recovered: dependents of the resolved instances can
/// still start, and dependents of the missing ones fail with a precise
/// peer-not-ready error instead of one opaque failure here.
#[derive(Debug, Error)]
#[error("no parameter discovered for: {}", .missing.join(", "))]
pub struct PartialDiscovery {
    pub missing: Vec<String>,
    pub resolved: BTreeMap<String, DiscoveredParam>,
}

/// Orchestrates retries and timeout; owns no parsing logic.
pub struct DiscoveryService<'a> {
    reader: &'a dyn LogReader,
    poll_interval: Duration,
}

impl<'a> DiscoveryService<'a> {
    pub fn new(reader: &'a dyn LogReader) -> Self {
        Self {
            reader,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Shorten the poll interval (tests).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Recover one parameter per instance of `group`, polling until all
    /// `count` instances resolved or `budget` elapsed.
    pub fn discover(
        &self,
        group: &str,
        count: u32,
        runner: u32,
        parser: &dyn ParamParser,
        budget: Duration,
    ) -> Result<BTreeMap<String, DiscoveredParam>, PartialDiscovery> {
        let mut resolved: BTreeMap<String, DiscoveredParam> = BTreeMap::new();
        let ticks = (budget.as_secs_f64() / self.poll_interval.as_secs_f64()).ceil() as u64;

        for _ in 0..ticks.max(1) {
            thread::sleep(self.poll_interval);
            for index in 0..count {
                let instance = instance_name(group, index, runner);
                if resolved.contains_key(&instance) {
                    continue;
                }
                let lines = self.reader.read_all(&instance);
                if let Some(param) = parser.parse(&lines) {
                    tracing::debug!(instance = %instance, "parameter discovered");
                    resolved.insert(instance, param);
                }
            }
            if resolved.len() as u32 == count {
                return Ok(resolved);
            }
        }

        let missing = (0..count)
            .map(|i| instance_name(group, i, runner))
            .filter(|i| !resolved.contains_key(i))
            .collect();
        Err(PartialDiscovery { missing, resolved })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogDir;
    use crate::parsers;
    use std::io::Write;
    use std::time::Instant;

    #[test]
    fn discovers_params_already_in_log() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogDir::new(dir.path(), "t");
        for i in 0..2 {
            let mut sink = logs
                .open_sink(&format!("srv_{i}_r0"), "serve")
                .unwrap();
            writeln!(sink, "All-in-one ticket: tik{i}").unwrap();
        }

        let parser = parsers::param_parser("ticket").unwrap();
        let service = DiscoveryService::new(&logs).with_poll_interval(Duration::from_millis(10));
        let found = service
            .discover("srv", 2, 0, parser, Duration::from_millis(100))
            .unwrap();
        assert_eq!(
            found["srv_0_r0"],
            DiscoveredParam::Token("tik0".into())
        );
        assert_eq!(
            found["srv_1_r0"],
            DiscoveredParam::Token("tik1".into())
        );
    }

    #[test]
    fn picks_up_marker_appended_between_polls() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogDir::new(dir.path(), "t");
        let mut sink = logs.open_sink("srv_0_r0", "serve").unwrap();
        writeln!(sink, "starting").unwrap();

        let path = logs.path("srv_0_r0");
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
            writeln!(f, "All-in-one ticket: late").unwrap();
        });

        let parser = parsers::param_parser("ticket").unwrap();
        let service = DiscoveryService::new(&logs).with_poll_interval(Duration::from_millis(20));
        let found = service
            .discover("srv", 1, 0, parser, Duration::from_secs(2))
            .unwrap();
        writer.join().unwrap();
        assert_eq!(found["srv_0_r0"], DiscoveredParam::Token("late".into()));
    }

    #[test]
    fn timeout_names_exactly_the_missing_instances() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogDir::new(dir.path(), "t");
        // srv_0 resolves, srv_1 never emits its marker.
        let mut sink = logs.open_sink("srv_0_r0", "serve").unwrap();
        writeln!(sink, "All-in-one ticket: ok").unwrap();
        logs.open_sink("srv_1_r0", "serve").unwrap();

        let parser = parsers::param_parser("ticket").unwrap();
        let service = DiscoveryService::new(&logs).with_poll_interval(Duration::from_millis(10));
        let err = service
            .discover("srv", 2, 0, parser, Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.missing, vec!["srv_1_r0".to_string()]);
        assert_eq!(err.resolved.len(), 1);
        assert!(err.to_string().contains("srv_1_r0"));
    }

    #[test]
    fn budget_bounds_wall_time() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogDir::new(dir.path(), "t");
        logs.open_sink("srv_0_r0", "serve").unwrap();

        let parser = parsers::param_parser("ticket").unwrap();
        let service = DiscoveryService::new(&logs);

        let start = Instant::now();
        let err = service
            .discover("srv", 1, 0, parser, Duration::from_secs(2))
            .unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(err.missing, vec!["srv_0_r0".to_string()]);
        // 10 polls at 200ms: at least the budget, at most budget + a couple
        // of poll intervals of slack.
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2400), "elapsed {elapsed:?}");
    }
}
