//! Declarative model for a simulation suite.
//!
//! One JSON document describes one suite: a name plus a list of cases. Each
//! case declares node groups in dependency order — a group may only connect
//! to a group declared strictly earlier in the same case, so the dependency
//! graph is acyclic by construction.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parsers;

/// A suite: the top-level config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub name: String,
    pub cases: Vec<CaseConfig>,
}

/// One named scenario, run to completion and validated as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseConfig {
    pub name: String,
    pub nodes: Vec<NodeGroupSpec>,
}

/// A declared class of identical node instances within a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroupSpec {
    /// Group name, unique within the case.
    pub name: String,
    /// Number of instances to provision.
    pub count: u32,
    /// Shell command template with printf-style `%s` placeholders.
    pub cmd: String,
    /// Long-running processes are terminated at teardown; short-lived ones
    /// are monitored for exit status.
    #[serde(default)]
    pub process: ProcessKind,
    /// Environment overrides for this group, layered over the harness
    /// defaults (later layers win).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Self-parameter substituted before any connect arguments.
    #[serde(default)]
    pub param: Option<SelfParam>,
    /// How instances of this group wire themselves to an earlier group.
    #[serde(default)]
    pub connect: Option<ConnectSpec>,
    /// Tag of a registered parameter parser applied to this group's own
    /// logs after spawn; dependents consume the recovered parameters.
    #[serde(default)]
    pub param_parser: Option<String>,
    /// Time budget in seconds: discovery budget when `param_parser` is set,
    /// settle delay otherwise.
    #[serde(default)]
    pub wait: u64,
    /// Link shaping applied by the topology provider at instance creation.
    #[serde(default)]
    pub link: Option<LinkSpec>,
    /// Network faults fired against elapsed run time.
    #[serde(default)]
    pub actions: Vec<ScheduledAction>,
    /// Post-run log checks, validated field by field.
    #[serde(default)]
    pub integration: Option<IntegrationSpec>,
}

/// Process classification for supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// Runs until teardown terminates it.
    #[default]
    Long,
    /// Exits on completion; monitored for success/failure/timeout.
    Short,
}

/// Parameters a node receives about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelfParam {
    /// The template's first placeholder receives the instance index.
    Id,
}

/// Connection wiring for a dependent group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectSpec {
    pub strategy: ConnectStrategy,
    /// Target group; must be declared earlier in the same case. The peer
    /// instance is `index % count(target)`.
    pub node: String,
}

/// What a dependent node's command receives about its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStrategy {
    /// The peer's address.
    Plain,
    /// The peer's address and the peer index.
    PlainWithId,
    /// The peer's discovered parameter (identity only when structured).
    Params,
    /// The peer's address and its discovered parameter.
    ParamsWithDirectAddr,
    /// The peer's first discovered address (or `address:fallback-port` when
    /// none was advertised) and its identity.
    ParamsWithParsedAddrs,
}

/// Link shaping parameters, applied once at instance creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkSpec {
    #[serde(default)]
    pub loss_percent: Option<f32>,
    #[serde(default)]
    pub delay_ms: Option<u32>,
    #[serde(default)]
    pub rate_kbit: Option<u64>,
}

/// A network fault fired once when elapsed run time passes `delay_s`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAction {
    /// Seconds after case start.
    pub delay_s: f64,
    /// Target instance index within the group; `None` targets every
    /// instance.
    #[serde(default)]
    pub instance: Option<u32>,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// The closed set of network fault actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Replace the instance's default route with the gateway at this index
    /// in the provider's gateway list.
    SwitchRoute { gateway: usize },
    /// Administratively down the interface at this positional index.
    LinkDown { interface: usize },
    /// Bring the interface at this positional index back up.
    LinkUp { interface: usize },
    /// Flush and replace the address on one interface.
    ChangeIp { interface: usize, address: String },
}

/// Post-run integration checks for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationSpec {
    /// Tag of a registered integration parser.
    pub parser: String,
    /// Expected `field -> value` pairs; each mismatch becomes one failure
    /// entry.
    pub expect: BTreeMap<String, String>,
}

/// A parameter recovered from one instance's log stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveredParam {
    /// A bare token, e.g. a connection ticket.
    Token(String),
    /// A structured endpoint record.
    Endpoint {
        identity: String,
        addresses: Vec<String>,
    },
}

impl DiscoveredParam {
    /// The substitutable identity: the token itself, or the `identity`
    /// field of a structured record.
    pub fn identity(&self) -> &str {
        match self {
            DiscoveredParam::Token(t) => t,
            DiscoveredParam::Endpoint { identity, .. } => identity,
        }
    }

    /// First advertised address, if any.
    pub fn first_address(&self) -> Option<&str> {
        match self {
            DiscoveredParam::Token(_) => None,
            DiscoveredParam::Endpoint { addresses, .. } => addresses.first().map(String::as_str),
        }
    }
}

/// Render the unique identity of one instance.
///
/// The runner id disambiguates concurrent case replicas sharing one
/// physical topology namespace.
pub fn instance_name(group: &str, index: u32, runner: u32) -> String {
    format!("{group}_{index}_r{runner}")
}

/// Config validation errors, raised before any case runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("case {case}: group {group} declares count 0")]
    ZeroCount { case: String, group: String },
    #[error("case {case}: duplicate group name {group}")]
    DuplicateGroup { case: String, group: String },
    #[error("case {case}: group {group} connects to {target}, which is not declared earlier")]
    ForwardReference {
        case: String,
        group: String,
        target: String,
    },
    #[error("case {case}: group {group} names unknown param parser {tag}")]
    UnknownParamParser {
        case: String,
        group: String,
        tag: String,
    },
    #[error("case {case}: group {group} names unknown integration parser {tag}")]
    UnknownIntegrationParser {
        case: String,
        group: String,
        tag: String,
    },
    #[error("case {case}: group {group} action targets instance {index}, but count is {count}")]
    ActionTargetOutOfRange {
        case: String,
        group: String,
        index: u32,
        count: u32,
    },
    #[error("case {case}: group {group} action has invalid delay")]
    InvalidDelay { case: String, group: String },
}

impl SuiteConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for case in &self.cases {
            case.validate()?;
        }
        Ok(())
    }
}

impl CaseConfig {
    /// Check the structural invariants: positive counts, unique group
    /// names, backward-only connect references, registered parser tags,
    /// in-range action targets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut declared: BTreeSet<&str> = BTreeSet::new();
        for group in &self.nodes {
            if group.count == 0 {
                return Err(ConfigError::ZeroCount {
                    case: self.name.clone(),
                    group: group.name.clone(),
                });
            }
            if !declared.insert(group.name.as_str()) {
                return Err(ConfigError::DuplicateGroup {
                    case: self.name.clone(),
                    group: group.name.clone(),
                });
            }
            if let Some(connect) = &group.connect {
                // `declared` already contains this group, so a self-reference
                // would pass the contains check; reject it explicitly.
                if connect.node == group.name || !declared.contains(connect.node.as_str()) {
                    return Err(ConfigError::ForwardReference {
                        case: self.name.clone(),
                        group: group.name.clone(),
                        target: connect.node.clone(),
                    });
                }
            }
            if let Some(tag) = &group.param_parser {
                if parsers::param_parser(tag).is_none() {
                    return Err(ConfigError::UnknownParamParser {
                        case: self.name.clone(),
                        group: group.name.clone(),
                        tag: tag.clone(),
                    });
                }
            }
            if let Some(integration) = &group.integration {
                if parsers::integration_parser(&integration.parser).is_none() {
                    return Err(ConfigError::UnknownIntegrationParser {
                        case: self.name.clone(),
                        group: group.name.clone(),
                        tag: integration.parser.clone(),
                    });
                }
            }
            for action in &group.actions {
                if !action.delay_s.is_finite() || action.delay_s < 0.0 {
                    return Err(ConfigError::InvalidDelay {
                        case: self.name.clone(),
                        group: group.name.clone(),
                    });
                }
                if let Some(index) = action.instance {
                    if index >= group.count {
                        return Err(ConfigError::ActionTargetOutOfRange {
                            case: self.name.clone(),
                            group: group.name.clone(),
                            index,
                            count: group.count,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Instance counts per group, used by command resolution.
    pub fn group_counts(&self) -> BTreeMap<String, u32> {
        self.nodes
            .iter()
            .map(|g| (g.name.clone(), g.count))
            .collect()
    }
}
