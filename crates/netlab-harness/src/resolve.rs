//! Command resolution: turns a group's template into one instance's
//! concrete shell command.
//!
//! Pure over the supplied state — counts, peer addresses, and discovered
//! parameters of groups declared earlier. The substitution arity is fixed
//! by the group's strategy (plus one for a `param = id` self-parameter) and
//! must match the template's `%s` placeholder count exactly.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::spec::{instance_name, ConnectStrategy, DiscoveredParam, NodeGroupSpec, SelfParam};

/// Port synthesized onto a peer address when a structured parameter
/// advertises no direct address of its own.
pub const FALLBACK_PEER_PORT: u16 = 11204;

/// Command resolution failures; fatal to the case, since a dependent that
/// cannot start leaves the run meaningless.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The connect target is not a declared group.
    #[error("connect target {0} is not declared in this case")]
    UnresolvedDependency(String),
    /// The peer exists but its address or parameter never materialized.
    #[error("peer {0} has no resolved address or parameter")]
    PeerNotReady(String),
    /// Placeholder count does not match what the strategy supplies.
    #[error("template supplies {found} placeholder(s), strategy needs {expected}")]
    TemplateArityMismatch { expected: usize, found: usize },
}

/// Read-only state resolution draws from.
pub struct ResolveInputs<'a> {
    /// Instance counts per group in this case.
    pub counts: &'a BTreeMap<String, u32>,
    /// Instance identity -> address, for every created instance.
    pub addresses: &'a BTreeMap<String, String>,
    /// Instance identity -> discovered parameter, for groups already gated
    /// through discovery.
    pub params: &'a BTreeMap<String, DiscoveredParam>,
    pub runner: u32,
}

impl ResolveInputs<'_> {
    fn address(&self, instance: &str) -> Result<&str, ResolveError> {
        self.addresses
            .get(instance)
            .map(String::as_str)
            .ok_or_else(|| ResolveError::PeerNotReady(instance.to_string()))
    }

    fn param(&self, instance: &str) -> Result<&DiscoveredParam, ResolveError> {
        self.params
            .get(instance)
            .ok_or_else(|| ResolveError::PeerNotReady(instance.to_string()))
    }
}

/// Resolve the concrete command for instance `index` of `group`.
pub fn resolve_command(
    group: &NodeGroupSpec,
    index: u32,
    inputs: &ResolveInputs,
) -> Result<String, ResolveError> {
    let mut args: Vec<String> = Vec::new();

    if group.param == Some(SelfParam::Id) {
        args.push(index.to_string());
    }

    if let Some(connect) = &group.connect {
        let count = *inputs
            .counts
            .get(&connect.node)
            .ok_or_else(|| ResolveError::UnresolvedDependency(connect.node.clone()))?;
        let peer_index = index % count;
        let peer = instance_name(&connect.node, peer_index, inputs.runner);

        match connect.strategy {
            ConnectStrategy::Plain => {
                args.push(inputs.address(&peer)?.to_string());
            }
            ConnectStrategy::PlainWithId => {
                args.push(inputs.address(&peer)?.to_string());
                args.push(peer_index.to_string());
            }
            ConnectStrategy::Params => {
                args.push(inputs.param(&peer)?.identity().to_string());
            }
            ConnectStrategy::ParamsWithDirectAddr => {
                args.push(inputs.address(&peer)?.to_string());
                args.push(inputs.param(&peer)?.identity().to_string());
            }
            ConnectStrategy::ParamsWithParsedAddrs => {
                let param = inputs.param(&peer)?;
                // Degrades to address:port when the peer advertised no
                // direct address; this leniency is load-bearing for nodes
                // that only publish an identity.
                let addr = match param.first_address() {
                    Some(a) => a.to_string(),
                    None => format!("{}:{}", inputs.address(&peer)?, FALLBACK_PEER_PORT),
                };
                let identity = param.identity().to_string();
                args.push(addr);
                args.push(identity);
            }
        }
    }

    substitute(&group.cmd, &args)
}

/// Substitute `args` into the template's `%s` placeholders, left to right.
fn substitute(template: &str, args: &[String]) -> Result<String, ResolveError> {
    let slots = template.split("%s").count() - 1;
    if slots != args.len() {
        return Err(ResolveError::TemplateArityMismatch {
            expected: args.len(),
            found: slots,
        });
    }
    let mut parts = template.split("%s");
    let mut out = parts.next().unwrap_or_default().to_string();
    for (arg, part) in args.iter().zip(parts) {
        out.push_str(arg);
        out.push_str(part);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group(value: serde_json::Value) -> NodeGroupSpec {
        serde_json::from_value(value).expect("group spec")
    }

    fn fixture() -> (
        BTreeMap<String, u32>,
        BTreeMap<String, String>,
        BTreeMap<String, DiscoveredParam>,
    ) {
        let counts = BTreeMap::from([("srv".to_string(), 1), ("cli".to_string(), 2)]);
        let addresses = BTreeMap::from([("srv_0_r0".to_string(), "10.0.0.5".to_string())]);
        let params = BTreeMap::new();
        (counts, addresses, params)
    }

    #[test]
    fn plain_substitutes_peer_address() {
        let (counts, addresses, params) = fixture();
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "cli", "count": 2, "cmd": "fetch --from %s",
            "connect": {"strategy": "plain", "node": "srv"}
        }));
        // index % count(srv) = 0 for both clients
        assert_eq!(
            resolve_command(&g, 0, &inputs).unwrap(),
            "fetch --from 10.0.0.5"
        );
        assert_eq!(
            resolve_command(&g, 1, &inputs).unwrap(),
            "fetch --from 10.0.0.5"
        );
    }

    #[test]
    fn plain_with_id_substitutes_peer_index() {
        let (counts, addresses, params) = fixture();
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "cli", "count": 2, "cmd": "fetch %s --peer-id %s",
            "connect": {"strategy": "plain_with_id", "node": "srv"}
        }));
        assert_eq!(
            resolve_command(&g, 1, &inputs).unwrap(),
            "fetch 10.0.0.5 --peer-id 0"
        );
    }

    #[test]
    fn params_uses_identity_of_structured_param() {
        let (counts, addresses, mut params) = fixture();
        params.insert(
            "srv_0_r0".to_string(),
            DiscoveredParam::Endpoint {
                identity: "abc".into(),
                addresses: vec!["1.2.3.4:9".into()],
            },
        );
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "cli", "count": 1, "cmd": "join %s",
            "connect": {"strategy": "params", "node": "srv"}
        }));
        // Never the raw structured value, only the identity.
        assert_eq!(resolve_command(&g, 0, &inputs).unwrap(), "join abc");
    }

    #[test]
    fn parsed_addrs_prefers_advertised_address() {
        let (counts, addresses, mut params) = fixture();
        params.insert(
            "srv_0_r0".to_string(),
            DiscoveredParam::Endpoint {
                identity: "abc".into(),
                addresses: vec!["192.168.4.1:7777".into(), "10.9.9.9:7777".into()],
            },
        );
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "cli", "count": 1, "cmd": "dial %s --node %s",
            "connect": {"strategy": "params_with_parsed_addrs", "node": "srv"}
        }));
        assert_eq!(
            resolve_command(&g, 0, &inputs).unwrap(),
            "dial 192.168.4.1:7777 --node abc"
        );
    }

    #[test]
    fn parsed_addrs_falls_back_to_peer_address_and_port() {
        let (counts, addresses, mut params) = fixture();
        params.insert(
            "srv_0_r0".to_string(),
            DiscoveredParam::Endpoint {
                identity: "abc".into(),
                addresses: vec![],
            },
        );
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "cli", "count": 1, "cmd": "dial %s --node %s",
            "connect": {"strategy": "params_with_parsed_addrs", "node": "srv"}
        }));
        assert_eq!(
            resolve_command(&g, 0, &inputs).unwrap(),
            "dial 10.0.0.5:11204 --node abc"
        );
    }

    #[test]
    fn unknown_target_group() {
        let (counts, addresses, params) = fixture();
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "cli", "count": 1, "cmd": "fetch %s",
            "connect": {"strategy": "plain", "node": "ghost"}
        }));
        assert_eq!(
            resolve_command(&g, 0, &inputs),
            Err(ResolveError::UnresolvedDependency("ghost".into()))
        );
    }

    #[test]
    fn missing_param_is_peer_not_ready() {
        let (counts, addresses, params) = fixture();
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "cli", "count": 1, "cmd": "join %s",
            "connect": {"strategy": "params", "node": "srv"}
        }));
        assert_eq!(
            resolve_command(&g, 0, &inputs),
            Err(ResolveError::PeerNotReady("srv_0_r0".into()))
        );
    }

    #[test]
    fn arity_mismatch_detected() {
        let (counts, addresses, params) = fixture();
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "cli", "count": 1, "cmd": "fetch %s %s",
            "connect": {"strategy": "plain", "node": "srv"}
        }));
        assert_eq!(
            resolve_command(&g, 0, &inputs),
            Err(ResolveError::TemplateArityMismatch {
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn self_param_substitutes_own_index_first() {
        let (counts, addresses, params) = fixture();
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({
            "name": "srv", "count": 2, "cmd": "serve --port-offset %s", "param": "id"
        }));
        assert_eq!(
            resolve_command(&g, 1, &inputs).unwrap(),
            "serve --port-offset 1"
        );
    }

    #[test]
    fn no_strategy_means_no_placeholders() {
        let (counts, addresses, params) = fixture();
        let inputs = ResolveInputs {
            counts: &counts,
            addresses: &addresses,
            params: &params,
            runner: 0,
        };
        let g = group(json!({"name": "srv", "count": 1, "cmd": "serve --all"}));
        assert_eq!(resolve_command(&g, 0, &inputs).unwrap(), "serve --all");
    }
}
