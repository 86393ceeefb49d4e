//! Pluggable log parsers.
//!
//! Two registries, both keyed by the tag a group names in its config:
//!
//! - [`ParamParser`] recovers a [`DiscoveredParam`] from a node's own log so
//!   dependent groups can wire themselves to it.
//! - [`IntegrationParser`] derives `field -> value` pairs from a node's log
//!   for post-run requirement checks.
//!
//! The log line formats here are the integration surface with the spawned
//! binaries; the discovery service itself never interprets lines.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::spec::DiscoveredParam;

/// Recovers at most one parameter from a log tail. Called repeatedly on the
/// growing tail until it yields, so `parse` must be pure over its input.
pub trait ParamParser: Sync {
    fn parse(&self, lines: &[String]) -> Option<DiscoveredParam>;
}

/// Derives named fields from a finished instance log.
pub trait IntegrationParser: Sync {
    fn evaluate(&self, lines: &[String]) -> BTreeMap<String, String>;
}

/// Look up a param parser by tag.
pub fn param_parser(tag: &str) -> Option<&'static dyn ParamParser> {
    match tag {
        "ticket" => Some(&TicketParser),
        "endpoint_json" => Some(&EndpointJsonParser),
        _ => None,
    }
}

/// Look up an integration parser by tag.
pub fn integration_parser(tag: &str) -> Option<&'static dyn IntegrationParser> {
    match tag {
        "transfer_markers" => Some(&TransferMarkers),
        _ => None,
    }
}

// ── Param parsers ───────────────────────────────────────────────────

const TICKET_MARKER: &str = "All-in-one ticket: ";

/// Bare-token parser: the first line starting with the ticket marker yields
/// everything after it.
struct TicketParser;

impl ParamParser for TicketParser {
    fn parse(&self, lines: &[String]) -> Option<DiscoveredParam> {
        lines
            .iter()
            .find_map(|line| line.strip_prefix(TICKET_MARKER))
            .map(|rest| DiscoveredParam::Token(rest.trim().to_string()))
    }
}

/// Structured endpoint parser: the first line that is a JSON object with an
/// `identity` field (and optionally `addresses`) yields an endpoint record.
struct EndpointJsonParser;

#[derive(Deserialize)]
struct EndpointLine {
    identity: String,
    #[serde(default)]
    addresses: Vec<String>,
}

impl ParamParser for EndpointJsonParser {
    fn parse(&self, lines: &[String]) -> Option<DiscoveredParam> {
        lines.iter().find_map(|line| {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                return None;
            }
            serde_json::from_str::<EndpointLine>(trimmed)
                .ok()
                .map(|e| DiscoveredParam::Endpoint {
                    identity: e.identity,
                    addresses: e.addresses,
                })
        })
    }
}

// ── Integration parsers ─────────────────────────────────────────────

/// Client-side transfer checks:
/// - `transfer_success`: exactly one transfer summary line was logged
/// - `conn_upgrade`: the client found a direct send address
struct TransferMarkers;

impl IntegrationParser for TransferMarkers {
    fn evaluate(&self, lines: &[String]) -> BTreeMap<String, String> {
        let transfers = lines
            .iter()
            .filter(|l| l.contains("Transferred") && l.contains(" in ") && l.contains("/s"))
            .count();
        let upgraded = lines.iter().any(|l| l.contains("found send address"));

        let mut fields = BTreeMap::new();
        fields.insert(
            "transfer_success".to_string(),
            (transfers == 1).to_string(),
        );
        fields.insert("conn_upgrade".to_string(), upgraded.to_string());
        fields
    }
}
