//! Event canonicalization and message-type list parsing.

use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::message::MessageType;

/// Canonical lifecycle events the kernel itself publishes.
pub const START: &str = "START";
pub const STOP: &str = "STOP";
pub const READY: &str = "READY";
pub const PREPARE: &str = "PREPARE";

/// Default event suffixes a bare stage name expands to when used in
/// `--wait`/`--stop`.
pub const DEFAULT_SUFFIXES: &[&str] = &[START, READY];

/// Rewrites a user-supplied event string into one or more canonical forms.
///
/// - `*` or `all` -> the wildcard `*`.
/// - `stage/event` -> kept as-is.
/// - `pkg.TYPE` -> `bgpfix/pkg.TYPE` (last segment uppercased).
/// - `stage/pkg.TYPE` -> `stage/pkg.TYPE` (last segment uppercased).
/// - a bare lowercase `name`, given a non-empty `default_suffixes` list,
///   expands to `name/SUFFIX` for every suffix.
/// - a bare `NAME` (uppercase) -> `bgpfix/pipe.NAME`.
///
/// Idempotent: `canonical(canonical(e)) == canonical(e)` for every output
/// string taken individually (re-running canonicalization on any single
/// result of this function, with the same `default_suffixes`, returns that
/// same result unchanged because every output already matches the
/// `stage/event` or `pkg.TYPE`-free passthrough rules).
pub fn canonical(event: &str, default_suffixes: &[&str]) -> Vec<String> {
    if event == "*" || event.eq_ignore_ascii_case("all") {
        return vec!["*".to_string()];
    }

    if let Some((stage, rest)) = event.split_once('/') {
        let rest = if rest.contains('.') {
            uppercase_last_segment(rest)
        } else {
            rest.to_string()
        };
        return vec![format!("{stage}/{rest}")];
    }

    if event.contains('.') {
        return vec![format!("bgpfix/{}", uppercase_last_segment(event))];
    }

    if is_all_uppercase_ident(event) {
        return vec![format!("bgpfix/pipe.{event}")];
    }

    if !default_suffixes.is_empty() && is_bare_lowercase_ident(event) {
        return default_suffixes
            .iter()
            .map(|suffix| format!("{event}/{suffix}"))
            .collect();
    }

    // Not expandable and not already canonical shape: pass through so
    // callers see a clear "no handler ever matches" rather than a parse
    // error — matching the kernel's general avoid-log-spam policy for
    // lenient, optional lifecycle wiring.
    vec![event.to_string()]
}

fn uppercase_last_segment(s: &str) -> String {
    match s.rsplit_once('.') {
        Some((prefix, last)) => format!("{prefix}.{}", last.to_uppercase()),
        None => s.to_uppercase(),
    }
}

fn is_all_uppercase_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_uppercase() || c == '_')
}

fn is_bare_lowercase_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().unwrap().is_ascii_lowercase()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parses a comma/space-separated list of message-type tokens. Each token
/// resolves first as a canonical type name, else as a decimal integer in
/// `[0, 255]`. Unknown tokens are errors.
pub fn parse_type_list(s: &str) -> Result<Vec<MessageType>> {
    s.split([',', ' '])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(parse_one_type)
        .collect()
}

fn parse_one_type(token: &str) -> Result<MessageType> {
    match token.to_ascii_uppercase().as_str() {
        "OPEN" => return Ok(MessageType::Open),
        "UPDATE" => return Ok(MessageType::Update),
        "NOTIFICATION" => return Ok(MessageType::Notification),
        "KEEPALIVE" => return Ok(MessageType::Keepalive),
        "ROUTEREFRESH" | "ROUTE-REFRESH" | "ROUTE_REFRESH" => return Ok(MessageType::RouteRefresh),
        _ => {}
    }
    match token.parse::<u16>() {
        Ok(n) if n <= 255 => Ok(MessageType::from_u8(n as u8)),
        _ => Err(KernelError::Other(anyhow::anyhow!(
            "unknown message type token '{token}'"
        ))),
    }
}

/// A published lifecycle or stage-defined event.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: String,
    pub values: Vec<serde_json::Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            kind: kind.into(),
            values,
        }
    }

    pub fn matches(&self, pattern: &str) -> bool {
        pattern == "*" || pattern == self.kind
    }
}

/// Phase at which a handler runs relative to the bus's default processing
/// of the same event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    Pre,
    Post,
}

pub type HandlerFn = Arc<dyn Fn(&Event) + Send + Sync>;

/// A registered event listener.
#[derive(Clone)]
pub struct EventHandler {
    pub patterns: Vec<String>,
    pub phase: HandlerPhase,
    pub func: HandlerFn,
}

impl EventHandler {
    pub fn matches(&self, event: &Event) -> bool {
        self.patterns.iter().any(|p| event.matches(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard() {
        assert_eq!(canonical("*", &[]), vec!["*"]);
        assert_eq!(canonical("all", &[]), vec!["*"]);
    }

    #[test]
    fn stage_event_passthrough() {
        assert_eq!(canonical("stage1/custom", &[]), vec!["stage1/custom"]);
    }

    #[test]
    fn pkg_type_gets_bgpfix_prefix_and_uppercase() {
        assert_eq!(canonical("pipe.start", &[]), vec!["bgpfix/pipe.START"]);
    }

    #[test]
    fn stage_pkg_type_uppercases_last_segment_only() {
        assert_eq!(
            canonical("stage1/pipe.ready", &[]),
            vec!["stage1/pipe.READY"]
        );
    }

    #[test]
    fn bare_name_expands_to_default_suffixes() {
        assert_eq!(
            canonical("custom", &["START", "READY"]),
            vec!["custom/START", "custom/READY"]
        );
    }

    #[test]
    fn bare_name_with_no_suffixes_passes_through() {
        assert_eq!(canonical("custom", &[]), vec!["custom"]);
    }

    #[test]
    fn bare_uppercase_maps_to_pipe_event() {
        assert_eq!(canonical("STOP", &["START"]), vec!["bgpfix/pipe.STOP"]);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for input in ["*", "all", "stage1/custom", "pipe.start", "STOP", "custom"] {
            let once: Vec<String> = canonical(input, DEFAULT_SUFFIXES);
            for s in &once {
                let twice = canonical(s, DEFAULT_SUFFIXES);
                assert_eq!(&twice, &vec![s.clone()], "not idempotent for {s}");
            }
        }
    }

    #[test]
    fn type_list_parses_names_and_decimals() {
        let types = parse_type_list("open, UPDATE 4,130").unwrap();
        assert_eq!(
            types,
            vec![
                MessageType::Open,
                MessageType::Update,
                MessageType::Keepalive,
                MessageType::Unknown,
            ]
        );
    }

    #[test]
    fn type_list_rejects_unknown_token() {
        assert!(parse_type_list("bogus").is_err());
    }

    #[test]
    fn type_list_rejects_out_of_range_decimal() {
        assert!(parse_type_list("256").is_err());
    }
}
