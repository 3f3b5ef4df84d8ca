//! W3C Trace Context propagation across the stream boundary.
//!
//! The stream carries no ambient context, so the coordinator embeds a
//! carrier map (`traceparent`, optional `tracestate`) in each task.
//! [`TraceContext::extract`] turns that carrier back into a parent context;
//! [`TraceContext::inject`] writes one.
//!
//! `traceparent` format: `{version}-{trace-id}-{parent-id}-{flags}`, e.g.
//! `00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Carrier key of the parent header.
pub const TRACEPARENT: &str = "traceparent";

/// Carrier key of the vendor state header.
pub const TRACESTATE: &str = "tracestate";

/// Identity of one span within a distributed trace.
///
/// # Example
///
/// ```rust
/// use std::collections::HashMap;
/// use dns_worker::telemetry::TraceContext;
///
/// let mut carrier = HashMap::new();
/// carrier.insert(
///     "traceparent".to_string(),
///     "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
/// );
///
/// let remote = TraceContext::extract(&carrier).unwrap();
/// let local = remote.child();
/// assert_eq!(local.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
/// assert_eq!(local.parent_span_id.as_deref(), Some("00f067aa0ba902b7"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex characters, shared by every span of the trace.
    pub trace_id: String,

    /// 16 lowercase hex characters, unique per span.
    pub span_id: String,

    /// Span id of the parent, `None` for a root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Sampled flag from the trace flags byte.
    pub sampled: bool,

    /// Opaque vendor state, passed through unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,

    /// Whether this context was received from another process.
    #[serde(default)]
    pub remote: bool,
}

impl TraceContext {
    /// Starts a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
            sampled: true,
            trace_state: None,
            remote: false,
        }
    }

    /// Creates a context for a child span of this one.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
            trace_state: self.trace_state.clone(),
            remote: false,
        }
    }

    /// Reads a remote parent context from a propagation carrier.
    ///
    /// Keys are matched case-insensitively. Returns `None` if there is no
    /// `traceparent` or it is malformed.
    pub fn extract(carrier: &HashMap<String, String>) -> Option<Self> {
        let traceparent = lookup(carrier, TRACEPARENT)?;
        let (trace_id, span_id, sampled) = parse_traceparent(traceparent)?;
        Some(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            sampled,
            trace_state: lookup(carrier, TRACESTATE)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            remote: true,
        })
    }

    /// Writes this context into a propagation carrier.
    pub fn inject(&self, carrier: &mut HashMap<String, String>) {
        carrier.insert(TRACEPARENT.to_string(), self.traceparent());
        if let Some(state) = &self.trace_state {
            carrier.insert(TRACESTATE.to_string(), state.clone());
        }
    }

    /// Formats this context as a `traceparent` value.
    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }

    /// First 8 characters of the trace id, for log lines.
    pub fn short_trace_id(&self) -> &str {
        self.trace_id.get(..8).unwrap_or(&self.trace_id)
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new_root()
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

fn lookup<'a>(carrier: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    carrier
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn parse_traceparent(value: &str) -> Option<(String, String, bool)> {
    let value = value.trim();
    let mut parts = value.split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;

    if !is_hex(version, 2) || version.eq_ignore_ascii_case("ff") {
        return None;
    }
    // Version 00 has exactly four fields; later versions may append more.
    if version == "00" && parts.next().is_some() {
        return None;
    }
    if !is_lower_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
        return None;
    }
    if !is_lower_hex(span_id, 16) || span_id.bytes().all(|b| b == b'0') {
        return None;
    }
    if !is_hex(flags, 2) {
        return None;
    }
    let flags = u8::from_str_radix(flags, 16).ok()?;
    Some((trace_id.to_string(), span_id.to_string(), flags & 0x01 == 0x01))
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn carrier(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_valid_traceparent() {
        let ctx = TraceContext::extract(&carrier(&[(TRACEPARENT, PARENT)])).unwrap();
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id, "00f067aa0ba902b7");
        assert!(ctx.sampled);
        assert!(ctx.remote);
    }

    #[test]
    fn key_match_is_case_insensitive_and_keeps_tracestate() {
        let ctx = TraceContext::extract(&carrier(&[
            ("Traceparent", PARENT),
            ("TraceState", "vendor=abc"),
        ]))
        .unwrap();
        assert_eq!(ctx.trace_state.as_deref(), Some("vendor=abc"));
        assert_eq!(ctx.child().trace_state.as_deref(), Some("vendor=abc"));
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in [
            "",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
            "00-xyz-00f067aa0ba902b7-01",
        ] {
            assert!(
                TraceContext::extract(&carrier(&[(TRACEPARENT, bad)])).is_none(),
                "accepted {bad:?}"
            );
        }
        assert!(TraceContext::extract(&HashMap::new()).is_none());
    }

    #[test]
    fn unsampled_flag_round_trips() {
        let ctx = TraceContext::extract(&carrier(&[(
            TRACEPARENT,
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00",
        )]))
        .unwrap();
        assert!(!ctx.sampled);
        assert!(ctx.traceparent().ends_with("-00"));
    }

    #[test]
    fn inject_then_extract_yields_same_ids() {
        let root = TraceContext::new_root();
        let mut out = HashMap::new();
        root.inject(&mut out);
        let back = TraceContext::extract(&out).unwrap();
        assert_eq!(back.trace_id, root.trace_id);
        assert_eq!(back.span_id, root.span_id);
    }

    #[test]
    fn generated_ids_have_w3c_lengths() {
        let root = TraceContext::new_root();
        assert_eq!(root.trace_id.len(), 32);
        assert_eq!(root.span_id.len(), 16);
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn short_trace_id_handles_any_trace_id() {
        let root = TraceContext::new_root();
        assert_eq!(root.short_trace_id(), &root.trace_id[..8]);

        let odd = TraceContext {
            trace_id: "aéééééé".to_string(),
            ..TraceContext::new_root()
        };
        assert_eq!(odd.short_trace_id(), "aéééééé");

        let short = TraceContext {
            trace_id: "abc".to_string(),
            ..TraceContext::new_root()
        };
        assert_eq!(short.short_trace_id(), "abc");
    }
}
