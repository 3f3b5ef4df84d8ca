//! DNS lookup task as published by the coordinator.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A DNS record type requested by a task.
///
/// Well-known types get their own variant; anything else is kept verbatim
/// (upper-cased) in [`RecordType::Other`] and handed to the resolver as is.
/// Serialized as its upper-case name, so it can key a JSON object.
///
/// # Examples
///
/// ```
/// use dns_worker::RecordType;
///
/// let rt: RecordType = "aaaa".parse().unwrap();
/// assert_eq!(rt, RecordType::Aaaa);
/// assert_eq!(rt.to_string(), "AAAA");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RecordType {
    /// IPv4 address.
    A,
    /// IPv6 address.
    Aaaa,
    /// Mail exchanger.
    Mx,
    /// Text record.
    Txt,
    /// Name server.
    Ns,
    /// Canonical name.
    Cname,
    /// Start of authority.
    Soa,
    /// Reverse pointer.
    Ptr,
    /// Service locator.
    Srv,
    /// Certification authority authorization.
    Caa,
    /// Any other type token, upper-cased.
    Other(String),
}

impl RecordType {
    /// Returns the canonical upper-case name passed to the resolver.
    pub fn as_str(&self) -> &str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Mx => "MX",
            Self::Txt => "TXT",
            Self::Ns => "NS",
            Self::Cname => "CNAME",
            Self::Soa => "SOA",
            Self::Ptr => "PTR",
            Self::Srv => "SRV",
            Self::Caa => "CAA",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_uppercase();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("invalid record type: {s:?}"));
        }
        Ok(match name.as_str() {
            "A" => Self::A,
            "AAAA" => Self::Aaaa,
            "MX" => Self::Mx,
            "TXT" => Self::Txt,
            "NS" => Self::Ns,
            "CNAME" => Self::Cname,
            "SOA" => Self::Soa,
            "PTR" => Self::Ptr,
            "SRV" => Self::Srv,
            "CAA" => Self::Caa,
            _ => Self::Other(name),
        })
    }
}

impl TryFrom<String> for RecordType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordType> for String {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// A DNS lookup task.
///
/// Every worker location receives the same task through its own
/// subscription. The optional `location` field set by older producers is
/// ignored: results always carry the worker's configured location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Coordinator-assigned task id, echoed in the result.
    pub task_id: String,

    /// Distributed trace id used by the coordinator to correlate results.
    #[serde(default)]
    pub trace_id: String,

    /// Domain to resolve.
    pub domain: String,

    /// Location hint from the producer. Not used for routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Requested record types. Non-empty, no duplicates after decoding.
    pub record_types: Vec<RecordType>,

    /// Producer timestamp, kept as sent.
    #[serde(default)]
    pub timestamp: String,

    /// Cross-process trace propagation carrier (`traceparent`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<HashMap<String, String>>,
}

impl Task {
    /// Creates a task with a fresh UUID task id and trace id.
    pub fn new(domain: impl Into<String>, record_types: Vec<RecordType>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().simple().to_string(),
            domain: domain.into(),
            location: None,
            record_types,
            timestamp: chrono::Utc::now().to_rfc3339(),
            trace_context: None,
        }
    }

    /// Attaches a trace-context carrier.
    pub fn with_trace_context(mut self, carrier: HashMap<String, String>) -> Self {
        self.trace_context = Some(carrier);
        self
    }

    /// Checks the decode-time invariants and drops duplicate record types,
    /// keeping the first occurrence.
    pub(crate) fn normalize(mut self) -> Result<Self, String> {
        if self.task_id.trim().is_empty() {
            return Err("task_id is empty".to_string());
        }
        validate_domain(&self.domain)?;

        let mut seen = Vec::with_capacity(self.record_types.len());
        self.record_types.retain(|rt| {
            if seen.contains(rt) {
                false
            } else {
                seen.push(rt.clone());
                true
            }
        });
        if self.record_types.is_empty() {
            return Err("record_types is empty".to_string());
        }
        Ok(self)
    }
}

/// The domain ends up as a resolver program argument, so anything that
/// could be read as an option or split into several arguments is rejected.
fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.is_empty() {
        return Err("domain is empty".to_string());
    }
    if domain.starts_with('-') || domain.starts_with('+') {
        return Err(format!("domain must not start with '-' or '+': {domain:?}"));
    }
    if domain.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!(
            "domain contains whitespace or control characters: {domain:?}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_type_parses_case_insensitively() {
        assert_eq!("mx".parse::<RecordType>().unwrap(), RecordType::Mx);
        assert_eq!(" Txt ".parse::<RecordType>().unwrap(), RecordType::Txt);
        assert_eq!(
            "dnskey".parse::<RecordType>().unwrap(),
            RecordType::Other("DNSKEY".to_string())
        );
    }

    #[test]
    fn record_type_rejects_garbage() {
        assert!("".parse::<RecordType>().is_err());
        assert!("A; rm".parse::<RecordType>().is_err());
        assert!("-x".parse::<RecordType>().is_err());
    }

    #[test]
    fn record_type_serializes_as_upper_case_string() {
        let json = serde_json::to_string(&vec![RecordType::Aaaa, RecordType::Other("HINFO".into())])
            .unwrap();
        assert_eq!(json, r#"["AAAA","HINFO"]"#);
    }

    #[test]
    fn normalize_removes_duplicates_in_order() {
        let task = Task::new(
            "example.com",
            vec![RecordType::Mx, RecordType::A, RecordType::Mx, RecordType::A],
        )
        .normalize()
        .unwrap();
        assert_eq!(task.record_types, vec![RecordType::Mx, RecordType::A]);
    }

    #[test]
    fn normalize_rejects_empty_record_types() {
        let err = Task::new("example.com", vec![]).normalize().unwrap_err();
        assert!(err.contains("record_types"));
    }

    #[test]
    fn normalize_rejects_option_like_domains() {
        assert!(Task::new("-h", vec![RecordType::A]).normalize().is_err());
        assert!(
            Task::new("+trace", vec![RecordType::A]).normalize().is_err()
        );
        assert!(
            Task::new("a b.com", vec![RecordType::A]).normalize().is_err()
        );
        assert!(Task::new("", vec![RecordType::A]).normalize().is_err());
    }

    #[test]
    fn producer_payload_deserializes() {
        let json = r#"{
            "trace_id": "4bf92f3577b34da6a3ce929d0e0e4736",
            "task_id": "t-1",
            "domain": "example.com",
            "location": "us-east-1",
            "record_types": ["A", "MX"],
            "timestamp": "2024-05-01T10:00:00.123456",
            "trace_context": {"traceparent": "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"}
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_id, "t-1");
        assert_eq!(task.location.as_deref(), Some("us-east-1"));
        assert_eq!(task.record_types, vec![RecordType::A, RecordType::Mx]);
        assert!(task.trace_context.unwrap().contains_key("traceparent"));
    }
}
