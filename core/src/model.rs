use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Host identifier used when nothing else is configured.
pub const DEFAULT_HOST_ID: &str = "local";

const MAX_HOST_ID_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::parse(s).ok_or_else(|| LedgerError::validation(format!("unknown protocol: {s:?} (expected tcp or udp)")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Active,
    Disappeared,
}

impl PortState {
    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Active => "active",
            PortState::Disappeared => "disappeared",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PortState::Active),
            "disappeared" => Some(PortState::Disappeared),
            _ => None,
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeline entry kinds. `ProcessChanged` keeps the `process_change` spelling of
/// older exports on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Appeared,
    Alive,
    #[serde(rename = "process_change", alias = "process_changed", alias = "process-changed")]
    ProcessChanged,
    Disappeared,
    Acknowledged,
    Diagnosed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Appeared => "appeared",
            EventKind::Alive => "alive",
            EventKind::ProcessChanged => "process_change",
            EventKind::Disappeared => "disappeared",
            EventKind::Acknowledged => "acknowledged",
            EventKind::Diagnosed => "diagnosed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "appeared" => Some(EventKind::Appeared),
            "alive" => Some(EventKind::Alive),
            "process_change" | "process_changed" | "process-changed" => Some(EventKind::ProcessChanged),
            "disappeared" => Some(EventKind::Disappeared),
            "acknowledged" => Some(EventKind::Acknowledged),
            "diagnosed" | "diagnosis" => Some(EventKind::Diagnosed),
            _ => None,
        }
    }

    /// Operator-written kinds that say nothing about whether the port is up.
    pub fn is_annotation_only(self) -> bool {
        matches!(self, EventKind::Acknowledged | EventKind::Diagnosed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Trusted,
    #[default]
    Expected,
    Suspicious,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Trusted => "trusted",
            RiskLevel::Expected => "expected",
            RiskLevel::Suspicious => "suspicious",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trusted" => Some(RiskLevel::Trusted),
            "expected" => Some(RiskLevel::Expected),
            "suspicious" => Some(RiskLevel::Suspicious),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RiskLevel::parse(s).ok_or_else(|| {
            LedgerError::validation(format!("unknown risk level: {s:?} (expected trusted, expected or suspicious)"))
        })
    }
}

/// Presentation-only classification. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
    Healthy,
    Suspicious,
    Ghost,
    Unknown,
}

impl DerivedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DerivedStatus::Healthy => "healthy",
            DerivedStatus::Suspicious => "suspicious",
            DerivedStatus::Ghost => "ghost",
            DerivedStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DerivedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (host, protocol, port) tuple shared by facts and annotations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortKey {
    pub host_id: String,
    pub protocol: Protocol,
    pub port: u16,
}

impl PortKey {
    pub fn new(host_id: impl Into<String>, protocol: Protocol, port: u16) -> Result<Self, LedgerError> {
        let host_id = host_id.into();
        if host_id.trim().is_empty() {
            return Err(LedgerError::validation("host_id must not be empty"));
        }
        if host_id.len() > MAX_HOST_ID_LEN {
            return Err(LedgerError::validation(format!("host_id longer than {MAX_HOST_ID_LEN} bytes")));
        }
        if port == 0 {
            return Err(LedgerError::validation("port must be between 1 and 65535"));
        }
        Ok(PortKey { host_id, protocol, port })
    }

    /// Validates raw, caller-supplied values (query strings, CLI flags, imports).
    pub fn parse(host_id: &str, protocol: &str, port: i64) -> Result<Self, LedgerError> {
        let protocol: Protocol = protocol.parse()?;
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| LedgerError::validation(format!("port {port} out of range 1-65535")))?;
        PortKey::new(host_id, protocol, port)
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.host_id, self.protocol, self.port)
    }
}

/// What the scanner saw for one listening socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub pid: u32,
    pub process_name: String,
    pub cmdline: String,
}

/// One scan: every listening (tcp) or bound (udp) tuple with its owner.
pub type ScanSnapshot = BTreeMap<PortKey, Observation>;

/// Machine-observed state of one tuple, mutated in place by each cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRecord {
    pub id: i64,
    #[serde(flatten)]
    pub key: PortKey,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_disappeared_at: Option<OffsetDateTime>,
    #[serde(rename = "current_state")]
    pub state: PortState,
    #[serde(rename = "current_pid")]
    pub pid: u32,
    pub process_name: String,
    pub cmdline: String,
    pub total_seen_count: u64,
    pub total_uptime_seconds: i64,
}

impl FactRecord {
    pub fn is_active(&self) -> bool {
        self.state == PortState::Active
    }
}

/// Append-only timeline row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: i64,
    #[serde(rename = "port_runtime_id")]
    pub fact_id: i64,
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub pid: u32,
    pub process_name: String,
    /// Free-form tool output, only set on `diagnosed` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Human-written memory about a tuple. Joined to facts by key only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub id: i64,
    #[serde(flatten)]
    pub key: PortKey,
    pub title: Option<String>,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub risk_level: RiskLevel,
    pub is_pinned: bool,
}

impl AnnotationRecord {
    /// Record as created by an upsert on an unknown tuple, before the patch applies.
    pub fn new_default(key: PortKey) -> Self {
        AnnotationRecord {
            id: 0,
            key,
            title: None,
            description: None,
            owner: None,
            risk_level: RiskLevel::default(),
            is_pinned: false,
        }
    }
}

/// Partial annotation update: absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
}

impl AnnotationPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.owner.is_none()
            && self.risk_level.is_none()
            && self.is_pinned.is_none()
    }

    pub fn apply(&self, record: &mut AnnotationRecord) {
        if let Some(title) = &self.title {
            record.title = Some(title.clone());
        }
        if let Some(description) = &self.description {
            record.description = Some(description.clone());
        }
        if let Some(owner) = &self.owner {
            record.owner = Some(owner.clone());
        }
        if let Some(risk) = self.risk_level {
            record.risk_level = risk;
        }
        if let Some(pinned) = self.is_pinned {
            record.is_pinned = pinned;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_rejects_port_zero_and_empty_host() {
        assert!(PortKey::new("local", Protocol::Tcp, 0).is_err());
        assert!(PortKey::new("  ", Protocol::Tcp, 22).is_err());
        assert!(PortKey::new("local", Protocol::Udp, 65535).is_ok());
    }

    #[test]
    fn key_parse_validates_raw_input() {
        let key = PortKey::parse("local", "TCP", 8080).unwrap();
        assert_eq!(key.protocol, Protocol::Tcp);
        assert_eq!(key.port, 8080);
        assert!(matches!(PortKey::parse("local", "sctp", 80), Err(LedgerError::Validation(_))));
        assert!(matches!(PortKey::parse("local", "tcp", 70000), Err(LedgerError::Validation(_))));
        assert!(matches!(PortKey::parse("local", "tcp", -1), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn keys_with_different_protocols_are_distinct() {
        let tcp = PortKey::new("local", Protocol::Tcp, 53).unwrap();
        let udp = PortKey::new("local", Protocol::Udp, 53).unwrap();
        assert_ne!(tcp, udp);
        assert_eq!(tcp.to_string(), "local/tcp/53");
    }

    #[test]
    fn event_kind_accepts_legacy_spellings() {
        assert_eq!(EventKind::parse("process_change"), Some(EventKind::ProcessChanged));
        assert_eq!(EventKind::parse("process-changed"), Some(EventKind::ProcessChanged));
        let parsed: EventKind = serde_json::from_str("\"process-changed\"").unwrap();
        assert_eq!(parsed, EventKind::ProcessChanged);
        assert_eq!(serde_json::to_string(&EventKind::ProcessChanged).unwrap(), "\"process_change\"");
    }

    #[test]
    fn patch_only_touches_supplied_fields() {
        let key = PortKey::new("local", Protocol::Tcp, 22).unwrap();
        let mut rec = AnnotationRecord::new_default(key);
        assert_eq!(rec.risk_level, RiskLevel::Expected);
        assert!(!rec.is_pinned);

        let first: AnnotationPatch = serde_json::from_str(r#"{"title":"ssh","owner":"ops"}"#).unwrap();
        first.apply(&mut rec);
        let second: AnnotationPatch = serde_json::from_str(r#"{"risk_level":"trusted"}"#).unwrap();
        second.apply(&mut rec);

        assert_eq!(rec.title.as_deref(), Some("ssh"));
        assert_eq!(rec.owner.as_deref(), Some("ops"));
        assert_eq!(rec.risk_level, RiskLevel::Trusted);
        assert!(rec.description.is_none());
    }

    #[test]
    fn patch_rejects_unknown_risk_level() {
        let res: Result<AnnotationPatch, _> = serde_json::from_str(r#"{"risk_level":"evil"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn fact_serializes_with_legacy_field_names() {
        let fact = FactRecord {
            id: 7,
            key: PortKey::new("local", Protocol::Tcp, 8080).unwrap(),
            first_seen_at: OffsetDateTime::UNIX_EPOCH,
            last_seen_at: OffsetDateTime::UNIX_EPOCH,
            last_disappeared_at: None,
            state: PortState::Active,
            pid: 100,
            process_name: "nginx".into(),
            cmdline: "nginx -g daemon off;".into(),
            total_seen_count: 1,
            total_uptime_seconds: 0,
        };
        let v = serde_json::to_value(&fact).unwrap();
        assert_eq!(v["host_id"], "local");
        assert_eq!(v["protocol"], "tcp");
        assert_eq!(v["current_state"], "active");
        assert_eq!(v["current_pid"], 100);
        assert_eq!(v["first_seen_at"], "1970-01-01T00:00:00Z");
        assert!(v["last_disappeared_at"].is_null());
    }
}
