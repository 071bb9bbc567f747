use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

/// Freshness stamp carried by every update and every stored field.
pub type Stamp = DateTime<Utc>;

/// Current time for freshness stamps.
///
/// Wall time is read once and then advanced by a monotonic clock, so a
/// system clock step never moves stamps backwards within a process.
pub fn stamp_now() -> Stamp {
    static BASE: OnceLock<(Stamp, Instant)> = OnceLock::new();
    let (wall, mono) = BASE.get_or_init(|| (Utc::now(), Instant::now()));
    let elapsed =
        chrono::Duration::from_std(mono.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
    *wall + elapsed
}

/// Source id used for messages that arrived over the push channel.
pub const PUSH_SOURCE_ID: &str = "push";

/// Lifecycle of the push channel. Owned by the transport, mirrored read-only
/// everywhere else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Numeric encoding used for the connection gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Reconnecting => 3.0,
            ConnectionState::Failed => 4.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who wrote a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "lowercase")]
pub enum Origin {
    Push,
    Poll(String),
}

impl Origin {
    pub fn is_push(&self) -> bool {
        matches!(self, Origin::Push)
    }

    pub fn source_id(&self) -> &str {
        match self {
            Origin::Push => PUSH_SOURCE_ID,
            Origin::Poll(id) => id,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Push => f.write_str("PUSH"),
            Origin::Poll(id) => write!(f, "POLL({})", id),
        }
    }
}

/// Location of a field in the snapshot: a logical domain such as `system`,
/// `market:<symbol>` or `strategy:<name>`, then a field name inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath {
    pub domain: String,
    pub field: String,
}

impl FieldPath {
    pub fn new(domain: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.field)
    }
}

/// The unit the reducer applies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldUpdate {
    pub path: FieldPath,
    pub value: Value,
    pub observed_at: Stamp,
    pub origin: Origin,
}

impl FieldUpdate {
    pub fn new(path: FieldPath, value: Value, observed_at: Stamp, origin: Origin) -> Self {
        Self {
            path,
            value,
            observed_at,
            origin,
        }
    }
}

/// Unclassified input from either producer.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// A text frame received on the push channel.
    Push { frame: String, received_at: Stamp },
    /// A decoded body returned by a poll source. `requested_at` is when the
    /// request was issued, so a slow response keeps its old stamp.
    Poll {
        source_id: String,
        payload: Value,
        requested_at: Stamp,
    },
}

/// Recognized message kinds. Anything the backend adds later lands in
/// `Unrecognized` and is dropped by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    Pong,
    InitialData,
    PeriodicUpdate,
    AutonomousUpdate,
    SystemStatusUpdate,
    /// `<service>_connected` / `<service>_disconnected`
    ConnectionFlag { service: String, connected: bool },
    /// `<name>_alert`
    Alert { name: String },
    /// Result of a poll fetch; the kind is implied by the source id.
    PollResult,
    Unrecognized { kind: String },
}

impl MessageKind {
    /// Map a push envelope `type` tag to its variant.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "initial_data" => MessageKind::InitialData,
            "periodic_update" => MessageKind::PeriodicUpdate,
            "autonomous_update" => MessageKind::AutonomousUpdate,
            "system_status_update" => MessageKind::SystemStatusUpdate,
            _ => {
                if let Some(service) = non_empty_prefix(tag, "_disconnected") {
                    MessageKind::ConnectionFlag {
                        service: service.to_string(),
                        connected: false,
                    }
                } else if let Some(service) = non_empty_prefix(tag, "_connected") {
                    MessageKind::ConnectionFlag {
                        service: service.to_string(),
                        connected: true,
                    }
                } else if let Some(name) = non_empty_prefix(tag, "_alert") {
                    MessageKind::Alert {
                        name: name.to_string(),
                    }
                } else {
                    MessageKind::Unrecognized {
                        kind: tag.to_string(),
                    }
                }
            }
        }
    }

    pub fn is_liveness(&self) -> bool {
        matches!(self, MessageKind::Ping | MessageKind::Pong)
    }
}

fn non_empty_prefix<'a>(tag: &'a str, suffix: &str) -> Option<&'a str> {
    tag.strip_suffix(suffix).filter(|prefix| !prefix.is_empty())
}

/// A classified event. Ephemeral: built per event and consumed immediately.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub kind: MessageKind,
    /// Set by the router from the event variant, never from `source_id`.
    pub origin: Origin,
    pub source_id: String,
    pub user_id: Option<String>,
    pub payload: Map<String, Value>,
    pub observed_at: Stamp,
}

/// Per-source poll bookkeeping, owned by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub source_id: String,
    pub interval_ms: u64,
    pub last_fetched_at: Option<Stamp>,
    pub last_success_at: Option<Stamp>,
    pub consecutive_failures: u32,
}

impl Subscription {
    pub fn new(source_id: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            source_id: source_id.into(),
            interval_ms,
            last_fetched_at: None,
            last_success_at: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "low" | "notice" => Some(Severity::Info),
            "warning" | "warn" | "medium" => Some(Severity::Warning),
            "critical" | "error" | "high" | "emergency" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// An alert extracted from the push channel, before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub kind: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: u64,
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    pub created_at: Stamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_now_never_goes_backwards() {
        let mut last = stamp_now();
        for _ in 0..1_000 {
            let next = stamp_now();
            assert!(next >= last);
            last = next;
        }
        let drift = (stamp_now() - Utc::now()).num_seconds().abs();
        assert!(drift < 5, "drift {}s", drift);
    }

    #[test]
    fn test_kind_from_tag() {
        assert_eq!(MessageKind::from_tag("ping"), MessageKind::Ping);
        assert_eq!(
            MessageKind::from_tag("system_status_update"),
            MessageKind::SystemStatusUpdate
        );
        assert_eq!(
            MessageKind::from_tag("broker_connected"),
            MessageKind::ConnectionFlag {
                service: "broker".to_string(),
                connected: true
            }
        );
        assert_eq!(
            MessageKind::from_tag("market_feed_disconnected"),
            MessageKind::ConnectionFlag {
                service: "market_feed".to_string(),
                connected: false
            }
        );
        assert_eq!(
            MessageKind::from_tag("risk_alert"),
            MessageKind::Alert {
                name: "risk".to_string()
            }
        );
    }

    #[test]
    fn test_bare_suffix_is_unrecognized() {
        assert_eq!(
            MessageKind::from_tag("_connected"),
            MessageKind::Unrecognized {
                kind: "_connected".to_string()
            }
        );
        assert!(matches!(
            MessageKind::from_tag("unknown_future_kind"),
            MessageKind::Unrecognized { .. }
        ));
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(Origin::Push.to_string(), "PUSH");
        assert_eq!(Origin::Poll("market".into()).to_string(), "POLL(market)");
    }
}
