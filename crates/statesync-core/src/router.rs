//! Classification and normalization of inbound payloads.
//!
//! This is the only place that knows the backend's payload shapes. Everything
//! downstream sees `FieldUpdate`s and `NewAlert`s.

use crate::types::*;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Envelope keys that never become snapshot fields.
const RESERVED_KEYS: &[&str] = &["type", "user_id"];

/// Fields tried, in order, to find the key of a record inside a collection.
const KEY_FIELDS: &[&str] = &["symbol", "name", "id", "account_id", "strategy", "signal_id"];

pub const SYSTEM_DOMAIN: &str = "system";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame missing string 'type' field")]
    MissingType,
}

/// How a poll source's body maps onto snapshot domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollShape {
    /// An object whose keys become fields of one domain.
    Record { domain: String },
    /// A collection of records; each becomes the domain `<prefix>:<key>`.
    Keyed { prefix: String },
}

impl PollShape {
    /// Default shape for a source, inferred from its id.
    pub fn for_source(source_id: &str) -> Self {
        match source_id {
            "market" | "market_data" | "market-data" => PollShape::Keyed {
                prefix: "market".to_string(),
            },
            "accounts" => PollShape::Keyed {
                prefix: "account".to_string(),
            },
            "signals" | "trading_signals" | "trading-signals" => PollShape::Keyed {
                prefix: "signal".to_string(),
            },
            "strategies" => PollShape::Keyed {
                prefix: "strategy".to_string(),
            },
            "system" | "status" => PollShape::Record {
                domain: SYSTEM_DOMAIN.to_string(),
            },
            other => PollShape::Record {
                domain: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    shapes: HashMap<String, PollShape>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the inferred shape for a source.
    pub fn with_shape(mut self, source_id: impl Into<String>, shape: PollShape) -> Self {
        self.shapes.insert(source_id.into(), shape);
        self
    }

    pub fn shape_for(&self, source_id: &str) -> PollShape {
        self.shapes
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| PollShape::for_source(source_id))
    }

    /// Turn a raw event into a typed message.
    ///
    /// Push frames must be JSON objects with a string `type`; unknown types
    /// still classify (as `Unrecognized`) so the caller can log and drop them.
    pub fn classify(&self, raw: RawEvent) -> Result<InboundMessage, RouteError> {
        match raw {
            RawEvent::Push { frame, received_at } => {
                let json: Value = serde_json::from_str(&frame)
                    .map_err(|e| RouteError::Malformed(e.to_string()))?;
                let Value::Object(payload) = json else {
                    return Err(RouteError::NotAnObject);
                };
                let tag = payload
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or(RouteError::MissingType)?;
                let kind = MessageKind::from_tag(tag);
                let user_id = payload.get("user_id").and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });

                Ok(InboundMessage {
                    kind,
                    origin: Origin::Push,
                    source_id: PUSH_SOURCE_ID.to_string(),
                    user_id,
                    payload,
                    observed_at: received_at,
                })
            }
            RawEvent::Poll {
                source_id,
                payload,
                requested_at,
            } => {
                let payload = match payload {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("data".to_string(), other);
                        map
                    }
                };

                Ok(InboundMessage {
                    kind: MessageKind::PollResult,
                    origin: Origin::Poll(source_id.clone()),
                    source_id,
                    user_id: None,
                    payload,
                    observed_at: requested_at,
                })
            }
        }
    }

    /// Map a classified message onto field updates.
    pub fn normalize(&self, msg: &InboundMessage) -> Vec<FieldUpdate> {
        let mut out = Emitter {
            updates: Vec::new(),
            observed_at: msg.observed_at,
            origin: msg.origin.clone(),
        };

        match &msg.kind {
            MessageKind::InitialData | MessageKind::PeriodicUpdate | MessageKind::AutonomousUpdate => {
                let body = body_of(&msg.payload);
                out.sections(&body);
            }
            MessageKind::SystemStatusUpdate => {
                let body = match msg.payload.get("status").or_else(|| msg.payload.get("data")) {
                    Some(Value::Object(inner)) => inner.clone(),
                    _ => without_reserved(&msg.payload),
                };
                out.record(SYSTEM_DOMAIN, &body);
            }
            MessageKind::ConnectionFlag { service, connected } => {
                out.push(
                    FieldPath::new(SYSTEM_DOMAIN, format!("{}_connected", service)),
                    Value::Bool(*connected),
                );
            }
            MessageKind::PollResult => {
                let body = unwrap_data(&msg.payload);
                match self.shape_for(&msg.source_id) {
                    PollShape::Record { domain } => match &body {
                        Value::Object(map) => out.record(&domain, map),
                        other => out.push(FieldPath::new(domain, "value"), other.clone()),
                    },
                    PollShape::Keyed { prefix } => out.collection(&prefix, &body),
                }
            }
            MessageKind::Ping
            | MessageKind::Pong
            | MessageKind::Alert { .. }
            | MessageKind::Unrecognized { .. } => {}
        }

        out.updates
    }

    /// Alerts are appended to the ring buffer rather than merged.
    pub fn alert(&self, msg: &InboundMessage) -> Option<NewAlert> {
        let MessageKind::Alert { name } = &msg.kind else {
            return None;
        };
        let body = match msg.payload.get("data") {
            Some(Value::Object(inner)) => inner,
            _ => &msg.payload,
        };

        let severity = ["severity", "level"]
            .iter()
            .filter_map(|key| body.get(*key).and_then(Value::as_str))
            .find_map(Severity::parse)
            .unwrap_or_else(|| default_severity(name));
        let message = ["message", "msg", "reason"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_alert", name));

        Some(NewAlert {
            kind: format!("{}_alert", name),
            severity,
            message,
        })
    }
}

fn default_severity(name: &str) -> Severity {
    let name = name.to_ascii_lowercase();
    if name.contains("risk") || name.contains("error") || name.contains("emergency") {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

fn without_reserved(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// `data` object if present, otherwise the envelope minus reserved keys.
fn body_of(payload: &Map<String, Value>) -> Map<String, Value> {
    match payload.get("data") {
        Some(Value::Object(inner)) => inner.clone(),
        _ => without_reserved(payload),
    }
}

fn unwrap_data(payload: &Map<String, Value>) -> Value {
    if payload.len() == 1 {
        if let Some(inner) = payload.get("data") {
            return inner.clone();
        }
    }
    Value::Object(payload.clone())
}

fn key_of(record: &Map<String, Value>) -> Option<String> {
    KEY_FIELDS.iter().find_map(|field| match record.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

struct Emitter {
    updates: Vec<FieldUpdate>,
    observed_at: Stamp,
    origin: Origin,
}

impl Emitter {
    fn push(&mut self, path: FieldPath, value: Value) {
        self.updates.push(FieldUpdate::new(
            path,
            value,
            self.observed_at,
            self.origin.clone(),
        ));
    }

    fn record(&mut self, domain: &str, body: &Map<String, Value>) {
        for (field, value) in body {
            if RESERVED_KEYS.contains(&field.as_str()) {
                continue;
            }
            self.push(FieldPath::new(domain, field.clone()), value.clone());
        }
    }

    fn collection(&mut self, prefix: &str, body: &Value) {
        match body {
            Value::Object(map) => {
                for (key, record) in map {
                    match record {
                        Value::Object(fields) => self.record(&format!("{}:{}", prefix, key), fields),
                        _ => debug!("Skipping non-record entry {} in {} collection", key, prefix),
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    match item.as_object() {
                        Some(fields) => match key_of(fields) {
                            Some(key) => self.record(&format!("{}:{}", prefix, key), fields),
                            None => debug!("Skipping {} record without a key field", prefix),
                        },
                        None => debug!("Skipping non-object item in {} collection", prefix),
                    }
                }
            }
            _ => debug!("Ignoring scalar body for {} collection", prefix),
        }
    }

    /// Bulk push bodies: well-known sections plus loose scalars for `system`.
    fn sections(&mut self, body: &Map<String, Value>) {
        for (key, value) in body {
            match key.as_str() {
                "system" | "system_status" => match value {
                    Value::Object(fields) => self.record(SYSTEM_DOMAIN, fields),
                    other => self.push(FieldPath::new(SYSTEM_DOMAIN, key.clone()), other.clone()),
                },
                "market_data" | "market" => self.collection("market", value),
                "strategies" => self.collection("strategy", value),
                "accounts" => self.collection("account", value),
                "signals" | "trading_signals" => self.collection("signal", value),
                _ if !value.is_object() && !value.is_array() => {
                    self.push(FieldPath::new(SYSTEM_DOMAIN, key.clone()), value.clone())
                }
                _ => debug!("Ignoring unknown section '{}'", key),
            }
        }
    }
}
