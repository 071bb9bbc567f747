use crate::reconnect::ExponentialBackoff;
use crate::router::{MessageRouter, PollShape};
use crate::store::DEFAULT_ALERT_CAPACITY;
use crate::types::PUSH_SOURCE_ID;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_POLL_SOURCES: &str = "system=/api/system/status@5000,market=/api/market-data/live@2000,signals=/api/trading-signals/active@3000,accounts=/api/accounts@30000";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unsupported backend URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid poll source '{0}': expected id=path@intervalMs")]
    InvalidPollSource(String),

    #[error("Duplicate poll source id: {0}")]
    DuplicateSource(String),

    #[error("Poll source id '{0}' is reserved for the push channel")]
    ReservedSourceId(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSourceConfig {
    pub id: String,
    pub path: String,
    pub interval_ms: u64,
}

impl PollSourceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Everything the core needs, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub backend_url: String,
    pub ws_path: String,
    pub user_id: Option<String>,
    pub reconnect: ReconnectConfig,
    pub ping_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub alert_capacity: usize,
    pub poll_sources: Vec<PollSourceConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            user_id: None,
            reconnect: ReconnectConfig::default(),
            ping_interval_ms: 30_000,
            idle_timeout_ms: 60_000,
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            poll_sources: parse_poll_sources(DEFAULT_POLL_SOURCES).unwrap_or_default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ws_url()?;
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect base delay",
                reason: "must be greater than zero".into(),
            });
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect max delay",
                reason: format!(
                    "{}ms is below the base delay of {}ms",
                    self.reconnect.max_delay_ms, self.reconnect.base_delay_ms
                ),
            });
        }
        if self.ping_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ping interval",
                reason: "must be greater than zero".into(),
            });
        }
        if self.idle_timeout_ms <= self.ping_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "idle timeout",
                reason: format!(
                    "{}ms must exceed the ping interval of {}ms",
                    self.idle_timeout_ms, self.ping_interval_ms
                ),
            });
        }
        if self.alert_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "alert capacity",
                reason: "must be greater than zero".into(),
            });
        }

        let mut seen = HashSet::new();
        for source in &self.poll_sources {
            if source.interval_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "poll interval",
                    reason: format!("source '{}' has a zero interval", source.id),
                });
            }
            if source.id == PUSH_SOURCE_ID {
                return Err(ConfigError::ReservedSourceId(source.id.clone()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.id.clone()));
            }
        }
        Ok(())
    }

    /// Base URL with the HTTP scheme swapped for its WebSocket counterpart.
    pub fn ws_url(&self) -> Result<String, ConfigError> {
        let base = self.backend_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            return Err(ConfigError::UnsupportedScheme(self.backend_url.clone()));
        };

        let mut url = format!("{}{}", ws_base, normalize_path(&self.ws_path));
        if let Some(user_id) = &self.user_id {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("user_id=");
            url.push_str(user_id);
        }
        Ok(url)
    }

    pub fn source_url(&self, source: &PollSourceConfig) -> String {
        format!(
            "{}{}",
            self.backend_url.trim_end_matches('/'),
            normalize_path(&source.path)
        )
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Router with the default shape for every configured source.
    pub fn router(&self) -> MessageRouter {
        self.poll_sources
            .iter()
            .fold(MessageRouter::new(), |router, source| {
                router.with_shape(source.id.clone(), PollShape::for_source(&source.id))
            })
    }
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Parse `id=path@intervalMs` entries separated by commas.
pub fn parse_poll_sources(input: &str) -> Result<Vec<PollSourceConfig>, ConfigError> {
    input.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidPollSource(entry.to_string());
            let (id, rest) = entry.split_once('=').ok_or_else(invalid)?;
            let (path, interval) = rest.rsplit_once('@').ok_or_else(invalid)?;
            let id = id.trim();
            let path = path.trim();
            if id.is_empty() || path.is_empty() {
                return Err(invalid());
            }
            let interval_ms = interval.trim().parse::<u64>().map_err(|_| invalid())?;
            Ok(PollSourceConfig {
                id: id.to_string(),
                path: path.to_string(),
                interval_ms,
            })
        })
        .collect()
}
