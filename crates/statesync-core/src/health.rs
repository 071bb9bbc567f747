use crate::types::{ConnectionState, Stamp, Subscription};
use serde::Serialize;

/// Consecutive failures after which a degraded source counts as failing.
pub const FAILING_THRESHOLD: u32 = 3;

/// Health of one poll source as seen by subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub interval_ms: u64,
    pub last_fetched_at: Option<Stamp>,
    pub last_success_at: Option<Stamp>,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

impl SourceHealth {
    pub fn new(source_id: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            source_id: source_id.into(),
            interval_ms,
            ..Default::default()
        }
    }

    pub fn from_subscription(sub: &Subscription) -> Self {
        Self {
            source_id: sub.source_id.clone(),
            interval_ms: sub.interval_ms,
            last_fetched_at: sub.last_fetched_at,
            last_success_at: sub.last_success_at,
            consecutive_failures: sub.consecutive_failures,
            ..Default::default()
        }
    }

    pub fn record_success(&mut self, requested_at: Stamp, completed_at: Stamp) {
        self.last_fetched_at = Some(requested_at);
        self.last_success_at = Some(completed_at);
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, at: Stamp, error: String, consecutive_failures: u32) {
        self.last_fetched_at = Some(at);
        self.consecutive_failures = consecutive_failures;
        self.total_failures += 1;
        self.last_error = Some(error);
    }

    /// Keeps the registration, forgets the history.
    pub fn cleared(&self) -> Self {
        Self::new(self.source_id.clone(), self.interval_ms)
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures > 0
    }

    pub fn status(&self) -> HealthStatus {
        match self.consecutive_failures {
            0 => HealthStatus::Ok,
            n if n < FAILING_THRESHOLD => HealthStatus::Warn,
            _ => HealthStatus::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Fail,
    Warn,
    Ok,
}

impl HealthStatus {
    pub fn for_connection(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => HealthStatus::Ok,
            ConnectionState::Failed => HealthStatus::Fail,
            _ => HealthStatus::Warn,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallHealth {
    pub status: HealthStatus,
    pub connection: ConnectionState,
    pub degraded_sources: Vec<String>,
    pub sources: Vec<SourceHealth>,
}

impl OverallHealth {
    /// Worst of the connection status and every source status.
    pub fn compute<'a>(
        connection: ConnectionState,
        sources: impl IntoIterator<Item = &'a SourceHealth>,
    ) -> Self {
        let sources: Vec<SourceHealth> = sources.into_iter().cloned().collect();
        let status = sources
            .iter()
            .map(SourceHealth::status)
            .chain(std::iter::once(HealthStatus::for_connection(connection)))
            .min()
            .unwrap_or(HealthStatus::Ok);
        let degraded_sources = sources
            .iter()
            .filter(|s| s.is_degraded())
            .map(|s| s.source_id.clone())
            .collect();

        Self {
            status,
            connection,
            degraded_sources,
            sources,
        }
    }
}
