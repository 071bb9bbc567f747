use crate::router::MessageRouter;
use crate::store::{StateStore, StoreTxn};
use crate::types::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Input to the reducer side of the core, produced by the transport and the
/// poll scheduler.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Push {
        frame: String,
        received_at: Stamp,
    },
    PollFetched {
        source_id: String,
        payload: Value,
        requested_at: Stamp,
        completed_at: Stamp,
    },
    PollFailed {
        source_id: String,
        error: String,
        at: Stamp,
        consecutive_failures: u32,
    },
    Connection(ConnectionState),
    /// Start a new session. Events observed before `at` are discarded.
    Reset {
        at: Stamp,
    },
}

/// Counters for one ingested batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub accepted: usize,
    pub dropped: usize,
    pub unrecognized: usize,
    pub malformed: usize,
    pub alerts: usize,
    pub poll_failures: usize,
    /// Events observed before the latest session reset.
    pub discarded: usize,
    /// Messages to send back on the push channel (liveness replies).
    pub replies: Vec<Value>,
}

/// Router plus store: classify, normalize and reduce a batch of events
/// under one store transaction.
pub struct SyncPipeline {
    router: MessageRouter,
    store: Arc<StateStore>,
}

impl SyncPipeline {
    pub fn new(router: MessageRouter, store: Arc<StateStore>) -> Self {
        Self { router, store }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Events are applied in the order given, so per-source arrival order
    /// is preserved. Subscribers see at most one notification.
    pub fn ingest(&self, events: impl IntoIterator<Item = SyncEvent>) -> IngestReport {
        let mut report = IngestReport::default();
        self.store.batch(|txn| {
            for event in events {
                self.ingest_one(txn, event, &mut report);
            }
            let outcome = txn.outcome();
            report.accepted = outcome.accepted;
            report.dropped = outcome.dropped;
        });
        report
    }

    fn ingest_one(&self, txn: &mut StoreTxn<'_>, event: SyncEvent, report: &mut IngestReport) {
        match event {
            SyncEvent::Connection(state) => {
                txn.set_connection_state(state);
            }
            SyncEvent::Reset { at } => {
                info!("Session reset at {}", at);
                txn.reset(at);
            }
            SyncEvent::PollFailed { source_id, at, .. } if txn.predates_reset(at) => {
                debug!("Discarding failure of {} from before the session reset", source_id);
                report.discarded += 1;
            }
            SyncEvent::PollFailed {
                source_id,
                error,
                at,
                consecutive_failures,
            } => {
                report.poll_failures += 1;
                txn.record_poll_failure(&source_id, at, error, consecutive_failures);
            }
            SyncEvent::PollFetched {
                source_id,
                requested_at,
                ..
            } if txn.predates_reset(requested_at) => {
                debug!("Discarding poll of {} issued before the session reset", source_id);
                report.discarded += 1;
            }
            SyncEvent::PollFetched {
                source_id,
                payload,
                requested_at,
                completed_at,
            } => {
                txn.record_poll_success(&source_id, requested_at, completed_at);
                self.route(
                    txn,
                    RawEvent::Poll {
                        source_id,
                        payload,
                        requested_at,
                    },
                    report,
                );
            }
            SyncEvent::Push { received_at, .. } if txn.predates_reset(received_at) => {
                debug!("Discarding push frame received before the session reset");
                report.discarded += 1;
            }
            SyncEvent::Push { frame, received_at } => {
                self.route(txn, RawEvent::Push { frame, received_at }, report);
            }
        }
    }

    fn route(&self, txn: &mut StoreTxn<'_>, raw: RawEvent, report: &mut IngestReport) {
        let msg = match self.router.classify(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                report.malformed += 1;
                return;
            }
        };

        match &msg.kind {
            MessageKind::Unrecognized { kind } => {
                let raw = Value::Object(msg.payload.clone());
                warn!(
                    "Dropping unrecognized message kind '{}' from {}: {}",
                    kind, msg.source_id, raw
                );
                report.unrecognized += 1;
            }
            MessageKind::Ping => {
                debug!("Received ping, replying with pong");
                report.replies.push(json!({"type": "pong"}));
            }
            MessageKind::Pong => {
                debug!("Received pong");
            }
            MessageKind::Alert { .. } => {
                if let Some(alert) = self.router.alert(&msg) {
                    info!("Alert {} ({:?}): {}", alert.kind, alert.severity, alert.message);
                    txn.push_alert(alert, msg.observed_at);
                    report.alerts += 1;
                }
            }
            _ => {
                for update in self.router.normalize(&msg) {
                    txn.apply(update);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::PollShape;
    use crate::store::SyncView;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use parking_lot::Mutex;
    use std::io;

    fn at(ms: i64) -> Stamp {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn pipeline() -> SyncPipeline {
        let router = MessageRouter::new().with_shape(
            "market",
            PollShape::Record {
                domain: "market:NIFTY".into(),
            },
        );
        SyncPipeline::new(router, Arc::new(StateStore::default()))
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    /// Runs `f` with a subscriber that writes into the returned buffer.
    fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, logs.contents())
    }

    fn ltp(view: &SyncView) -> Option<Value> {
        view.snapshot
            .value(&FieldPath::new("market:NIFTY", "ltp"))
            .cloned()
    }

    #[test]
    fn test_delayed_poll_does_not_clobber_push() {
        let p = pipeline();
        p.ingest([SyncEvent::PollFetched {
            source_id: "market".into(),
            payload: json!({"ltp": 100}),
            requested_at: at(0),
            completed_at: at(50),
        }]);
        assert_eq!(ltp(&p.store().view()), Some(json!(100)));

        p.ingest([SyncEvent::Push {
            frame: json!({"type": "periodic_update", "data": {"market_data": {"NIFTY": {"ltp": 105}}}})
                .to_string(),
            received_at: at(1500),
        }]);
        assert_eq!(ltp(&p.store().view()), Some(json!(105)));

        let report = p.ingest([SyncEvent::PollFetched {
            source_id: "market".into(),
            payload: json!({"ltp": 99}),
            requested_at: at(0),
            completed_at: at(1800),
        }]);
        assert_eq!(report.accepted, 0);
        assert_eq!(report.dropped, 1);
        assert_eq!(ltp(&p.store().view()), Some(json!(105)));
    }

    #[test]
    fn test_unknown_kind_leaves_snapshot_untouched() {
        let p = pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        p.store().subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let (report, logs) = capture_logs(|| {
            p.ingest([
                SyncEvent::Push {
                    frame: r#"{"type":"unknown_future_kind","x":1}"#.into(),
                    received_at: at(1),
                },
                SyncEvent::Push {
                    frame: "not json".into(),
                    received_at: at(2),
                },
            ])
        });
        assert_eq!(report.unrecognized, 1);
        assert_eq!(report.malformed, 1);
        assert!(p.store().snapshot().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(logs.contains("WARN"), "{}", logs);
        assert!(logs.contains("unrecognized message kind 'unknown_future_kind'"));
        assert!(logs.contains(r#"{"type":"unknown_future_kind","x":1}"#));
        assert!(logs.contains("Dropping inbound message"));
    }

    #[test]
    fn test_poll_issued_before_reset_is_discarded() {
        let p = SyncPipeline::new(
            MessageRouter::new().with_shape(
                "accounts",
                PollShape::Record {
                    domain: "accounts".into(),
                },
            ),
            Arc::new(StateStore::default()),
        );
        let balance = FieldPath::new("accounts", "balance");
        p.ingest([SyncEvent::PollFetched {
            source_id: "accounts".into(),
            payload: json!({"balance": 900}),
            requested_at: at(0),
            completed_at: at(10),
        }]);

        // A slow fetch went out at 500, the session resets at 800 and the
        // response lands at 1000.
        let report = p.ingest([
            SyncEvent::Reset { at: at(800) },
            SyncEvent::PollFetched {
                source_id: "accounts".into(),
                payload: json!({"balance": 1000}),
                requested_at: at(500),
                completed_at: at(1000),
            },
            SyncEvent::PollFailed {
                source_id: "accounts".into(),
                error: "HTTP 502".into(),
                at: at(700),
                consecutive_failures: 1,
            },
        ]);
        assert_eq!(report.discarded, 2);
        assert_eq!(report.accepted, 0);
        let view = p.store().view();
        assert_eq!(view.snapshot.value(&balance), None);
        assert!(view.snapshot.is_empty());
        assert!(view.sources["accounts"].last_success_at.is_none());
        assert!(!view.sources["accounts"].is_degraded());

        let report = p.ingest([SyncEvent::PollFetched {
            source_id: "accounts".into(),
            payload: json!({"balance": 1200}),
            requested_at: at(900),
            completed_at: at(950),
        }]);
        assert_eq!(report.accepted, 1);
        assert_eq!(p.store().snapshot().value(&balance), Some(&json!(1200)));
    }

    #[test]
    fn test_ping_yields_pong_reply() {
        let p = pipeline();
        let report = p.ingest([SyncEvent::Push {
            frame: r#"{"type":"ping"}"#.into(),
            received_at: at(1),
        }]);
        assert_eq!(report.replies, vec![json!({"type": "pong"})]);
    }

    #[test]
    fn test_mixed_batch_notifies_once() {
        let p = pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        p.store().subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let report = p.ingest([
            SyncEvent::Connection(ConnectionState::Connected),
            SyncEvent::Push {
                frame: r#"{"type":"broker_connected"}"#.into(),
                received_at: at(10),
            },
            SyncEvent::Push {
                frame: r#"{"type":"margin_alert","message":"low margin"}"#.into(),
                received_at: at(11),
            },
            SyncEvent::PollFailed {
                source_id: "accounts".into(),
                error: "HTTP 502".into(),
                at: at(12),
                consecutive_failures: 1,
            },
        ]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.alerts, 1);
        assert_eq!(report.poll_failures, 1);

        let view = p.store().view();
        assert_eq!(view.connection, ConnectionState::Connected);
        assert_eq!(
            view.snapshot.value(&FieldPath::new("system", "broker_connected")),
            Some(&json!(true))
        );
        assert!(view.sources["accounts"].is_degraded());
        assert_eq!(view.alerts.len(), 1);
    }

    #[test]
    fn test_same_source_order_is_preserved() {
        let p = pipeline();
        p.ingest([
            SyncEvent::Push {
                frame: r#"{"type":"broker_connected"}"#.into(),
                received_at: at(5),
            },
            SyncEvent::Push {
                frame: r#"{"type":"broker_disconnected"}"#.into(),
                received_at: at(5),
            },
        ]);
        assert_eq!(
            p.store()
                .snapshot()
                .value(&FieldPath::new("system", "broker_connected")),
            Some(&json!(false))
        );
    }
}
