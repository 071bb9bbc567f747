use crate::fetcher::FetchFn;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use statesync_core::{stamp_now, Stamp, Subscription, SyncEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Fetched {
        source_id: String,
        payload: Value,
        /// When the request was issued; this is the freshness stamp.
        requested_at: Stamp,
        completed_at: Stamp,
    },
    Failed {
        source_id: String,
        error: String,
        at: Stamp,
        consecutive_failures: u32,
    },
}

impl PollEvent {
    pub fn source_id(&self) -> &str {
        match self {
            PollEvent::Fetched { source_id, .. } | PollEvent::Failed { source_id, .. } => source_id,
        }
    }
}

impl From<PollEvent> for SyncEvent {
    fn from(event: PollEvent) -> Self {
        match event {
            PollEvent::Fetched {
                source_id,
                payload,
                requested_at,
                completed_at,
            } => SyncEvent::PollFetched {
                source_id,
                payload,
                requested_at,
                completed_at,
            },
            PollEvent::Failed {
                source_id,
                error,
                at,
                consecutive_failures,
            } => SyncEvent::PollFailed {
                source_id,
                error,
                at,
                consecutive_failures,
            },
        }
    }
}

struct Source {
    subscription: Arc<Mutex<Subscription>>,
    fetch: FetchFn,
    in_flight: Arc<AtomicBool>,
    retired: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl Source {
    fn retire(&mut self) {
        self.retired.store(true, Ordering::Release);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Independent per-source timers with at most one outstanding fetch per
/// source. Results go out on the receiver returned by [`PollScheduler::new`].
pub struct PollScheduler {
    sources: DashMap<String, Source>,
    events: mpsc::UnboundedSender<PollEvent>,
    /// Running flag. Held across every timer spawn and abort, so each source
    /// owns at most one timer.
    lifecycle: Mutex<bool>,
    generation: Arc<AtomicU64>,
}

impl PollScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PollEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            sources: DashMap::new(),
            events: tx,
            lifecycle: Mutex::new(false),
            generation: Arc::new(AtomicU64::new(0)),
        };
        (scheduler, rx)
    }

    /// Add or replace a source. A replaced source's pending result is
    /// discarded. Starts ticking right away if the scheduler is running.
    pub fn register(&self, source_id: impl Into<String>, interval: Duration, fetch: FetchFn) {
        let source_id = source_id.into();
        let interval_ms = interval.as_millis().min(u64::MAX as u128) as u64;
        let mut source = Source {
            subscription: Arc::new(Mutex::new(Subscription::new(source_id.clone(), interval_ms))),
            fetch,
            in_flight: Arc::new(AtomicBool::new(false)),
            retired: Arc::new(AtomicBool::new(false)),
            timer: None,
        };

        let running = self.lifecycle.lock();
        if *running {
            source.timer = Some(self.spawn_timer(&source));
        }
        let previous = self.sources.insert(source_id.clone(), source);
        drop(running);
        if let Some(mut previous) = previous {
            previous.retire();
            info!("Replaced poll source {}", source_id);
        } else {
            info!("Registered poll source {} every {}ms", source_id, interval_ms);
        }
    }

    pub fn unregister(&self, source_id: &str) -> bool {
        let removed = {
            let _running = self.lifecycle.lock();
            self.sources.remove(source_id)
        };
        match removed {
            Some((_, mut source)) => {
                source.retire();
                info!("Unregistered poll source {}", source_id);
                true
            }
            None => false,
        }
    }

    /// No-op while already running.
    pub fn start(&self) {
        let mut running = self.lifecycle.lock();
        if *running {
            return;
        }
        *running = true;
        self.start_timers();
    }

    /// Cancels every timer. Fetches already in flight finish but their
    /// results are dropped. Idempotent.
    pub fn stop(&self) {
        let mut running = self.lifecycle.lock();
        if !*running {
            return;
        }
        *running = false;
        self.stop_timers();
        info!("Poll scheduler stopped");
    }

    /// Stop then start as one step, if running. Every in-flight result is
    /// dropped. Idle sources fetch again right away, busy ones on the next
    /// tick after their old fetch returns.
    pub fn restart(&self) {
        let running = self.lifecycle.lock();
        if !*running {
            return;
        }
        self.stop_timers();
        self.start_timers();
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock()
    }

    fn start_timers(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        for mut entry in self.sources.iter_mut() {
            let timer = self.spawn_timer(entry.value());
            if let Some(previous) = entry.value_mut().timer.replace(timer) {
                previous.abort();
            }
        }
        info!("Poll scheduler started (generation {})", generation);
    }

    fn stop_timers(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        for mut entry in self.sources.iter_mut() {
            if let Some(timer) = entry.value_mut().timer.take() {
                timer.abort();
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn subscription(&self, source_id: &str) -> Option<Subscription> {
        self.sources
            .get(source_id)
            .map(|entry| entry.subscription.lock().clone())
    }

    /// Copies of every subscription, ordered by source id.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .sources
            .iter()
            .map(|entry| entry.subscription.lock().clone())
            .collect();
        subs.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        subs
    }

    fn spawn_timer(&self, source: &Source) -> JoinHandle<()> {
        let poller = SourcePoller {
            subscription: Arc::clone(&source.subscription),
            fetch: Arc::clone(&source.fetch),
            in_flight: Arc::clone(&source.in_flight),
            retired: Arc::clone(&source.retired),
            events: self.events.clone(),
            generation: Arc::clone(&self.generation),
            started_in: self.generation(),
        };
        tokio::spawn(poller.run())
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct SourcePoller {
    subscription: Arc<Mutex<Subscription>>,
    fetch: FetchFn,
    in_flight: Arc<AtomicBool>,
    retired: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PollEvent>,
    generation: Arc<AtomicU64>,
    started_in: u64,
}

impl SourcePoller {
    async fn run(self) {
        let (source_id, interval_ms) = {
            let sub = self.subscription.lock();
            (sub.source_id.clone(), sub.interval_ms)
        };
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.in_flight.swap(true, Ordering::AcqRel) {
                debug!("Skipping tick for {}: previous fetch still in flight", source_id);
                continue;
            }
            tokio::spawn(self.clone().fetch_once());
        }
    }

    async fn fetch_once(self) {
        let requested_at = stamp_now();
        self.subscription.lock().last_fetched_at = Some(requested_at);

        let result = (self.fetch)().await;
        let completed_at = stamp_now();
        self.in_flight.store(false, Ordering::Release);

        if self.is_stale() {
            debug!("Discarding poll result from a stopped or replaced source");
            return;
        }

        let event = {
            let mut sub = self.subscription.lock();
            match result {
                Ok(payload) => {
                    sub.last_success_at = Some(completed_at);
                    sub.consecutive_failures = 0;
                    PollEvent::Fetched {
                        source_id: sub.source_id.clone(),
                        payload,
                        requested_at,
                        completed_at,
                    }
                }
                Err(e) => {
                    sub.consecutive_failures = sub.consecutive_failures.saturating_add(1);
                    warn!(
                        "Poll of {} failed ({} consecutive): {}",
                        sub.source_id, sub.consecutive_failures, e
                    );
                    PollEvent::Failed {
                        source_id: sub.source_id.clone(),
                        error: e.to_string(),
                        at: completed_at,
                        consecutive_failures: sub.consecutive_failures,
                    }
                }
            }
        };
        let _ = self.events.send(event);
    }

    fn is_stale(&self) -> bool {
        self.retired.load(Ordering::Acquire)
            || self.generation.load(Ordering::Acquire) != self.started_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{fetch_fn, FetchError};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting(calls: Arc<AtomicUsize>) -> FetchFn {
        fetch_fn(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(json!({ "n": n })) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_immediate() {
        let (scheduler, mut rx) = PollScheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler.register("system", Duration::from_secs(5), counting(calls.clone()));
        scheduler.start();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source_id(), "system");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (scheduler, _rx) = PollScheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler.register("market", Duration::from_millis(100), counting(calls.clone()));

        scheduler.start();
        let generation = scheduler.generation();
        scheduler.start();
        assert_eq!(scheduler.generation(), generation);

        tokio::time::sleep(Duration::from_millis(250)).await;
        // Ticks at 0, 100 and 200 from a single timer.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_count_and_recover() {
        let (scheduler, mut rx) = PollScheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scheduler.register(
            "accounts",
            Duration::from_millis(100),
            fetch_fn(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FetchError::Status {
                            status: 503,
                            body: "busy".into(),
                        })
                    } else {
                        Ok(json!([]))
                    }
                }
            }),
        );
        scheduler.start();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert!(matches!(first, PollEvent::Failed { consecutive_failures: 1, .. }));
        assert!(matches!(second, PollEvent::Failed { consecutive_failures: 2, .. }));
        assert!(matches!(third, PollEvent::Fetched { .. }));

        let sub = scheduler.subscription("accounts").unwrap();
        assert_eq!(sub.consecutive_failures, 0);
        assert!(sub.last_success_at.is_some());
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_overlapping_fetch_per_source() {
        let (scheduler, _rx) = PollScheduler::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, p, c) = (active.clone(), peak.clone(), calls.clone());
        scheduler.register(
            "market",
            Duration::from_millis(100),
            fetch_fn(move || {
                let (a, p) = (a.clone(), p.clone());
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            }),
        );
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let issued = calls.load(Ordering::SeqCst);
        assert!(issued >= 2 && issued <= 4, "issued {}", issued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_after_stop_are_discarded() {
        let (scheduler, mut rx) = PollScheduler::new();
        scheduler.register(
            "signals",
            Duration::from_millis(100),
            fetch_fn(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!({"late": true}))
            }),
        );
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.generation(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        scheduler.start();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, PollEvent::Fetched { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_while_running_and_unregister() {
        let (scheduler, mut rx) = PollScheduler::new();
        scheduler.start();

        let calls = Arc::new(AtomicUsize::new(0));
        scheduler.register("strategies", Duration::from_millis(100), counting(calls.clone()));
        assert_eq!(rx.recv().await.unwrap().source_id(), "strategies");

        assert!(scheduler.unregister("strategies"));
        assert!(!scheduler.unregister("strategies"));
        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        assert!(scheduler.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_drops_in_flight_results() {
        let (scheduler, mut rx) = PollScheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scheduler.register(
            "accounts",
            Duration::from_secs(10),
            fetch_fn(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(json!({ "balance": n * 1000 }))
                }
            }),
        );
        scheduler.restart();
        assert_eq!(scheduler.generation(), 0);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.restart();
        assert!(scheduler.is_running());
        assert_eq!(scheduler.generation(), 3);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rx.try_recv().is_err());

        let event = rx.recv().await.unwrap();
        assert!(matches!(&event, PollEvent::Fetched { payload, .. } if payload["balance"] == 2000));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_start_leave_no_orphan_timers() {
        let (scheduler, _rx) = PollScheduler::new();
        let scheduler = Arc::new(scheduler);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let task_scheduler = Arc::clone(&scheduler);
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                task_scheduler.register(format!("s{}", i), Duration::from_millis(20), counting(calls));
            }));
            if i == 8 {
                let scheduler = Arc::clone(&scheduler);
                tasks.push(tokio::spawn(async move { scheduler.start() }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = calls.load(Ordering::SeqCst);
        assert!(seen >= 16, "only {} fetches", seen);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_poll_event_into_sync_event() {
        let at = stamp_now();
        let event: SyncEvent = PollEvent::Failed {
            source_id: "system".into(),
            error: "HTTP 500".into(),
            at,
            consecutive_failures: 4,
        }
        .into();
        assert!(matches!(
            event,
            SyncEvent::PollFailed { consecutive_failures: 4, .. }
        ));
    }
}
