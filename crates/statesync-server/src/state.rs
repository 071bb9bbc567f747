use crate::engine::EngineCommand;
use metrics_exporter_prometheus::PrometheusHandle;
use statesync_core::{StateStore, SyncView};
use statesync_poll::PollScheduler;
use statesync_ws::ChannelHandle;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};

/// Views buffered per SSE client before it starts lagging.
const VIEW_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub channel: ChannelHandle,
    pub scheduler: Arc<PollScheduler>,
    /// Store mutations go through the engine, never straight to the store.
    pub commands: mpsc::UnboundedSender<EngineCommand>,
    pub views: broadcast::Sender<Arc<SyncView>>,
    pub metrics: Option<PrometheusHandle>,
    pub shutdown: watch::Receiver<bool>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<StateStore>,
        channel: ChannelHandle,
        scheduler: Arc<PollScheduler>,
        commands: mpsc::UnboundedSender<EngineCommand>,
        metrics: Option<PrometheusHandle>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (views, _) = broadcast::channel(VIEW_BUFFER);
        let forward = views.clone();
        store.subscribe(move |view| {
            // No receivers just means no SSE clients right now.
            let _ = forward.send(Arc::clone(view));
        });

        Self {
            store,
            channel,
            scheduler,
            commands,
            views,
            metrics,
            shutdown,
            start_time: Instant::now(),
        }
    }

    pub fn subscribe_views(&self) -> broadcast::Receiver<Arc<SyncView>> {
        self.views.subscribe()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
