use crate::metrics;
use serde_json::Value;
use statesync_core::{stamp_now, ConnectionState, IngestReport, SyncEvent, SyncPipeline};
use statesync_poll::{PollEvent, PollScheduler};
use statesync_ws::{ChannelEvent, ChannelHandle};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Where liveness replies go.
pub trait Outbound: Send + Sync {
    fn send(&self, message: &Value);
}

impl Outbound for ChannelHandle {
    fn send(&self, message: &Value) {
        if let Err(e) = ChannelHandle::send(self, message) {
            debug!("Reply not sent: {}", e);
        }
    }
}

impl Outbound for mpsc::UnboundedSender<Value> {
    fn send(&self, message: &Value) {
        let _ = mpsc::UnboundedSender::send(self, message.clone());
    }
}

/// Requests from outside the engine, e.g. the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    /// Drop in-flight polls and start a new session.
    Reset,
}

/// Single writer in front of the store. Every event already queued when the
/// engine wakes is reduced as one batch, so subscribers see one
/// notification per loop turn.
pub struct SyncEngine<O> {
    pipeline: SyncPipeline,
    outbound: O,
    scheduler: Arc<PollScheduler>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    poll_events: mpsc::UnboundedReceiver<PollEvent>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
}

impl<O: Outbound> SyncEngine<O> {
    pub fn new(
        pipeline: SyncPipeline,
        outbound: O,
        scheduler: Arc<PollScheduler>,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        poll_events: mpsc::UnboundedReceiver<PollEvent>,
        commands: mpsc::UnboundedReceiver<EngineCommand>,
    ) -> Self {
        Self {
            pipeline,
            outbound,
            scheduler,
            channel_events,
            poll_events,
            commands,
        }
    }

    /// Runs until `shutdown` flips to true (or its sender is dropped) or both
    /// inputs are closed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Sync engine started");
        let mut channel_open = true;
        let mut poll_open = true;
        let mut commands_open = true;

        while channel_open || poll_open {
            let mut batch = Vec::new();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = self.channel_events.recv(), if channel_open => match event {
                    Some(event) => on_channel_event(event, &mut batch),
                    None => channel_open = false,
                },
                event = self.poll_events.recv(), if poll_open => match event {
                    Some(event) => on_poll_event(event, &mut batch),
                    None => poll_open = false,
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command, &mut batch),
                    None => commands_open = false,
                },
            }

            while let Ok(event) = self.channel_events.try_recv() {
                on_channel_event(event, &mut batch);
            }
            while let Ok(event) = self.poll_events.try_recv() {
                on_poll_event(event, &mut batch);
            }
            while let Ok(command) = self.commands.try_recv() {
                self.on_command(command, &mut batch);
            }

            if batch.is_empty() {
                continue;
            }
            let report = self.pipeline.ingest(batch);
            self.finish_batch(&report);
        }
        info!("Sync engine stopped");
    }

    /// A reset goes first in the batch. Queued events stamped before it are
    /// then discarded and later ones survive.
    fn on_command(&self, command: EngineCommand, batch: &mut Vec<SyncEvent>) {
        match command {
            EngineCommand::Reset => {
                let at = stamp_now();
                self.scheduler.restart();
                metrics::record_reset();
                info!("Session reset, polls in flight dropped");
                batch.insert(0, SyncEvent::Reset { at });
            }
        }
    }

    fn finish_batch(&self, report: &IngestReport) {
        metrics::record_batch(report);
        if report.dropped > 0 {
            debug!("Dropped {} stale updates", report.dropped);
        }
        if report.discarded > 0 {
            debug!("Discarded {} events from before the session reset", report.discarded);
        }
        for reply in &report.replies {
            self.outbound.send(reply);
        }
    }
}

fn on_channel_event(event: ChannelEvent, batch: &mut Vec<SyncEvent>) {
    match event {
        ChannelEvent::Message { frame, received_at } => {
            batch.push(SyncEvent::Push { frame, received_at });
        }
        ChannelEvent::State(state) => {
            metrics::set_connection_state(state);
            if state == ConnectionState::Reconnecting {
                metrics::record_reconnect();
            }
            batch.push(SyncEvent::Connection(state));
        }
        ChannelEvent::Open => debug!("Push channel open"),
        ChannelEvent::Close { reason } => {
            debug!("Push channel closed: {}", reason.as_deref().unwrap_or("no reason"));
        }
        ChannelEvent::Error(e) => warn!("Push channel error: {}", e),
    }
}

fn on_poll_event(event: PollEvent, batch: &mut Vec<SyncEvent>) {
    if let PollEvent::Failed { source_id, .. } = &event {
        metrics::record_poll_failure(source_id);
    }
    batch.push(event.into());
}
