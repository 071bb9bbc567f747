use crate::messages::{is_liveness, probe};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use statesync_core::{
    stamp_now, ConnectionState, ConnectionTracker, DropDecision, ReconnectPolicy, Stamp,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Lifecycle and data events. `State` is published once per transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message { frame: String, received_at: Stamp },
    Close { reason: Option<String> },
    Error(String),
    State(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub user_id: Option<String>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            user_id: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(String),
    Reconnect,
    Close,
}

/// Caller side of a push channel. Cheap to clone; all clones drive the same
/// underlying connection.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    closed: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// A handle with no connection behind it; every command is discarded.
    /// Used when the push channel is disabled.
    pub fn detached() -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        let (_, state) = watch::channel(ConnectionState::Disconnected);
        Self {
            commands,
            state,
            closed: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn send(&self, message: &Value) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let text = serde_json::to_string(message).map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.commands
            .send(Command::Send(text))
            .map_err(|_| ChannelError::Closed)
    }

    /// External reconnect trigger. Resets the attempt counter, so this is
    /// the way out of FAILED.
    pub fn reconnect(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| ChannelError::Closed)
    }

    /// Idempotent. Cancels any pending reconnect; the channel ends in
    /// DISCONNECTED.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

pub struct PushChannel;

impl PushChannel {
    /// Spawn the channel task and return its handle and event stream.
    ///
    /// The task owns at most one socket at a time. It reconnects according
    /// to `policy` until the handle is closed or every handle is dropped.
    pub fn open<P>(
        endpoint: impl Into<String>,
        policy: P,
        options: ChannelOptions,
    ) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>)
    where
        P: ReconnectPolicy + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let task = ChannelTask {
            endpoint: endpoint.into(),
            options,
            tracker: ConnectionTracker::new(policy),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
        };
        tokio::spawn(task.run());

        let handle = ChannelHandle {
            commands: command_tx,
            state: state_rx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (handle, event_rx)
    }
}

enum ConnectOutcome {
    Connected(Box<WsStream>),
    Failed(String),
    Reconnect,
    Closed,
}

enum SessionEnd {
    Dropped,
    ManualReconnect,
    ClosedByCaller,
}

enum Wake {
    Elapsed,
    Reconnect,
    Close,
}

struct ChannelTask<P> {
    endpoint: String,
    options: ChannelOptions,
    tracker: ConnectionTracker<P>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
}

impl<P: ReconnectPolicy> ChannelTask<P> {
    async fn run(mut self) {
        loop {
            let transition = self.tracker.begin_connect();
            self.publish(transition);

            let end = match self.connect().await {
                ConnectOutcome::Connected(ws) => {
                    let transition = self.tracker.on_open();
                    self.publish(transition);
                    self.emit(ChannelEvent::Open);
                    self.session(*ws).await
                }
                ConnectOutcome::Failed(reason) => {
                    warn!("Failed to connect to {}: {}", self.endpoint, reason);
                    self.emit(ChannelEvent::Error(reason));
                    SessionEnd::Dropped
                }
                ConnectOutcome::Reconnect => SessionEnd::ManualReconnect,
                ConnectOutcome::Closed => SessionEnd::ClosedByCaller,
            };

            match end {
                SessionEnd::ClosedByCaller => {
                    self.finish();
                    return;
                }
                SessionEnd::ManualReconnect => {
                    let transition = self.tracker.reset_for_manual_reconnect();
                    self.publish(transition);
                    continue;
                }
                SessionEnd::Dropped => {}
            }

            let (decision, transition) = self.tracker.on_drop();
            self.publish(transition);

            let wake = match decision {
                DropDecision::Retry { attempt, delay } => {
                    debug!("Reconnect attempt {} scheduled in {:?}", attempt, delay);
                    self.wait(Some(delay)).await
                }
                DropDecision::GiveUp { attempts } => {
                    error!(
                        "Giving up on {} after {} attempts; waiting for an explicit reconnect",
                        self.endpoint, attempts
                    );
                    self.wait(None).await
                }
                DropDecision::Stopped => return,
            };

            match wake {
                Wake::Elapsed => {}
                Wake::Reconnect => {
                    let transition = self.tracker.reset_for_manual_reconnect();
                    self.publish(transition);
                }
                Wake::Close => {
                    self.finish();
                    return;
                }
            }
        }
    }

    async fn connect(&mut self) -> ConnectOutcome {
        info!("Connecting to {}", self.endpoint);
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.endpoint.clone()));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok((ws, _))) => ConnectOutcome::Connected(Box::new(ws)),
                        Ok(Err(e)) => ConnectOutcome::Failed(e.to_string()),
                        Err(_) => ConnectOutcome::Failed(format!("connect timed out after {:?}", CONNECT_TIMEOUT)),
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Close) | None => return ConnectOutcome::Closed,
                    Some(Command::Reconnect) => {
                        if self.tracker.state() == ConnectionState::Reconnecting {
                            return ConnectOutcome::Reconnect;
                        }
                        debug!("Reconnect requested while already connecting");
                    }
                    Some(Command::Send(_)) => warn!("Dropping outbound message: channel not connected"),
                }
            }
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let probe_text = probe(self.options.user_id.as_deref()).to_string();

        // Probe right away so a half-open socket shows up before the first tick.
        if let Err(e) = write.send(Message::Text(probe_text.clone())).await {
            self.emit(ChannelEvent::Error(e.to_string()));
            return SessionEnd::Dropped;
        }
        debug!("Sent liveness probe");

        let ping_interval = self.options.ping_interval;
        let mut ping_timer = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_activity = Instant::now();

        loop {
            let idle_deadline = last_activity + self.options.idle_timeout;

            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        if is_liveness(&text) {
                            debug!("Received liveness frame");
                        }
                        self.emit(ChannelEvent::Message {
                            frame: text,
                            received_at: stamp_now(),
                        });
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        last_activity = Instant::now();
                        match String::from_utf8(bytes) {
                            Ok(text) => self.emit(ChannelEvent::Message {
                                frame: text,
                                received_at: stamp_now(),
                            }),
                            Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket closed by server");
                        self.emit(ChannelEvent::Close {
                            reason: frame.map(|f| f.reason.to_string()),
                        });
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {
                        // Protocol-level ping/pong, answered by tungstenite.
                        last_activity = Instant::now();
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        self.emit(ChannelEvent::Error(e.to_string()));
                        return SessionEnd::Dropped;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        self.emit(ChannelEvent::Close { reason: None });
                        return SessionEnd::Dropped;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(text)) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            error!("Failed to send message: {}", e);
                            self.emit(ChannelEvent::Error(e.to_string()));
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(Command::Reconnect) => {
                        info!("Reconnect requested, closing current connection");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::ManualReconnect;
                    }
                    Some(Command::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::ClosedByCaller;
                    }
                },
                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(Message::Text(probe_text.clone())).await {
                        error!("Failed to send liveness probe: {}", e);
                        self.emit(ChannelEvent::Error(e.to_string()));
                        return SessionEnd::Dropped;
                    }
                    debug!("Sent liveness probe");
                }
                _ = sleep_until(idle_deadline) => {
                    warn!("No frames for {:?}, treating connection as dropped", self.options.idle_timeout);
                    self.emit(ChannelEvent::Error("idle timeout".to_string()));
                    return SessionEnd::Dropped;
                }
            }
        }
    }

    /// Sleep until `delay` elapses (forever if `None`) while still serving
    /// commands.
    async fn wait(&mut self, delay: Option<Duration>) -> Wake {
        let deadline = delay.map(|d| Instant::now() + d);

        loop {
            let sleep = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sleep => return Wake::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Reconnect) => return Wake::Reconnect,
                    Some(Command::Close) | None => return Wake::Close,
                    Some(Command::Send(_)) => warn!("Dropping outbound message: channel not connected"),
                }
            }
        }
    }

    fn finish(&mut self) {
        let transition = self.tracker.on_close_requested();
        self.publish(transition);
        info!("Channel to {} closed", self.endpoint);
    }

    fn publish(&self, transition: Option<ConnectionState>) {
        if let Some(state) = transition {
            self.state.send_replace(state);
            self.emit(ChannelEvent::State(state));
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}
