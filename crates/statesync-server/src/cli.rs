use clap::{Args, Parser, Subcommand};
use statesync_core::{
    parse_poll_sources, ConfigError, ReconnectConfig, SyncConfig, DEFAULT_ALERT_CAPACITY,
    DEFAULT_BACKEND_URL, DEFAULT_POLL_SOURCES, DEFAULT_WS_PATH,
};

#[derive(Parser)]
#[command(name = "statesync")]
#[command(about = "Keeps a live merged snapshot of backend state from one push channel and several poll sources")]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "STATESYNC_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync core and its HTTP surface
    Run(RunArgs),
    /// Print the resolved configuration and exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// HTTP server address
    #[arg(long = "http", env = "STATESYNC_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    pub http_addr: String,

    /// Poll only; do not open the push channel
    #[arg(long)]
    pub no_push: bool,

    /// Per-request timeout for poll fetches
    #[arg(long, env = "STATESYNC_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,
}

#[derive(Args, Clone)]
pub struct ConfigArgs {
    /// Backend base URL (http or https)
    #[arg(long, env = "STATESYNC_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    pub backend_url: String,

    /// WebSocket path on the backend
    #[arg(long, env = "STATESYNC_WS_PATH", default_value = DEFAULT_WS_PATH)]
    pub ws_path: String,

    #[arg(long, env = "STATESYNC_USER_ID")]
    pub user_id: Option<String>,

    #[arg(long, env = "STATESYNC_RECONNECT_BASE_MS", default_value_t = 1000)]
    pub reconnect_base_ms: u64,

    #[arg(long, env = "STATESYNC_RECONNECT_MAX_MS", default_value_t = 30_000)]
    pub reconnect_max_ms: u64,

    #[arg(long, env = "STATESYNC_MAX_RECONNECT_ATTEMPTS", default_value_t = 5)]
    pub max_reconnect_attempts: u32,

    #[arg(long, env = "STATESYNC_PING_INTERVAL_MS", default_value_t = 30_000)]
    pub ping_interval_ms: u64,

    #[arg(long, env = "STATESYNC_IDLE_TIMEOUT_MS", default_value_t = 60_000)]
    pub idle_timeout_ms: u64,

    #[arg(long, env = "STATESYNC_ALERT_CAPACITY", default_value_t = DEFAULT_ALERT_CAPACITY)]
    pub alert_capacity: usize,

    /// Comma-separated `id=path@intervalMs` entries
    #[arg(long, env = "STATESYNC_POLL_SOURCES", default_value = DEFAULT_POLL_SOURCES)]
    pub poll_sources: String,
}

impl ConfigArgs {
    pub fn to_sync_config(&self) -> Result<SyncConfig, ConfigError> {
        let config = SyncConfig {
            backend_url: self.backend_url.clone(),
            ws_path: self.ws_path.clone(),
            user_id: self.user_id.clone().filter(|id| !id.is_empty()),
            reconnect: ReconnectConfig {
                base_delay_ms: self.reconnect_base_ms,
                max_delay_ms: self.reconnect_max_ms,
                max_attempts: self.max_reconnect_attempts,
            },
            ping_interval_ms: self.ping_interval_ms,
            idle_timeout_ms: self.idle_timeout_ms,
            alert_capacity: self.alert_capacity,
            poll_sources: parse_poll_sources(&self.poll_sources)?,
        };
        config.validate()?;
        Ok(config)
    }
}
