// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Individual modules (CORS, DB pool) may still read their
// own env vars — this module covers the core server settings.

use std::net::SocketAddr;
use std::time::Duration;

/// Core collaboration server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 signing secret shared with the host CMS for session tokens.
    pub secret: String,
    /// Public WebSocket base URL advertised by the status endpoint.
    pub ws_base_url: String,
    /// Name of the HTTP-only cookie carrying the session token.
    pub cookie_name: String,
    /// PostgreSQL connection string (permissions, profiles, bus).
    pub database_url: Option<String>,
    /// LISTEN/NOTIFY channel for cross-replica awareness fan-out.
    /// Unset disables the broadcast bus.
    pub bus_channel: Option<String>,
    /// How long an untouched active-field lock survives before the
    /// sweeper releases it.
    pub idle_timeout: Duration,
    /// How often the idle sweeper runs.
    pub sweep_interval: Duration,
    /// Grace period before an empty room is torn down.
    pub room_grace: Duration,
    /// Log filter directive (e.g. `info`, `fieldsync_server=debug`).
    pub log_filter: String,
}

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
const DEFAULT_ROOM_GRACE_SECS: u64 = 300;

const DEV_SECRET: &str = "fieldsync_local_development_secret_must_be_32_chars";

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FIELDSYNC_HOST` | `0.0.0.0` |
    /// | `FIELDSYNC_PORT` | `8080` |
    /// | `FIELDSYNC_SECRET` | dev-only placeholder |
    /// | `FIELDSYNC_WS_BASE_URL` | `ws://{host}:{port}` |
    /// | `FIELDSYNC_COOKIE_NAME` | `fieldsync_session` |
    /// | `FIELDSYNC_DATABASE_URL` | *(none)* |
    /// | `FIELDSYNC_BUS_CHANNEL` | *(none — bus disabled)* |
    /// | `FIELDSYNC_IDLE_TIMEOUT_SECS` | `60` |
    /// | `FIELDSYNC_SWEEP_INTERVAL_SECS` | `10` |
    /// | `FIELDSYNC_ROOM_GRACE_SECS` | `300` |
    /// | `FIELDSYNC_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FIELDSYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("FIELDSYNC_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let secret = env("FIELDSYNC_SECRET").unwrap_or_else(|_| DEV_SECRET.into());

        let ws_base_url =
            env("FIELDSYNC_WS_BASE_URL").unwrap_or_else(|_| format!("ws://{listen_addr}"));

        let cookie_name =
            env("FIELDSYNC_COOKIE_NAME").unwrap_or_else(|_| "fieldsync_session".into());

        let database_url = env("FIELDSYNC_DATABASE_URL").ok();
        let bus_channel = env("FIELDSYNC_BUS_CHANNEL").ok().filter(|v| !v.is_empty());

        let secs = |key: &str, default: u64| {
            env(key).ok().and_then(|v| v.parse::<u64>().ok()).unwrap_or(default)
        };
        let idle_timeout =
            Duration::from_secs(secs("FIELDSYNC_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS));
        let sweep_interval = Duration::from_secs(secs(
            "FIELDSYNC_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL_SECS,
        ));
        let room_grace =
            Duration::from_secs(secs("FIELDSYNC_ROOM_GRACE_SECS", DEFAULT_ROOM_GRACE_SECS));

        let log_filter = env("FIELDSYNC_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            secret,
            ws_base_url,
            cookie_name,
            database_url,
            bus_channel,
            idle_timeout,
            sweep_interval,
            room_grace,
            log_filter,
        }
    }

    /// Returns true when using the development-only secret.
    pub fn is_dev_secret(&self) -> bool {
        self.secret == DEV_SECRET
    }
}
