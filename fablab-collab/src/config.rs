//! Runtime configuration for the collaboration core.
//!
//! Defaults match the production deployment; every value can be overridden
//! through `COLLAB_*` environment variables via [`CollabConfig::from_env`].

use std::time::Duration;

use crate::error::CollabError;

pub const DEFAULT_BROKER_URL: &str = "ws://localhost:8000";
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_AUTOSAVE_DEBOUNCE_MS: u64 = 2_000;
pub const DEFAULT_PRESENCE_TTL_MS: u64 = 10_000;
pub const DEFAULT_PRESENCE_TICK_MS: u64 = 5_000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Collaboration core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabConfig {
    /// Event broker base URL; the socket opens at `<broker_url>/ws/<user_id>`
    pub broker_url: String,
    /// REST base URL of the broadcast gateway and persistence endpoints
    pub api_url: String,
    /// Bearer token sent with gateway requests
    pub api_token: Option<String>,
    /// Fixed delay between reconnect attempts
    pub reconnect_interval: Duration,
    /// Reconnect attempts before the connection enters the error state
    pub max_reconnect_attempts: u32,
    /// Quiet period before an edited document is saved
    pub autosave_debounce: Duration,
    /// Presence entries older than this are evicted
    pub presence_ttl: Duration,
    /// How often presence eviction runs
    pub presence_tick: Duration,
    /// Per-request timeout for gateway calls
    pub http_timeout: Duration,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            autosave_debounce: Duration::from_millis(DEFAULT_AUTOSAVE_DEBOUNCE_MS),
            presence_ttl: Duration::from_millis(DEFAULT_PRESENCE_TTL_MS),
            presence_tick: Duration::from_millis(DEFAULT_PRESENCE_TICK_MS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl CollabConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `COLLAB_BROKER_URL`: default `ws://localhost:8000`
    /// - `COLLAB_API_URL`: default `http://localhost:8000/api`
    /// - `COLLAB_API_TOKEN`: no default
    /// - `COLLAB_RECONNECT_INTERVAL_MS`: default 5000
    /// - `COLLAB_MAX_RECONNECT_ATTEMPTS`: default 10
    /// - `COLLAB_AUTOSAVE_DEBOUNCE_MS`: default 2000
    /// - `COLLAB_PRESENCE_TTL_MS`: default 10000
    /// - `COLLAB_PRESENCE_TICK_MS`: default 5000, must be non-zero
    /// - `COLLAB_HTTP_TIMEOUT_SECS`: default 30
    pub fn from_env() -> Result<Self, CollabError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CollabError> {
        let defaults = Self::default();
        Ok(Self {
            broker_url: lookup("COLLAB_BROKER_URL").unwrap_or(defaults.broker_url),
            api_url: lookup("COLLAB_API_URL").unwrap_or(defaults.api_url),
            api_token: lookup("COLLAB_API_TOKEN").filter(|t| !t.is_empty()),
            reconnect_interval: parse_millis(&lookup, "COLLAB_RECONNECT_INTERVAL_MS", defaults.reconnect_interval)?,
            max_reconnect_attempts: parse_num(&lookup, "COLLAB_MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts)?,
            autosave_debounce: parse_millis(&lookup, "COLLAB_AUTOSAVE_DEBOUNCE_MS", defaults.autosave_debounce)?,
            presence_ttl: parse_millis(&lookup, "COLLAB_PRESENCE_TTL_MS", defaults.presence_ttl)?,
            presence_tick: parse_period(&lookup, "COLLAB_PRESENCE_TICK_MS", defaults.presence_tick)?,
            http_timeout: Duration::from_secs(parse_num(
                &lookup,
                "COLLAB_HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )?),
        })
    }
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, CollabError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| CollabError::Config { var, value: raw }),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, CollabError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_num(lookup, var, default_ms).map(Duration::from_millis)
}

/// Like [`parse_millis`], but a timer period must be non-zero.
fn parse_period(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, CollabError> {
    let period = parse_millis(lookup, var, default)?;
    if period.is_zero() {
        return Err(CollabError::Config { var, value: lookup(var).unwrap_or_default() });
    }
    Ok(period)
}
