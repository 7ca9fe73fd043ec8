//! Broker configuration.
//!
//! Defaults match the deployed EA fleet's expectations; individual knobs
//! can be overridden from the environment (loaded via dotenvy in main).

use std::env;
use std::time::Duration;

use crate::wire::MAX_FRAME_BYTES;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP port the EA fleet connects to.
    pub tcp_port: u16,

    /// HMAC shared secret; None disables message authentication.
    pub shared_secret: Option<String>,

    /// Accepted clock drift for signed messages.
    pub timestamp_window_ms: i64,

    /// Non-exempt messages allowed per sender per window.
    pub rate_limit_max_per_window: usize,
    pub rate_limit_window_ms: u64,

    /// Silence threshold before the watchdog flips a session offline.
    pub offline_secs: u64,
    pub watchdog_interval_ms: u64,

    /// Copy scheduler cadence.
    pub copy_interval_ms: u64,

    /// Default trade-request timeout when no jitter applies.
    pub request_timeout_ms: u64,

    /// Grace period before closing a rejected connection, so the error
    /// frame reaches the peer.
    pub reject_flush_delay_ms: u64,

    pub max_frame_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tcp_port: 4001,
            shared_secret: None,
            timestamp_window_ms: 60_000,
            rate_limit_max_per_window: 20,
            rate_limit_window_ms: 1_000,
            offline_secs: 15,
            watchdog_interval_ms: 5_000,
            copy_interval_ms: 200,
            request_timeout_ms: 5_000,
            reject_flush_delay_ms: 1_000,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_parse("TCP_PORT") {
            config.tcp_port = port;
        }
        if let Ok(secret) = env::var("SHARED_SECRET") {
            if !secret.is_empty() {
                config.shared_secret = Some(secret);
            }
        }
        if let Some(max) = env_parse("RATE_LIMIT_MAX_HZ_PER_EA") {
            config.rate_limit_max_per_window = max;
        }
        if let Some(window) = env_parse("RATE_LIMIT_WINDOW_MS") {
            config.rate_limit_window_ms = window;
        }
        if let Some(secs) = env_parse("OFFLINE_SEC") {
            config.offline_secs = secs;
        }
        config
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reject_flush_delay(&self) -> Duration {
        Duration::from_millis(self.reject_flush_delay_ms)
    }
}
