//! Engine configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::WS_ENDPOINT;

/// Application id used when none is configured.
pub const DEFAULT_APP_ID: u32 = 64224;

/// Connection, timing and storage settings for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// WebSocket endpoint without query string
    pub endpoint: String,

    /// Registered application id, sent as `app_id`
    pub app_id: u32,

    /// API token used by `ensure_authenticated`
    #[serde(skip_serializing)]
    pub api_token: Option<String>,

    /// Per-request timeout
    pub request_timeout: Duration,

    /// Timeout for opening the socket
    pub connect_timeout: Duration,

    /// Pause after a settlement before the next purchase in repeating mode
    pub min_cycle_delay: Duration,

    /// Interval between keep-alive pings; `None` disables them
    pub keepalive_interval: Option<Duration>,

    /// SQLite URL of the transaction ledger
    pub database_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: WS_ENDPOINT.to_string(),
            app_id: DEFAULT_APP_ID,
            api_token: None,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            min_cycle_delay: Duration::from_millis(500),
            keepalive_interval: Some(Duration::from_secs(30)),
            database_url: "sqlite:./smarttrader.db?mode=rwc".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `DERIV_*` / `SMART_TRADER_DB` variables set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("DERIV_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(app_id) = std::env::var("DERIV_APP_ID") {
            config.app_id = app_id.parse().context("DERIV_APP_ID must be an integer")?;
        }
        if let Ok(token) = std::env::var("DERIV_API_TOKEN") {
            if !token.trim().is_empty() {
                config.api_token = Some(token);
            }
        }
        if let Ok(secs) = std::env::var("DERIV_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("DERIV_REQUEST_TIMEOUT_SECS must be an integer")?;
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(ms) = std::env::var("DERIV_CYCLE_DELAY_MS") {
            let ms: u64 = ms.parse().context("DERIV_CYCLE_DELAY_MS must be an integer")?;
            config.min_cycle_delay = Duration::from_millis(ms);
        }
        if let Ok(url) = std::env::var("SMART_TRADER_DB") {
            config.database_url = url;
        }

        Ok(config)
    }

    /// Full socket URL including the application id.
    pub fn url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}app_id={}", self.endpoint, separator, self.app_id)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_appends_app_id() {
        let config = EngineConfig::default();
        assert_eq!(
            config.url(),
            "wss://ws.derivws.com/websockets/v3?app_id=64224"
        );

        let config = EngineConfig {
            endpoint: "wss://example.test/ws?l=EN".to_string(),
            app_id: 1,
            ..EngineConfig::default()
        };
        assert_eq!(config.url(), "wss://example.test/ws?l=EN&app_id=1");
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default().with_token("abc");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.min_cycle_delay, Duration::from_millis(500));
        assert_eq!(config.api_token.as_deref(), Some("abc"));

        let rendered = serde_json::to_string(&config).unwrap();
        assert!(!rendered.contains("abc"));
    }
}
