use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub ws_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStrategy {
    Fixed,
    Backoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub reconnect_delay_ms: u64,
    pub strategy: ReconnectStrategy,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub message_match_window_secs: i64,
    pub seen_event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub user_id: Option<String>,
    pub auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Missing or
    /// malformed values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("SYNC_API_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();
        let ws_url = lookup("SYNC_WS_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_url(&base_url));

        Config {
            api: ApiConfig {
                timeout_secs: lookup("SYNC_HTTP_TIMEOUT_SECS")
                    .unwrap_or_else(|| "15".to_string())
                    .parse()
                    .unwrap_or(15),
                base_url,
                ws_url,
            },
            connection: ConnectionConfig {
                reconnect_delay_ms: lookup("SYNC_RECONNECT_DELAY_MS")
                    .unwrap_or_else(|| "2000".to_string())
                    .parse()
                    .unwrap_or(2000),
                strategy: match lookup("SYNC_RECONNECT_STRATEGY")
                    .unwrap_or_default()
                    .to_lowercase()
                    .as_str()
                {
                    "backoff" => ReconnectStrategy::Backoff,
                    _ => ReconnectStrategy::Fixed,
                },
                max_delay_ms: lookup("SYNC_RECONNECT_MAX_DELAY_MS")
                    .unwrap_or_else(|| "30000".to_string())
                    .parse()
                    .unwrap_or(30000),
                max_attempts: lookup("SYNC_RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()),
            },
            sync: SyncConfig {
                message_match_window_secs: lookup("SYNC_MESSAGE_MATCH_WINDOW_SECS")
                    .unwrap_or_else(|| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                seen_event_capacity: lookup("SYNC_SEEN_EVENT_CAPACITY")
                    .unwrap_or_else(|| "4096".to_string())
                    .parse()
                    .unwrap_or(4096),
            },
            session: SessionConfig {
                user_id: lookup("SYNC_USER_ID").filter(|v| !v.is_empty()),
                auth_token: lookup("SYNC_AUTH_TOKEN").filter(|v| !v.is_empty()),
            },
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.connection.reconnect_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn message_match_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sync.message_match_window_secs)
    }

    /// Push-channel endpoint for `token`.
    pub fn chat_url(&self, token: &str) -> String {
        format!("{}/chat?token={}", self.api.ws_url, token)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    }
}

/// Hides the token in a push-channel url before it is logged.
pub fn mask_token(url: &str) -> String {
    if let Some(pos) = url.find("token=") {
        let (before, after) = url.split_at(pos + "token=".len());
        let rest = after.find('&').map(|i| &after[i..]).unwrap_or("");
        format!("{}****{}", before, rest)
    } else {
        url.to_string()
    }
}
