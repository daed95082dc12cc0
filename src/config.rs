//! Client configuration from `AGENT_CHAT_*` environment variables

use crate::dedup::{DEFAULT_MAX_ENTRIES, DEFAULT_RETAIN};
use crate::history::HistoryConfig;
use crate::runtime::ClientSettings;
use crate::transport::connector::ConnectorConfig;
use crate::transport::{PollPolicy, ReconnectPolicy};
use crate::turn::PhraseMatcher;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// How turn messages reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// STOMP over WebSocket; results arrive on subscribed topics
    #[default]
    Push,
    /// HTTP request/response
    Request,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" | "stomp" | "websocket" => Ok(Self::Push),
            "request" | "http" => Ok(Self::Request),
            other => Err(format!("unknown delivery mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub ws_url: String,
    /// Optional event-stream endpoint fed into the same inbound pipeline
    pub sse_url: Option<String>,
    pub delivery: DeliveryMode,
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: Duration,
    pub status_interval: Duration,
    pub history: HistoryConfig,
    pub dedup_max_entries: usize,
    pub dedup_retain: usize,
    pub poll: PollPolicy,
    /// Replaces the built-in input-request phrases when set
    pub trigger_phrases: Option<Vec<String>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/traveling".to_string(),
            ws_url: "ws://localhost:8080/ws/websocket".to_string(),
            sse_url: None,
            delivery: DeliveryMode::default(),
            data_dir: PathBuf::from("/tmp/.agent-chat"),
            request_timeout: Duration::from_secs(300),
            reconnect: ReconnectPolicy::default(),
            heartbeat: Duration::from_secs(10),
            status_interval: Duration::from_secs(30),
            history: HistoryConfig::default(),
            dedup_max_entries: DEFAULT_MAX_ENTRIES,
            dedup_retain: DEFAULT_RETAIN,
            poll: PollPolicy::default(),
            trigger_phrases: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparseable values keep defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let data_dir = env.get("AGENT_CHAT_DATA_DIR").map_or_else(
            || {
                env.get("HOME")
                    .map_or(defaults.data_dir.clone(), |home| {
                        PathBuf::from(home).join(".agent-chat")
                    })
            },
            PathBuf::from,
        );

        let reconnect = ReconnectPolicy {
            base_delay: env.millis("AGENT_CHAT_RECONNECT_BASE_MS", defaults.reconnect.base_delay),
            max_delay: env.millis("AGENT_CHAT_RECONNECT_MAX_MS", defaults.reconnect.max_delay),
            max_attempts: env.parse("AGENT_CHAT_RECONNECT_ATTEMPTS", defaults.reconnect.max_attempts),
            ..defaults.reconnect
        };

        let history = HistoryConfig {
            max_records: env.parse("AGENT_CHAT_HISTORY_MAX", defaults.history.max_records),
            max_age: Duration::from_secs(
                env.parse::<u64>("AGENT_CHAT_HISTORY_DAYS", defaults.history.max_age.as_secs() / 86_400)
                    * 86_400,
            ),
        };

        let poll = PollPolicy {
            attempts: env.parse("AGENT_CHAT_POLL_ATTEMPTS", defaults.poll.attempts),
            interval: env.secs("AGENT_CHAT_POLL_INTERVAL_SECS", defaults.poll.interval),
        };

        let trigger_phrases = env.get("AGENT_CHAT_TRIGGER_PHRASES").map(|raw| {
            raw.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        });

        Self {
            base_url: env.get("AGENT_CHAT_BASE_URL").unwrap_or(defaults.base_url),
            ws_url: env.get("AGENT_CHAT_WS_URL").unwrap_or(defaults.ws_url),
            sse_url: env.get("AGENT_CHAT_SSE_URL"),
            delivery: env.parse("AGENT_CHAT_DELIVERY", defaults.delivery),
            data_dir,
            request_timeout: env.secs("AGENT_CHAT_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            reconnect,
            heartbeat: env.secs("AGENT_CHAT_HEARTBEAT_SECS", defaults.heartbeat),
            status_interval: env.secs("AGENT_CHAT_STATUS_INTERVAL_SECS", defaults.status_interval),
            history,
            dedup_max_entries: env.parse("AGENT_CHAT_DEDUP_MAX", defaults.dedup_max_entries),
            dedup_retain: env.parse("AGENT_CHAT_DEDUP_RETAIN", defaults.dedup_retain),
            poll,
            trigger_phrases,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("agent-chat.db")
    }

    pub fn connector(&self) -> ConnectorConfig {
        ConnectorConfig {
            reconnect: self.reconnect,
            heartbeat: self.heartbeat,
            ..ConnectorConfig::default()
        }
    }

    pub fn client_settings(&self) -> Result<ClientSettings, regex::Error> {
        let mut settings = ClientSettings::with_defaults()?;
        if let Some(phrases) = &self.trigger_phrases {
            settings.detector = Arc::new(PhraseMatcher::new(phrases)?);
        }
        settings.dedup_max_entries = self.dedup_max_entries;
        settings.dedup_retain = self.dedup_retain;
        Ok(settings)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
                default
            }),
            None => default,
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.parse(key, default_ms))
    }
}
