use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

const SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub max_duration: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
            max_duration: Duration::from_secs(120),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What `invoke` does with calls issued while the session is not connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPolicy {
    FailFast,
    /// Queue calls issued while connecting or reconnecting; oldest dropped
    /// once `capacity` is reached.
    Queue { capacity: usize },
}

impl Default for OutboundPolicy {
    fn default() -> Self {
        Self::Queue { capacity: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub hub_path: String,
    pub page_size: u32,
    pub typing_window: Duration,
    pub typing_send_debounce: Duration,
    pub notification_recent_capacity: usize,
    pub reconnect: ReconnectPolicy,
    pub outbound: OutboundPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            hub_path: "/hubs/chat".into(),
            page_size: 20,
            typing_window: Duration::from_secs(3),
            typing_send_debounce: Duration::from_secs(1),
            notification_recent_capacity: 5,
            reconnect: ReconnectPolicy::default(),
            outbound: OutboundPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    server_url: Option<String>,
    hub_path: Option<String>,
    page_size: Option<u32>,
    typing_window_ms: Option<u64>,
    typing_send_debounce_ms: Option<u64>,
    notification_recent_capacity: Option<usize>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    reconnect_max_duration_secs: Option<u64>,
    outbound_queue_capacity: Option<usize>,
}

impl Settings {
    /// Websocket endpoint of the realtime hub.
    pub fn hub_url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url '{}'", self.server_url))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => return Ok(url.join(&self.hub_path)?),
            other => return Err(anyhow!("server_url must use http or https, got '{other}'")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch '{}' to {scheme}", self.server_url))?;
        Ok(url.join(&self.hub_path)?)
    }

    /// Base url of the history REST collaborator.
    pub fn api_url(&self) -> anyhow::Result<Url> {
        let url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url '{}'", self.server_url))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(anyhow!("server_url must use http or https, got '{other}'")),
        }
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.server_url {
            self.server_url = v;
        }
        if let Some(v) = file.hub_path {
            self.hub_path = v;
        }
        if let Some(v) = file.page_size {
            self.page_size = v;
        }
        if let Some(v) = file.typing_window_ms {
            self.typing_window = Duration::from_millis(v);
        }
        if let Some(v) = file.typing_send_debounce_ms {
            self.typing_send_debounce = Duration::from_millis(v);
        }
        if let Some(v) = file.notification_recent_capacity {
            self.notification_recent_capacity = v;
        }
        if let Some(v) = file.reconnect_base_delay_ms {
            self.reconnect.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.reconnect_max_delay_ms {
            self.reconnect.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.reconnect_max_attempts {
            self.reconnect.max_attempts = v;
        }
        if let Some(v) = file.reconnect_max_duration_secs {
            self.reconnect.max_duration = Duration::from_secs(v);
        }
        if let Some(v) = file.outbound_queue_capacity {
            self.outbound = queue_policy(v);
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SYNC_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("APP__HUB_PATH") {
            self.hub_path = v;
        }
        if let Some(v) = parsed(&lookup, "APP__PAGE_SIZE") {
            self.page_size = v;
        }
        if let Some(v) = parsed(&lookup, "APP__TYPING_WINDOW_MS") {
            self.typing_window = Duration::from_millis(v);
        }
        if let Some(v) = parsed(&lookup, "APP__TYPING_SEND_DEBOUNCE_MS") {
            self.typing_send_debounce = Duration::from_millis(v);
        }
        if let Some(v) = parsed(&lookup, "APP__NOTIFICATION_RECENT_CAPACITY") {
            self.notification_recent_capacity = v;
        }
        if let Some(v) = parsed(&lookup, "APP__RECONNECT_BASE_DELAY_MS") {
            self.reconnect.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed(&lookup, "APP__RECONNECT_MAX_DELAY_MS") {
            self.reconnect.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed(&lookup, "APP__RECONNECT_MAX_ATTEMPTS") {
            self.reconnect.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "APP__RECONNECT_MAX_DURATION_SECS") {
            self.reconnect.max_duration = Duration::from_secs(v);
        }
        if let Some(v) = parsed(&lookup, "APP__OUTBOUND_QUEUE_CAPACITY") {
            self.outbound = queue_policy(v);
        }
    }
}

fn queue_policy(capacity: usize) -> OutboundPolicy {
    if capacity == 0 {
        OutboundPolicy::FailFast
    } else {
        OutboundPolicy::Queue { capacity }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}

/// Defaults, then `sync.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    match load_file_settings(Path::new(SETTINGS_FILE)) {
        Ok(Some(file)) => settings.apply_file(file),
        Ok(None) => {}
        Err(err) => tracing::warn!("ignoring {SETTINGS_FILE}: {err:#}"),
    }
    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

fn load_file_settings(path: &Path) -> anyhow::Result<Option<FileSettings>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    let file = toml::from_str::<FileSettings>(&raw)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    Ok(Some(file))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
