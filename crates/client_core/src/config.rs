use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub realtime_url: String,
    /// Query parameter that carries the access token in the socket handshake.
    pub realtime_token_param: String,
    pub refresh_path: String,
    pub credentials_database_url: String,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Upper bound on the WebSocket opening handshake; an attempt that takes
    /// longer counts as a failed connect.
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000/api".into(),
            realtime_url: "ws://127.0.0.1:5000/ws".into(),
            realtime_token_param: "token".into(),
            refresh_path: "/auth/refresh".into(),
            credentials_database_url: "sqlite://./data/credentials.db".into(),
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Bounded exponential backoff for the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    /// Upper bound of the random delay added to every reconnect. Zero disables
    /// jitter.
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
            jitter: Duration::ZERO,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter:
    /// `base_delay * 2^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1_u32 << exponent)
    }
}

/// Loads settings from defaults, then `client.toml` in the working directory,
/// then `APP__*` environment variables.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                let file_cfg: HashMap<String, String> = file_cfg
                    .into_iter()
                    .map(|(key, value)| {
                        let value = match value {
                            toml::Value::String(text) => text,
                            other => other.to_string(),
                        };
                        (key, value)
                    })
                    .collect();
                apply_overrides(&mut settings, |key| file_cfg.get(key).cloned());
            }
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable file"),
        }
    }

    apply_overrides(&mut settings, |key| {
        std::env::var(format!("APP__{}", key.to_ascii_uppercase())).ok()
    });

    settings
}

/// Applies every recognized key that `lookup` resolves. Keys are the
/// lower-case names used in `client.toml`; the environment uses the same
/// names upper-cased behind an `APP__` prefix.
pub fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_base_url") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("realtime_url") {
        settings.realtime_url = v;
    }
    if let Some(v) = lookup("realtime_token_param") {
        settings.realtime_token_param = v;
    }
    if let Some(v) = lookup("refresh_path") {
        settings.refresh_path = v;
    }
    if let Some(v) = lookup("credentials_database_url") {
        settings.credentials_database_url = v;
    }
    if let Some(v) = millis(&lookup, "request_timeout_ms") {
        settings.request_timeout = v;
    }
    if let Some(v) = millis(&lookup, "reconnect_base_delay_ms") {
        settings.reconnect.base_delay = v;
    }
    if let Some(v) = lookup("reconnect_max_attempts") {
        match v.trim().parse::<u32>() {
            Ok(parsed) => settings.reconnect.max_attempts = parsed,
            Err(_) => warn!(value = %v, "config: reconnect_max_attempts is not a number"),
        }
    }
    if let Some(v) = millis(&lookup, "reconnect_jitter_ms") {
        settings.reconnect.jitter = v;
    }
    if let Some(v) = millis(&lookup, "connect_timeout_ms") {
        settings.connect_timeout = v;
    }
    if let Some(v) = millis(&lookup, "ping_interval_ms") {
        settings.ping_interval = v;
    }
    if let Some(v) = millis(&lookup, "pong_timeout_ms") {
        settings.pong_timeout = v;
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(key, value = %raw, "config: expected a duration in milliseconds");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
