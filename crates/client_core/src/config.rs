use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "chat.toml";
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3_000;
const DEFAULT_BYPASS_HEADER_NAME: &str = "ngrok-skip-browser-warning";
const DEFAULT_BYPASS_HEADER_VALUE: &str = "true";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Extra handshake header; `None` sends the bare handshake.
    pub handshake_header: Option<(String, String)>,
    pub user_id_param: String,
    pub default_address: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            handshake_header: Some((
                DEFAULT_BYPASS_HEADER_NAME.into(),
                DEFAULT_BYPASS_HEADER_VALUE.into(),
            )),
            user_id_param: "userId".into(),
            default_address: None,
        }
    }
}

impl ConnectionSettings {
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn handshake_headers(&self) -> Vec<(String, String)> {
        self.handshake_header.iter().cloned().collect()
    }
}

/// Defaults, then `chat.toml` in the working directory, then the environment.
pub fn load_settings() -> ConnectionSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ConnectionSettings {
    let mut settings = ConnectionSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, &file_cfg),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "chat: ignoring unreadable settings file"
            ),
        }
    }

    apply_env(&mut settings, env);
    settings
}

fn apply_file(settings: &mut ConnectionSettings, file_cfg: &HashMap<String, toml::Value>) {
    let text = |key: &str| -> Option<String> {
        match file_cfg.get(key)? {
            toml::Value::String(v) => Some(v.clone()),
            toml::Value::Integer(v) => Some(v.to_string()),
            toml::Value::Boolean(v) => Some(v.to_string()),
            _ => None,
        }
    };

    if let Some(v) = text("reconnect_interval_ms") {
        set_reconnect_interval(settings, &v);
    }
    if let Some(v) = text("handshake_header_name") {
        set_header_name(settings, v);
    }
    if let Some(v) = text("handshake_header_value") {
        set_header_value(settings, v);
    }
    if let Some(v) = text("user_id_param") {
        settings.user_id_param = v;
    }
    if let Some(v) = text("chat_address") {
        settings.default_address = Some(v);
    }
}

fn apply_env(settings: &mut ConnectionSettings, env: impl Fn(&str) -> Option<String>) {
    for key in ["CHAT_RECONNECT_INTERVAL_MS", "APP__RECONNECT_INTERVAL_MS"] {
        if let Some(v) = env(key) {
            set_reconnect_interval(settings, &v);
        }
    }
    for key in ["CHAT_HANDSHAKE_HEADER_NAME", "APP__HANDSHAKE_HEADER_NAME"] {
        if let Some(v) = env(key) {
            set_header_name(settings, v);
        }
    }
    for key in ["CHAT_HANDSHAKE_HEADER_VALUE", "APP__HANDSHAKE_HEADER_VALUE"] {
        if let Some(v) = env(key) {
            set_header_value(settings, v);
        }
    }
    for key in ["CHAT_USER_ID_PARAM", "APP__USER_ID_PARAM"] {
        if let Some(v) = env(key) {
            settings.user_id_param = v;
        }
    }
    for key in ["CHAT_ADDRESS", "APP__CHAT_ADDRESS"] {
        if let Some(v) = env(key) {
            settings.default_address = Some(v);
        }
    }
}

fn set_reconnect_interval(settings: &mut ConnectionSettings, raw: &str) {
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => settings.reconnect_interval = Duration::from_millis(ms),
        _ => warn!(value = raw, "chat: ignoring invalid reconnect interval"),
    }
}

// An empty name disables the header entirely.
fn set_header_name(settings: &mut ConnectionSettings, name: String) {
    if name.trim().is_empty() {
        settings.handshake_header = None;
        return;
    }
    let value = settings
        .handshake_header
        .take()
        .map(|(_, value)| value)
        .unwrap_or_else(|| DEFAULT_BYPASS_HEADER_VALUE.to_string());
    settings.handshake_header = Some((name, value));
}

fn set_header_value(settings: &mut ConnectionSettings, value: String) {
    if let Some((_, current)) = settings.handshake_header.as_mut() {
        *current = value;
    }
}
