use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use shared::domain::{CookieJar, Credentials, DEFAULT_LANGUAGE_TAG, DEFAULT_USER_AGENT};
use tracing::warn;
use url::Url;

use crate::{
    backoff::BackoffPolicy,
    crypto::DEFAULT_SIGNING_SECRET,
    error::ClientError,
    handshake::HandshakeConfig,
    listener::ListenerConfig,
    transport::RetryPolicy,
};

pub const SETTINGS_FILE: &str = "client.toml";
const ENV_PREFIX: &str = "APP__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub login_base_url: String,
    pub protocol_version: u32,
    pub client_type: u32,
    pub computer_name: String,
    pub signing_secret: String,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub realtime_service: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub event_queue_capacity: usize,
    pub decode_failure_threshold: u32,
    pub replay_history: usize,
    pub device_id: Option<String>,
    pub cookie: Option<String>,
    pub user_agent: String,
    pub language_tag: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            login_base_url: "https://login.chat.example.com".into(),
            protocol_version: 645,
            client_type: 30,
            computer_name: "Web".into(),
            signing_secret: DEFAULT_SIGNING_SECRET.into(),
            request_timeout_ms: 20_000,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 4_000,
            realtime_service: "realtime".into(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            event_queue_capacity: 256,
            decode_failure_threshold: 5,
            replay_history: 256,
            device_id: None,
            cookie: None,
            user_agent: DEFAULT_USER_AGENT.into(),
            language_tag: DEFAULT_LANGUAGE_TAG.into(),
        }
    }
}

impl ClientSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            realtime_service: self.realtime_service.clone(),
            reconnect: BackoffPolicy::new(
                Duration::from_millis(self.reconnect_base_delay_ms),
                Duration::from_millis(self.reconnect_max_delay_ms),
            ),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            queue_capacity: self.event_queue_capacity,
            decode_failure_threshold: self.decode_failure_threshold,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            replay_history: self.replay_history,
        }
    }

    pub fn handshake_config(&self) -> Result<HandshakeConfig, ClientError> {
        let login_base_url = Url::parse(&self.login_base_url).map_err(|err| {
            ClientError::Protocol(format!(
                "invalid login base url `{}`: {err}",
                self.login_base_url
            ))
        })?;
        Ok(HandshakeConfig {
            login_base_url,
            protocol_version: self.protocol_version,
            client_type: self.client_type,
            computer_name: self.computer_name.clone(),
        })
    }

    /// Credentials from the configured device id and cookie, if a device id is set.
    pub fn credentials(&self) -> Option<Credentials> {
        let device_id = self.device_id.as_deref().filter(|id| !id.is_empty())?;
        let cookie_jar = self
            .cookie
            .as_deref()
            .map(CookieJar::parse)
            .unwrap_or_default();
        Some(
            Credentials::new(device_id)
                .with_cookie_jar(cookie_jar)
                .with_user_agent(self.user_agent.clone())
                .with_language_tag(self.language_tag.clone()),
        )
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the optional settings file, then `APP__*` overrides from `env`.
pub fn load_settings_from<F>(path: &Path, env: F) -> ClientSettings
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ClientSettings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "settings: ignoring unparsable file");
                ClientSettings::default()
            }
        },
        Err(_) => ClientSettings::default(),
    };

    let var = |name: &str| env(&format!("{ENV_PREFIX}{name}"));

    override_string(&mut settings.login_base_url, var("LOGIN_BASE_URL"));
    override_parsed(&mut settings.protocol_version, var("PROTOCOL_VERSION"), "PROTOCOL_VERSION");
    override_parsed(&mut settings.client_type, var("CLIENT_TYPE"), "CLIENT_TYPE");
    override_string(&mut settings.computer_name, var("COMPUTER_NAME"));
    override_string(&mut settings.signing_secret, var("SIGNING_SECRET"));
    override_parsed(&mut settings.request_timeout_ms, var("REQUEST_TIMEOUT_MS"), "REQUEST_TIMEOUT_MS");
    override_parsed(&mut settings.max_attempts, var("MAX_ATTEMPTS"), "MAX_ATTEMPTS");
    override_parsed(&mut settings.retry_base_delay_ms, var("RETRY_BASE_DELAY_MS"), "RETRY_BASE_DELAY_MS");
    override_parsed(&mut settings.retry_max_delay_ms, var("RETRY_MAX_DELAY_MS"), "RETRY_MAX_DELAY_MS");
    override_string(&mut settings.realtime_service, var("REALTIME_SERVICE"));
    override_parsed(
        &mut settings.reconnect_base_delay_ms,
        var("RECONNECT_BASE_DELAY_MS"),
        "RECONNECT_BASE_DELAY_MS",
    );
    override_parsed(
        &mut settings.reconnect_max_delay_ms,
        var("RECONNECT_MAX_DELAY_MS"),
        "RECONNECT_MAX_DELAY_MS",
    );
    override_parsed(&mut settings.connect_timeout_ms, var("CONNECT_TIMEOUT_MS"), "CONNECT_TIMEOUT_MS");
    override_parsed(
        &mut settings.heartbeat_interval_ms,
        var("HEARTBEAT_INTERVAL_MS"),
        "HEARTBEAT_INTERVAL_MS",
    );
    override_parsed(
        &mut settings.event_queue_capacity,
        var("EVENT_QUEUE_CAPACITY"),
        "EVENT_QUEUE_CAPACITY",
    );
    override_parsed(
        &mut settings.decode_failure_threshold,
        var("DECODE_FAILURE_THRESHOLD"),
        "DECODE_FAILURE_THRESHOLD",
    );
    override_parsed(&mut settings.replay_history, var("REPLAY_HISTORY"), "REPLAY_HISTORY");
    if let Some(v) = var("DEVICE_ID") {
        settings.device_id = Some(v);
    }
    if let Some(v) = var("COOKIE") {
        settings.cookie = Some(v);
    }
    override_string(&mut settings.user_agent, var("USER_AGENT"));
    override_string(&mut settings.language_tag, var("LANGUAGE_TAG"));

    settings
}

fn override_string(slot: &mut String, value: Option<String>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn override_parsed<T: FromStr>(slot: &mut T, value: Option<String>, name: &str) {
    let Some(raw) = value else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(variable = %format!("{ENV_PREFIX}{name}"), value = %raw, "settings: ignoring invalid override"),
    }
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
