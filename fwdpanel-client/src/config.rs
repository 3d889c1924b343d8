use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use fwdpanel_core::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_CHANNEL: &str = "events";
pub const SERVER_URL_ENV: &str = "FWDPANEL_SERVER_URL";

/// `config.json` is expected to be tiny; anything bigger is treated as corrupt.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
    #[error("invalid server url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error("{0}")]
    Invalid(String),
}

/// Timing knobs of one channel connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Interval between `ping` frames while the connection is open.
    pub heartbeat_interval: Duration,
    /// When set, a ping left unanswered this long forces the connection closed.
    pub pong_timeout: Option<Duration>,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    pub reconnect: BackoffPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            pong_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: BackoffPolicy::default(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be non-zero".to_owned(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect timeout must be non-zero".to_owned(),
            ));
        }
        if self.pong_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid(
                "pong timeout must be non-zero when set".to_owned(),
            ));
        }
        self.reconnect
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub command: String,
    pub args: Vec<String>,
    /// A run that stays up this long resets the restart counter.
    pub stable_after_ms: u64,
    pub max_restarts: u32,
    pub restart_base_delay_ms: u64,
    pub restart_max_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            stable_after_ms: 60_000,
            max_restarts: 5,
            restart_base_delay_ms: 1_000,
            restart_max_delay_ms: 30_000,
        }
    }
}

impl BackendConfig {
    #[must_use]
    pub fn restart_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.restart_base_delay_ms),
            Duration::from_millis(self.restart_max_delay_ms),
            self.max_restarts,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    /// Channel name -> path joined onto `server_url`.
    pub channels: BTreeMap<String, String>,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub backend: Option<BackendConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            channels: BTreeMap::from([(DEFAULT_CHANNEL.to_owned(), "/ws".to_owned())]),
            heartbeat_interval_ms: millis(DEFAULT_HEARTBEAT_INTERVAL),
            pong_timeout_ms: None,
            connect_timeout_ms: millis(DEFAULT_CONNECT_TIMEOUT),
            reconnect_base_delay_ms: millis(policy.base_delay),
            reconnect_max_delay_ms: millis(policy.max_delay),
            max_reconnect_attempts: policy.max_attempts,
            backend: None,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            pong_timeout: self.pong_timeout_ms.map(Duration::from_millis),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect: BackoffPolicy::new(
                Duration::from_millis(self.reconnect_base_delay_ms),
                Duration::from_millis(self.reconnect_max_delay_ms),
                self.max_reconnect_attempts,
            ),
        }
    }

    pub fn channel_url(&self, name: &str) -> Result<String, ConfigError> {
        let path = self
            .channels
            .get(name)
            .ok_or_else(|| ConfigError::UnknownChannel(name.to_owned()))?;
        let base = Url::parse(&self.server_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.server_url.clone(),
            source,
        })?;
        let joined = base.join(path).map_err(|source| ConfigError::InvalidUrl {
            url: format!("{}{}", self.server_url, path),
            source,
        })?;
        Ok(joined.to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.server_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.server_url.clone(),
            source,
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "server url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        if self.channels.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one channel must be configured".to_owned(),
            ));
        }
        if let Some(backend) = &self.backend {
            if backend.command.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "backend command must not be empty".to_owned(),
                ));
            }
            backend
                .restart_policy()
                .validate()
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        }
        self.channel_config().validate()
    }

    /// Applies `FWDPANEL_SERVER_URL` when it is set and non-empty.
    pub fn apply_env(&mut self) {
        if let Some(url) = std::env::var(SERVER_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
        {
            self.server_url = url.trim().to_owned();
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn config_path() -> PathBuf {
    let base = std::env::var_os("FWDPANEL_CONFIG_DIR")
        .or_else(|| std::env::var_os("LOCALAPPDATA"))
        .or_else(|| std::env::var_os("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("fwdpanel").join("config.json")
}

pub fn parse_config_json(data: &str) -> Result<ClientConfig, serde_json::Error> {
    serde_json::from_str::<ClientConfig>(data)
}

pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let meta = fs::metadata(path).map_err(ConfigError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigError::Read)?;
    parse_config_json(&data).map_err(ConfigError::Parse)
}

pub fn save_config_to_path(path: &Path, config: &ClientConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(ConfigError::Rename)?;
    Ok(())
}
