use crate::client::{ConsumerOptions, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub interval_secs: u64,
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_stream_token_ttl_secs")]
    pub stream_token_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Origins allowed to call the API from a browser.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    /// Environment variable holding one extra origin, usually the dashboard.
    #[serde(default = "default_origin_env")]
    pub origin_env: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    /// 0 disables the pull loop.
    #[serde(default)]
    pub poll_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            token: None,
            stream_token_ttl_secs: default_stream_token_ttl_secs(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origin_env: default_origin_env(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            streaming: default_streaming(),
            poll_interval_secs: 0,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            reconnect_multiplier: default_reconnect_multiplier(),
            history_len: default_history_len(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.auth.stream_token_ttl_secs < 1 {
            return Err(ConfigError::Validation(
                "auth.stream_token_ttl_secs должно быть >= 1".to_string(),
            ));
        }
        if self.push.queue_capacity < 1 {
            return Err(ConfigError::Validation(
                "push.queue_capacity должно быть >= 1".to_string(),
            ));
        }

        for origin in &self.cors.allowed_origins {
            validate_origin(origin)?;
        }

        validate_client(&self.client)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }

    pub fn stream_token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.stream_token_ttl_secs)
    }
}

impl AuthConfig {
    /// Environment variable named by `token_env` first, then `token`.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_token_from_env(&self.token_env).or_else(|| {
            self.token
                .as_ref()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    }
}

impl CorsConfig {
    /// `allowed_origins` plus the origin from `origin_env`, without duplicates.
    pub fn resolve_origins(&self) -> Vec<String> {
        let mut origins = self.allowed_origins.clone();
        if let Some(extra) = resolve_token_from_env(&self.origin_env) {
            let extra = extra.trim_end_matches('/').to_string();
            if !origins.contains(&extra) {
                origins.push(extra);
            }
        }
        origins
    }
}

impl ClientConfig {
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            streaming: self.streaming,
            poll_interval: (self.poll_interval_secs > 0)
                .then(|| Duration::from_secs(self.poll_interval_secs)),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_secs(self.reconnect_delay_secs),
                max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
                multiplier: self.reconnect_multiplier,
            },
            history_len: self.history_len,
        }
    }
}

fn validate_origin(origin: &str) -> Result<(), ConfigError> {
    let well_formed = (origin.starts_with("http://") || origin.starts_with("https://"))
        && !origin.ends_with('/')
        && origin.chars().all(|c| c.is_ascii_graphic());
    if !well_formed {
        return Err(ConfigError::Validation(format!(
            "cors.allowed_origins: некорректный origin {origin:?}"
        )));
    }
    Ok(())
}

fn validate_client(cfg: &ClientConfig) -> Result<(), ConfigError> {
    if !(cfg.base_url.starts_with("http://") || cfg.base_url.starts_with("https://")) {
        return Err(ConfigError::Validation(
            "client.base_url должен начинаться с http:// или https://".to_string(),
        ));
    }
    if cfg.reconnect_delay_secs < 1 {
        return Err(ConfigError::Validation(
            "client.reconnect_delay_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.reconnect_max_delay_secs < cfg.reconnect_delay_secs {
        return Err(ConfigError::Validation(
            "client.reconnect_max_delay_secs должно быть >= client.reconnect_delay_secs"
                .to_string(),
        ));
    }
    if !cfg.reconnect_multiplier.is_finite() || cfg.reconnect_multiplier < 1.0 {
        return Err(ConfigError::Validation(
            "client.reconnect_multiplier должно быть >= 1.0".to_string(),
        ));
    }
    if cfg.history_len < 1 {
        return Err(ConfigError::Validation(
            "client.history_len должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn resolve_token_from_env(env_name: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_name) {
        if !v.trim().is_empty() {
            return Some(v.trim().to_string());
        }
    }
    None
}

const fn default_top_processes() -> usize {
    5
}

fn default_token_env() -> String {
    "HWMOND_TOKEN".to_string()
}

const fn default_stream_token_ttl_secs() -> u64 {
    60
}

const fn default_queue_capacity() -> usize {
    16
}

fn default_origin_env() -> String {
    "DASHBOARD_DOMAIN".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_base_url() -> String {
    "http://127.0.0.1:5056".to_string()
}

const fn default_streaming() -> bool {
    true
}

const fn default_reconnect_delay_secs() -> u64 {
    5
}

const fn default_reconnect_max_delay_secs() -> u64 {
    60
}

const fn default_reconnect_multiplier() -> f64 {
    1.0
}

const fn default_history_len() -> usize {
    30
}
