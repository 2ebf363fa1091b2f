use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval", with = "humantime_duration")]
    pub interval: Duration,
    #[serde(default = "default_deadline", with = "humantime_duration")]
    pub deadline: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_duration")]
    pub connect_timeout: Duration,
    /// 0 probes every target at once.
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub targets_file: Option<PathBuf>,
    #[serde(default)]
    pub upload_url: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_interval(),
            deadline: default_deadline(),
            connect_timeout: default_connect_timeout(),
            max_concurrency: 0,
            targets_file: None,
            upload_url: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
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
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "log_level must not be empty".to_string(),
            ));
        }

        validate_collector(&self.collector, self.database.is_some())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_collector(cfg: &CollectorConfig, has_database: bool) -> Result<(), ConfigError> {
    if cfg.interval.is_zero() {
        return Err(ConfigError::Validation(
            "collector.interval must be > 0".to_string(),
        ));
    }
    if cfg.deadline.is_zero() {
        return Err(ConfigError::Validation(
            "collector.deadline must be > 0".to_string(),
        ));
    }
    if cfg.connect_timeout.is_zero() {
        return Err(ConfigError::Validation(
            "collector.connect_timeout must be > 0".to_string(),
        ));
    }
    if let Some(url) = &cfg.upload_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "collector.upload_url '{url}' must start with http:// or https://"
            )));
        }
    }
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.targets_file.is_none() {
        return Err(ConfigError::Validation(
            "collector.targets_file is required when the collector is enabled".to_string(),
        ));
    }
    if cfg.upload_url.is_none() && !has_database {
        return Err(ConfigError::Validation(
            "an enabled collector needs either database or collector.upload_url".to_string(),
        ));
    }
    Ok(())
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_interval() -> Duration {
    Duration::from_secs(600)
}

const fn default_deadline() -> Duration {
    Duration::from_secs(100)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
