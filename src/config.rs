use crate::models::{BrokerConfig, Mqtt2RestUnitConfig, Rest2MqttUnitConfig, UnitConfig};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound of configured units, per direction.
pub const MAX_UNIT_NUM: usize = 32;

pub const DEFAULT_CONFIG_FILE: &str = "mqrestt.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default = "default_logtarget")]
    pub logtarget: String,
    #[serde(default = "default_logfile")]
    pub logfile: PathBuf,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub mqtt2rest: Vec<Mqtt2RestUnitConfig>,
    #[serde(default)]
    pub rest2mqtt: Vec<Rest2MqttUnitConfig>,
}

fn default_loglevel() -> String {
    "fatal".to_string()
}

fn default_logtarget() -> String {
    "stdout".to_string()
}

fn default_logfile() -> PathBuf {
    PathBuf::from("mqrestt.log")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read configuration file {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Cannot parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Configuration array too small: {count} {kind} units, the max is {max}")]
    TooManyUnits {
        kind: &'static str,
        count: usize,
        max: usize,
    },
    #[error("No enabled units found")]
    NoUnits,
    #[error("Either broker.cafile or broker.capath needs to be set when TLS is enabled")]
    MissingTlsMaterial,
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Resolve the configuration path (argument, `MQRESTT_CONFIG`, default) and load it.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let path = path
            .or_else(|| env::var("MQRESTT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = Self::from_file(&path)?;
        config.apply_credentials(env::var("MQTT_USERNAME").ok(), env::var("MQTT_PASSWORD").ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    /// Empty TLS material strings count as unset.
    fn normalize(&mut self) {
        for slot in [
            &mut self.broker.cafile,
            &mut self.broker.capath,
            &mut self.broker.certfile,
            &mut self.broker.keyfile,
        ] {
            if slot.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                *slot = None;
            }
        }
    }

    /// Credentials from the environment win over the file and switch user/password auth on.
    pub fn apply_credentials(&mut self, user: Option<String>, pw: Option<String>) {
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            self.broker.user = Some(user);
            self.broker.user_pw = true;
        }
        if let Some(pw) = pw {
            self.broker.pw = Some(pw);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const MIN_RETRY_INTERVAL: u64 = 100;
        const MAX_RETRY_INTERVAL: u64 = 1_000_000;

        if self.mqtt2rest.len() > MAX_UNIT_NUM {
            return Err(ConfigError::TooManyUnits {
                kind: "mqtt2rest",
                count: self.mqtt2rest.len(),
                max: MAX_UNIT_NUM,
            });
        }
        if self.rest2mqtt.len() > MAX_UNIT_NUM {
            return Err(ConfigError::TooManyUnits {
                kind: "rest2mqtt",
                count: self.rest2mqtt.len(),
                max: MAX_UNIT_NUM,
            });
        }

        let broker = &self.broker;
        if broker.tls && broker.cafile.is_none() && broker.capath.is_none() {
            return Err(ConfigError::MissingTlsMaterial);
        }
        if broker.keepalive < 5 {
            return Err(ConfigError::Invalid(
                "broker.keepalive must be at least 5 seconds".to_string(),
            ));
        }
        // the CONNECT packet carries keepalive as u16
        if broker.keepalive > u64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "broker.keepalive must be at most {} seconds",
                u16::MAX
            )));
        }
        if broker.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "broker.connect_attempts must be at least 1".to_string(),
            ));
        }
        if !(MIN_RETRY_INTERVAL..=MAX_RETRY_INTERVAL).contains(&broker.retry_interval_ms) {
            return Err(ConfigError::Invalid(format!(
                "broker.retry_interval_ms must be between {} and {} ms",
                MIN_RETRY_INTERVAL, MAX_RETRY_INTERVAL
            )));
        }

        let mut names = HashSet::new();
        for unit in self.units() {
            if unit.name().trim().is_empty() {
                return Err(ConfigError::Invalid("unit name must not be empty".to_string()));
            }
            if !names.insert(unit.name().to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "unit name '{}' is used more than once",
                    unit.name()
                )));
            }
        }

        if !self.units().iter().any(UnitConfig::enabled) {
            return Err(ConfigError::NoUnits);
        }

        Ok(())
    }

    /// All units, mqtt2rest first, in file order.
    pub fn units(&self) -> Vec<UnitConfig> {
        self.mqtt2rest
            .iter()
            .cloned()
            .map(UnitConfig::Mqtt2Rest)
            .chain(self.rest2mqtt.iter().cloned().map(UnitConfig::Rest2Mqtt))
            .collect()
    }
}
