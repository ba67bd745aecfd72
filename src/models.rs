use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Connection settings shared by every unit talking to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Keepalive in seconds, also drives the unit poll timeout.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub cafile: Option<PathBuf>,
    #[serde(default)]
    pub capath: Option<PathBuf>,
    #[serde(default)]
    pub certfile: Option<PathBuf>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,

    #[serde(default)]
    pub user_pw: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub pw: Option<String>,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    30
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    2000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keepalive: default_keepalive(),
            tls: false,
            cafile: None,
            capath: None,
            certfile: None,
            keyfile: None,
            user_pw: false,
            user: None,
            pw: None,
            connect_attempts: default_connect_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl BrokerConfig {
    /// Wait bound of one unit loop iteration: half the keepalive.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive / 2 * 1000)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// A unit forwarding everything below `mqtt_topic` to a REST service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mqtt2RestUnitConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_webservice_baseurl")]
    pub webservice_baseurl: String,
    #[serde(default = "default_topic")]
    pub mqtt_topic: String,
    /// No timeout when unset: a stalled endpoint stalls the unit.
    #[serde(default)]
    pub webservice_timeout_ms: Option<u64>,
}

/// A unit accepting POST requests and publishing their bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rest2MqttUnitConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub mqtt_topic_root: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_webservice_baseurl() -> String {
    "localhost".to_string()
}

fn default_topic() -> String {
    "default_topic".to_string()
}

fn default_listen_port() -> u16 {
    8888
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Mqtt2Rest,
    Rest2Mqtt,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKind::Mqtt2Rest => write!(f, "mqtt2rest"),
            UnitKind::Rest2Mqtt => write!(f, "rest2mqtt"),
        }
    }
}

/// One configured unit of either direction.
#[derive(Debug, Clone)]
pub enum UnitConfig {
    Mqtt2Rest(Mqtt2RestUnitConfig),
    Rest2Mqtt(Rest2MqttUnitConfig),
}

impl UnitConfig {
    pub fn name(&self) -> &str {
        match self {
            UnitConfig::Mqtt2Rest(unit) => &unit.name,
            UnitConfig::Rest2Mqtt(unit) => &unit.name,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            UnitConfig::Mqtt2Rest(unit) => unit.enabled,
            UnitConfig::Rest2Mqtt(unit) => unit.enabled,
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            UnitConfig::Mqtt2Rest(_) => UnitKind::Mqtt2Rest,
            UnitConfig::Rest2Mqtt(_) => UnitKind::Rest2Mqtt,
        }
    }
}
