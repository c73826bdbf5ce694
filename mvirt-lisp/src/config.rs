//! Daemon configuration.
//!
//! The TOML file is deserialized into `ConfigFile` and then validated into a
//! `Config`, which is the only form the rest of the daemon sees.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::eid::{EidPrefix, LocalEidEntry, Locator};
use crate::wire::{CONTROL_PORT, DATA_PORT, MAX_LOCATORS};

/// Default TUN device name.
pub const DEFAULT_TUN_NAME: &str = "lisp0";

/// Default path of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mvirt/lisp.toml";

/// Upper bound for the timer tick.
pub const MAX_TICK_MS: u64 = 60_000;

/// Upper bound for every timer given in seconds (one week).
pub const MAX_TIMER_SECS: u64 = 7 * 24 * 3600;

/// Upper bound for map-request attempts.
pub const MAX_REQUEST_ATTEMPTS: u32 = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("At least one local EID prefix is required")]
    EmptyDatabase,

    #[error("At least one map-resolver is required")]
    NoMapResolver,

    #[error("At least one map-server is required")]
    NoMapServer,

    #[error("Invalid EID prefix: {0}")]
    InvalidPrefix(String),

    #[error("EID prefix {0} has no locators")]
    NoLocators(String),

    #[error("Map-request attempts must be at least 1")]
    ZeroAttempts,

    #[error("Map-request attempts {0} exceeds the maximum of {max}", max = MAX_REQUEST_ATTEMPTS)]
    TooManyAttempts(u32),

    #[error("Timer value `{0}` must be greater than zero")]
    ZeroTimer(&'static str),

    #[error("Timer value `{name}` = {value} exceeds the maximum of {max}")]
    TimerTooLarge {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error("EID prefix {prefix} has {count} locators, at most {max} are supported", max = MAX_LOCATORS)]
    TooManyLocators { prefix: String, count: usize },

    #[error("Source RLOC {0} is not a locator of any local EID prefix")]
    UnknownSourceRloc(IpAddr),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration file as written by the operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
    /// RLOC used as ITR-RLOC in map-requests; defaults to the first locator.
    pub source_rloc: Option<IpAddr>,
    #[serde(default)]
    pub map_resolvers: Vec<IpAddr>,
    #[serde(default)]
    pub map_servers: Vec<IpAddr>,
    #[serde(default)]
    pub proxy_reply: bool,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    #[serde(default)]
    pub timers: TimersFile,
    #[serde(default)]
    pub database: Vec<DatabaseEntryFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimersFile {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub map_request_timeout_secs: u64,
    #[serde(default = "default_request_attempts")]
    pub map_request_attempts: u32,
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_secs: u64,
    #[serde(default = "default_register_interval")]
    pub map_register_interval_secs: u64,
    #[serde(default = "default_expire_interval")]
    pub expire_interval_secs: u64,
    #[serde(default = "default_register_ttl")]
    pub register_ttl_minutes: u32,
}

impl Default for TimersFile {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            map_request_timeout_secs: default_request_timeout(),
            map_request_attempts: default_request_attempts(),
            negative_ttl_secs: default_negative_ttl(),
            map_register_interval_secs: default_register_interval(),
            expire_interval_secs: default_expire_interval(),
            register_ttl_minutes: default_register_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseEntryFile {
    pub eid_prefix: String,
    pub locators: Vec<LocatorFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocatorFile {
    pub address: IpAddr,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_weight")]
    pub weight: u8,
}

fn default_tun_name() -> String {
    DEFAULT_TUN_NAME.to_string()
}
fn default_control_port() -> u16 {
    CONTROL_PORT
}
fn default_data_port() -> u16 {
    DATA_PORT
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    2
}
fn default_request_attempts() -> u32 {
    3
}
fn default_negative_ttl() -> u64 {
    60
}
fn default_register_interval() -> u64 {
    60
}
fn default_expire_interval() -> u64 {
    1
}
fn default_register_ttl() -> u32 {
    1440
}
fn default_priority() -> u8 {
    1
}
fn default_weight() -> u8 {
    100
}

/// Timer settings of the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// Period of the timer signal driving the scheduler.
    pub tick: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub negative_ttl: Duration,
    pub register_interval: Duration,
    pub expire_interval: Duration,
    /// TTL advertised for local mappings in map-registers and map-replies.
    pub register_ttl_minutes: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(default_tick_ms()),
            request_timeout: Duration::from_secs(default_request_timeout()),
            max_attempts: default_request_attempts(),
            negative_ttl: Duration::from_secs(default_negative_ttl()),
            register_interval: Duration::from_secs(default_register_interval()),
            expire_interval: Duration::from_secs(default_expire_interval()),
            register_ttl_minutes: default_register_ttl(),
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub tun_name: String,
    pub source_rloc: IpAddr,
    pub map_resolvers: Vec<IpAddr>,
    pub map_servers: Vec<IpAddr>,
    pub proxy_reply: bool,
    pub control_port: u16,
    pub data_port: u16,
    pub timers: TimerConfig,
    pub database: Vec<LocalEidEntry>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        Self::try_from(file)
    }
}

impl TryFrom<ConfigFile> for Config {
    type Error = ConfigError;

    fn try_from(file: ConfigFile) -> Result<Self> {
        if file.map_resolvers.is_empty() {
            return Err(ConfigError::NoMapResolver);
        }
        if file.map_servers.is_empty() {
            return Err(ConfigError::NoMapServer);
        }
        if file.database.is_empty() {
            return Err(ConfigError::EmptyDatabase);
        }

        let mut database = Vec::with_capacity(file.database.len());
        for entry in &file.database {
            let prefix: EidPrefix = entry
                .eid_prefix
                .parse()
                .map_err(|_| ConfigError::InvalidPrefix(entry.eid_prefix.clone()))?;
            if entry.locators.is_empty() {
                return Err(ConfigError::NoLocators(entry.eid_prefix.clone()));
            }
            if entry.locators.len() > MAX_LOCATORS {
                return Err(ConfigError::TooManyLocators {
                    prefix: entry.eid_prefix.clone(),
                    count: entry.locators.len(),
                });
            }
            let locators = entry
                .locators
                .iter()
                .map(|l| Locator::new(l.address, l.priority, l.weight))
                .collect();
            database.push(LocalEidEntry::new(prefix, locators));
        }

        let source_rloc = match file.source_rloc {
            Some(rloc) => {
                let known = database
                    .iter()
                    .flat_map(|e| e.locators.iter())
                    .any(|l| l.address == rloc);
                if !known {
                    return Err(ConfigError::UnknownSourceRloc(rloc));
                }
                rloc
            }
            // Non-empty: checked above.
            None => database[0].locators[0].address,
        };

        let t = &file.timers;
        if t.map_request_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if t.map_request_attempts > MAX_REQUEST_ATTEMPTS {
            return Err(ConfigError::TooManyAttempts(t.map_request_attempts));
        }
        for (name, value, max) in [
            ("tick_ms", t.tick_ms, MAX_TICK_MS),
            ("map_request_timeout_secs", t.map_request_timeout_secs, MAX_TIMER_SECS),
            ("negative_ttl_secs", t.negative_ttl_secs, MAX_TIMER_SECS),
            ("map_register_interval_secs", t.map_register_interval_secs, MAX_TIMER_SECS),
            ("expire_interval_secs", t.expire_interval_secs, MAX_TIMER_SECS),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimer(name));
            }
            if value > max {
                return Err(ConfigError::TimerTooLarge { name, value, max });
            }
        }

        Ok(Config {
            tun_name: file.tun_name,
            source_rloc,
            map_resolvers: file.map_resolvers,
            map_servers: file.map_servers,
            proxy_reply: file.proxy_reply,
            control_port: file.control_port,
            data_port: file.data_port,
            timers: TimerConfig {
                tick: Duration::from_millis(t.tick_ms),
                request_timeout: Duration::from_secs(t.map_request_timeout_secs),
                max_attempts: t.map_request_attempts,
                negative_ttl: Duration::from_secs(t.negative_ttl_secs),
                register_interval: Duration::from_secs(t.map_register_interval_secs),
                expire_interval: Duration::from_secs(t.expire_interval_secs),
                register_ttl_minutes: t.register_ttl_minutes,
            },
            database,
        })
    }
}
