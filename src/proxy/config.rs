//! Proxy configuration: a JSON document of four endpoints plus two knobs.
//!
//! Configs are immutable once loaded; a reload builds a whole new config,
//! validates it, and atomically swaps the reference held by the
//! coordinator. The old copy stays authoritative until that swap.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::addr::AddrSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Read(#[from] io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub uplink: AddrSpec,
    pub listen: AddrSpec,
    /// Pass-through listener, disabled when absent. Never carries an
    /// in-proxy password.
    pub listen_raw: AddrSpec,
    /// Admin HTTP endpoint, disabled when absent.
    pub admin: AddrSpec,
    pub read_time_limit_ms: u64,
    pub log_messages: bool,
}

impl Config {
    /// Validate the whole config, accumulating every problem found.
    /// Includes a one-shot reachability probe of the uplink.
    pub async fn prepare(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        self.uplink.prepare("uplink", false, &mut errors).await;
        self.listen.prepare("listen", true, &mut errors).await;
        if self.listen_raw.is_configured() {
            self.listen_raw.prepare("listen_raw", true, &mut errors).await;
            if self.listen_raw.has_pass() {
                errors.push("listen_raw does not support a password".into());
            }
        }
        if self.admin.is_configured() {
            self.admin.prepare("admin", true, &mut errors).await;
        }
        if errors.is_empty() {
            Ok(())
        } else {
            errors.sort();
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }

    /// The listen and admin endpoints are pinned for the process lifetime:
    /// a reload may only change the rest.
    pub fn validate_switch_to(&self, new: &Config) -> Result<(), ConfigError> {
        if self.listen != new.listen {
            return Err(ConfigError::Invalid(
                "reload cannot change the listen endpoint".into(),
            ));
        }
        if self.admin != new.admin {
            return Err(ConfigError::Invalid(
                "reload cannot change the admin endpoint".into(),
            ));
        }
        Ok(())
    }

    /// Copy with all passwords masked, safe to serialize for the admin
    /// surface.
    pub fn sanitized_for_publication(&self) -> Config {
        Config {
            uplink: self.uplink.sanitized(),
            listen: self.listen.sanitized(),
            listen_raw: self.listen_raw.sanitized(),
            admin: self.admin.sanitized(),
            read_time_limit_ms: self.read_time_limit_ms,
            log_messages: self.log_messages,
        }
    }
}

/// Source of candidate configurations. The coordinator asks it for a fresh
/// config on every reload.
pub trait ConfigLoader: Send + Sync {
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Re-reads a JSON file on every load.
pub struct FileConfigLoader {
    path: PathBuf,
}

impl FileConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigLoader { path: path.into() }
    }
}

impl ConfigLoader for FileConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Holds one parsed config. Used for stdin (which can only be read once)
/// and by tests that swap the config live.
pub struct StaticConfigLoader {
    config: Mutex<Config>,
}

impl StaticConfigLoader {
    pub fn new(config: Config) -> Self {
        StaticConfigLoader {
            config: Mutex::new(config),
        }
    }

    /// Parse a config from a reader (stdin).
    pub fn from_reader(mut reader: impl Read) -> Result<Self, ConfigError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Ok(Self::new(serde_json::from_str(&text)?))
    }

    /// Replace the held config; the proxy picks it up on the next reload.
    pub fn replace(&self, config: Config) {
        *self.config.lock().unwrap() = config;
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.config.lock().unwrap().clone())
    }
}
