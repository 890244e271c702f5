//! INI file configuration adapter.
//!
//! Values can be overridden from the environment, which is how broker
//! credentials are usually supplied.

use std::collections::HashMap;
use std::path::Path;

use configparser::ini::Ini;

use crate::domain::error::TraderError;
use crate::ports::config_port::ConfigPort;

/// `(section, key, environment variable)` pairs applied by
/// [`FileConfigAdapter::with_env_overrides`].
pub const ENV_OVERRIDES: &[(&str, &str, &str)] = &[
    ("alpaca", "key_id", "APCA_API_KEY_ID"),
    ("alpaca", "secret_key", "APCA_API_SECRET_KEY"),
];

pub struct FileConfigAdapter {
    config: Ini,
    overrides: HashMap<(String, String), String>,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TraderError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config.load(path).map_err(|reason| TraderError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self {
            config,
            overrides: HashMap::new(),
        })
    }

    pub fn from_string(content: &str) -> Result<Self, TraderError> {
        let mut config = Ini::new();
        config
            .read(content.to_string())
            .map_err(|reason| TraderError::ConfigParse {
                file: "<string>".to_string(),
                reason,
            })?;
        Ok(Self {
            config,
            overrides: HashMap::new(),
        })
    }

    /// Apply [`ENV_OVERRIDES`] from the process environment.
    pub fn with_env_overrides(self) -> Self {
        ENV_OVERRIDES
            .iter()
            .fold(self, |adapter, (section, key, var)| match std::env::var(var) {
                Ok(value) if !value.trim().is_empty() => adapter.with_override(section, key, value),
                _ => adapter,
            })
    }

    pub fn with_override(mut self, section: &str, key: &str, value: impl Into<String>) -> Self {
        self.overrides
            .insert((section.to_lowercase(), key.to_lowercase()), value.into());
        self
    }

    fn lookup(&self, section: &str, key: &str) -> Option<String> {
        self.overrides
            .get(&(section.to_lowercase(), key.to_lowercase()))
            .cloned()
            .or_else(|| self.config.get(section, key))
    }

    fn parse_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => None,
        }
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.lookup(section, key)
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.lookup(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        self.lookup(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.lookup(section, key)
            .as_deref()
            .and_then(Self::parse_bool)
            .unwrap_or(default)
    }
}
