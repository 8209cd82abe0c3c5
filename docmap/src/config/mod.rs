//! Connection and policy configuration.
//!
//! A [`Config`] is built once and handed to [`crate::Session::open`]. The
//! process-wide slot behind [`set_global`]/[`global`] is set once by binaries
//! and read by [`crate::Session::open_global`].

use crate::error::{DocMapError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

const ENV_PREFIX: &str = "DOCMAP_";

static GLOBAL: OnceLock<Config> = OnceLock::new();

/// Transport security settings passed through to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_certs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(with = "timeout_secs")]
    pub timeout: Duration,
    pub tls: Option<TlsConfig>,
    /// Mark records with `deleted_at` instead of removing them.
    pub soft_delete: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".into(),
            port: 28015,
            user: "admin".into(),
            password: String::new(),
            database: "test".into(),
            timeout: Duration::from_secs(20),
            tls: None,
            soft_delete: false,
        }
    }
}

impl Config {
    /// Defaults overridden by any `DOCMAP_*` environment variable that is set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PORT") {
            config.port = port
                .parse()
                .map_err(|_| DocMapError::Config(format!("Invalid port '{port}'")))?;
        }
        if let Some(user) = lookup("USER") {
            config.user = user;
        }
        if let Some(password) = lookup("PASSWORD") {
            config.password = password;
        }
        if let Some(database) = lookup("DBNAME") {
            config.database = database;
        }
        if let Some(timeout) = lookup("TIMEOUT") {
            let secs: u64 = timeout
                .parse()
                .map_err(|_| DocMapError::Config(format!("Invalid timeout '{timeout}'")))?;
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(flag) = lookup("SOFT_DELETE") {
            config.soft_delete = is_truthy(&flag);
        }

        Ok(config)
    }

    /// Parse a YAML configuration; missing keys keep their defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_soft_delete(mut self, soft_delete: bool) -> Self {
        self.soft_delete = soft_delete;
        self
    }

    fn check(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(DocMapError::Config("database name cannot be empty".into()));
        }
        Ok(())
    }
}

/// Install the process-wide default. Only the first call succeeds.
pub fn set_global(config: Config) -> Result<()> {
    config.check()?;
    GLOBAL
        .set(config)
        .map_err(|_| DocMapError::Config("global configuration is already set".into()))
}

/// The process-wide default, or [`Config::default`] when none was installed.
pub fn global() -> Config {
    GLOBAL.get().cloned().unwrap_or_default()
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "y" | "1"
    )
}

mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
