//! Runtime configuration.
//!
//! Loaded from TOML. Every field has a default so an empty file is a valid
//! configuration:
//!
//! ```toml
//! module_dir = "modules"
//! tmp_dir = "tmp"
//! load = ["auth_crypt", "m_cloak"]
//! retry_interval_secs = 10
//! max_delayed_attempts = 30
//!
//! [[auth]]
//! name = "opers"
//! password = "$2b$04$..."
//! methods = ["crypt"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default values.
pub mod defaults {
    pub const MODULE_DIR: &str = "modules";
    pub const TMP_DIR: &str = "tmp";
    pub const RETRY_INTERVAL_SECS: u64 = 10;
    pub const MAX_DELAYED_ATTEMPTS: u32 = 30;
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG: &str = "MODHOST_CONFIG";
    pub const LOG_JSON: &str = "MODHOST_LOG_JSON";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory searched for extensions named without a path.
    pub module_dir: PathBuf,
    /// Suffix appended to bare extension names.
    pub module_suffix: String,
    /// Scratch directory for private copies of native binaries.
    pub tmp_dir: PathBuf,
    /// Extensions loaded by [`Runtime::start`](crate::runtime::Runtime::start).
    pub load: Vec<String>,
    /// Seconds between delayed-unload retries.
    pub retry_interval_secs: u64,
    /// Retries before a delayed unload is reported as stuck.
    pub max_delayed_attempts: u32,
    pub auth: Vec<AuthConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            module_dir: PathBuf::from(defaults::MODULE_DIR),
            module_suffix: std::env::consts::DLL_SUFFIX.to_string(),
            tmp_dir: PathBuf::from(defaults::TMP_DIR),
            load: Vec::new(),
            retry_interval_secs: defaults::RETRY_INTERVAL_SECS,
            max_delayed_attempts: defaults::MAX_DELAYED_ATTEMPTS,
            auth: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }
}

/// A password block, as used by oper and link configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub name: String,
    pub password: Option<String>,
    pub methods: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.module_dir, PathBuf::from("modules"));
        assert_eq!(config.retry_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_full_config() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            module_dir = "/usr/lib/modhost"
            load = ["auth_crypt", "m_cloak"]
            retry_interval_secs = 0
            max_delayed_attempts = 3

            [[auth]]
            name = "opers"
            password = "secret"
            methods = ["crypt"]
            "#,
        )
        .unwrap();
        assert_eq!(config.load, vec!["auth_crypt", "m_cloak"]);
        assert_eq!(config.max_delayed_attempts, 3);
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.auth.len(), 1);
        assert_eq!(config.auth[0].methods, vec!["crypt"]);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = RuntimeConfig::from_toml_str("load = 3").unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modhost.toml");
        std::fs::write(&path, "tmp_dir = \"scratch\"\n").unwrap();
        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.tmp_dir, PathBuf::from("scratch"));
    }
}
