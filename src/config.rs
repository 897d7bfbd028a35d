use crate::error::{ResmutexError, Result};
use crate::locking::timeout::{
    LockTimeoutResolution, LockTimeoutResolver, LockTimeoutValue, parse_timeout_override,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "resmutex.toml";
pub const DEFAULT_TIMEOUT_ENV: &str = "RESMUTEX_DEFAULT_TIMEOUT";
const DEFAULT_TIMEOUT: &str = "infinite";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ResmutexConfig {
    #[serde(default)]
    pub locking: LockingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockingConfig {
    /// Hold budget for requests that do not pass their own timeout.
    #[serde(default = "default_timeout")]
    pub default_timeout: String,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> String {
    DEFAULT_TIMEOUT.to_string()
}

impl LockingConfig {
    pub fn default_timeout_value(&self) -> Result<LockTimeoutValue> {
        Ok(parse_timeout_override(&self.default_timeout)?)
    }

    /// Resolves the effective default timeout with CLI > env > config > default precedence.
    pub fn resolve_default_timeout(
        &self,
        cli_override: Option<&str>,
    ) -> Result<LockTimeoutResolution> {
        let env_override = env::var(DEFAULT_TIMEOUT_ENV).ok();
        let resolution = LockTimeoutResolver::new(
            cli_override,
            env_override.as_deref(),
            self.default_timeout_value()?,
            LockTimeoutValue::Infinite,
        )
        .resolve()?;
        Ok(resolution)
    }
}

impl ResmutexConfig {
    /// Loads `resmutex.toml` from `dir`, falling back to defaults when it is absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            log::debug!("Config file not found at {config_path:?}, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ResmutexConfig = toml::from_str(&contents).map_err(|e| {
            ResmutexError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.locking.default_timeout_value()?;

        log::debug!("Loaded config from {path:?}");
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ResmutexError::ConfigError(format!("Failed to serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::LockTimeoutSource;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ResmutexConfig::default();
        assert_eq!(config.locking.default_timeout, "infinite");
        assert!(
            config
                .locking
                .default_timeout_value()
                .unwrap()
                .is_infinite()
        );
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = ResmutexConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config, ResmutexConfig::default());
    }

    #[test]
    fn test_load_locking_section() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            r#"
[locking]
default_timeout = "750ms"
"#,
        )
        .unwrap();

        let loaded = ResmutexConfig::load(temp_dir.path()).unwrap();
        assert_eq!(
            loaded.locking.default_timeout_value().unwrap().as_option(),
            Some(Duration::from_millis(750))
        );
    }

    #[test]
    fn test_invalid_timeout_is_rejected_on_load() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            "[locking]\ndefault_timeout = \"whenever\"\n",
        )
        .unwrap();

        let err = ResmutexConfig::load(temp_dir.path()).unwrap_err();
        assert!(matches!(err, ResmutexError::InvalidTimeout(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "[locking").unwrap();

        let err = ResmutexConfig::load(temp_dir.path()).unwrap_err();
        assert!(matches!(err, ResmutexError::ConfigError(_)));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_config() {
        let config = LockingConfig {
            default_timeout: "10s".to_string(),
        };

        unsafe { env::set_var(DEFAULT_TIMEOUT_ENV, "2s") };
        let resolution = config.resolve_default_timeout(None).unwrap();
        unsafe { env::remove_var(DEFAULT_TIMEOUT_ENV) };

        assert_eq!(resolution.source, LockTimeoutSource::Environment);
        assert_eq!(resolution.value, LockTimeoutValue::from_secs(2));
    }

    #[test]
    #[serial]
    fn test_cli_overrides_environment() {
        let config = LockingConfig::default();

        unsafe { env::set_var(DEFAULT_TIMEOUT_ENV, "2s") };
        let resolution = config.resolve_default_timeout(Some("infinite")).unwrap();
        unsafe { env::remove_var(DEFAULT_TIMEOUT_ENV) };

        assert_eq!(resolution.source, LockTimeoutSource::Cli);
        assert!(resolution.value.is_infinite());
    }

    #[test]
    #[serial]
    fn test_config_value_used_without_overrides() {
        unsafe { env::remove_var(DEFAULT_TIMEOUT_ENV) };
        let config = LockingConfig {
            default_timeout: "3".to_string(),
        };

        let resolution = config.resolve_default_timeout(None).unwrap();
        assert_eq!(resolution.source, LockTimeoutSource::Config);
        assert_eq!(resolution.value, LockTimeoutValue::from_secs(3));
    }
}
