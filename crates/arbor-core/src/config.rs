//! Store configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/arbor/config.toml)
//! 3. Environment variables (ARBOR_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Environment variable prefix
const ENV_PREFIX: &str = "ARBOR";

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Size budget of each name cache, in bytes of name text plus overhead
    #[serde(default = "default_name_cache_size")]
    pub name_cache_size: usize,

    /// Idle connections kept by a connection pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Raw values at least this long are interned on write (0 disables)
    #[serde(default = "default_intern_threshold")]
    pub intern_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            name_cache_size: default_name_cache_size(),
            pool_size: default_pool_size(),
            intern_threshold: default_intern_threshold(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (ARBOR_DATA_DIR, ARBOR_NAME_CACHE_SIZE,
    ///    ARBOR_POOL_SIZE, ARBOR_INTERN_THRESHOLD)
    /// 2. Config file (~/.config/arbor/config.toml or ARBOR_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }
        env_number("NAME_CACHE_SIZE", &mut self.name_cache_size);
        env_number("POOL_SIZE", &mut self.pool_size);
        env_number("INTERN_THRESHOLD", &mut self.intern_threshold);
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with ARBOR_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("arbor")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("arbor.db")
    }
}

/// Overwrite `target` from `ARBOR_<name>` when it parses
fn env_number<T: FromStr>(name: &str, target: &mut T) {
    let key = format!("{}_{}", ENV_PREFIX, name);
    if let Ok(val) = std::env::var(&key) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("Ignoring {}={:?}: not a number", key, val),
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("arbor")
}

fn default_name_cache_size() -> usize {
    256 * 1024
}

fn default_pool_size() -> usize {
    4
}

fn default_intern_threshold() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "ARBOR_DATA_DIR",
        "ARBOR_NAME_CACHE_SIZE",
        "ARBOR_POOL_SIZE",
        "ARBOR_INTERN_THRESHOLD",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.data_dir.ends_with("arbor"));
        assert!(config.name_cache_size > 0);
        assert!(config.pool_size > 0);
        assert_eq!(config.intern_threshold, 1024);
    }

    #[test]
    fn test_database_path() {
        let config = Config::default();
        assert!(config.database_path().ends_with("arbor.db"));
        assert!(config.database_path().starts_with(&config.data_dir));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("ARBOR_DATA_DIR", "/tmp/arbor-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/arbor-test"));
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("ARBOR_POOL_SIZE", "9");
        env::set_var("ARBOR_INTERN_THRESHOLD", " 0 ");
        config.apply_env_overrides();
        assert_eq!(config.pool_size, 9);
        assert_eq!(config.intern_threshold, 0);

        // Unparseable values leave the setting alone
        env::set_var("ARBOR_NAME_CACHE_SIZE", "lots");
        let before = config.name_cache_size;
        config.apply_env_overrides();
        assert_eq!(config.name_cache_size, before);
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/arbor"),
            name_cache_size: 4096,
            pool_size: 2,
            intern_threshold: 64,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("intern_threshold"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_str_fills_defaults() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config::load_from_str(r#"data_dir = "/custom/data""#).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.pool_size, default_pool_size());
        assert_eq!(config.name_cache_size, default_name_cache_size());
    }

    #[test]
    fn test_load_from_path() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let path = dir.path().join("config.toml");

        let config = Config {
            data_dir: data_dir.clone(),
            pool_size: 3,
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        env::set_var("ARBOR_POOL_SIZE", "5");
        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.data_dir, data_dir);
        assert_eq!(loaded.pool_size, 5);
        assert!(data_dir.exists());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::TempDir::new().unwrap();
        env::set_var("ARBOR_DATA_DIR", dir.path().join("fresh"));

        let config = Config::load_from_path(Path::new("/nonexistent/config.toml")).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config.pool_size, default_pool_size());
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let _guard = EnvGuard::new(ENV_VARS);
        assert!(Config::load_from_str("pool_size = \"four\"").is_err());
    }
}
