//! Layered configuration loading and the user credential store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failures while loading configuration or credentials.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("credential store {path}: {source}")]
    CredentialIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("credential store {path} is not valid TOML: {source}")]
    CredentialFormat {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeConfigSection,
    #[serde(default)]
    pub data_source: HashMap<String, AdapterConfig>,
    #[serde(default)]
    pub broker: HashMap<String, AdapterConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_path: None,
            control_addr: default_control_addr(),
            upload_dir: default_upload_dir(),
            credentials_path: default_credentials_path(),
            runtime: RuntimeConfigSection::default(),
            data_source: HashMap::new(),
            broker: HashMap::new(),
        }
    }
}

/// Driver name plus the opaque payload forwarded to the adapter factory.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AdapterConfig {
    pub driver: String,
    #[serde(default)]
    pub params: Value,
}

/// Knobs for the runtime's timeouts and defaults.
#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfigSection {
    #[serde(default = "default_evaluator_timeout_secs")]
    pub evaluator_timeout_secs: u64,
    #[serde(default = "default_warmup_timeout_secs")]
    pub warmup_timeout_secs: u64,
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_broker_rpc_timeout_secs")]
    pub broker_rpc_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub order_poll_interval_secs: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_account_equity")]
    pub default_account_equity: Decimal,
    #[serde(default)]
    pub short_selling: bool,
}

impl Default for RuntimeConfigSection {
    fn default() -> Self {
        Self {
            evaluator_timeout_secs: default_evaluator_timeout_secs(),
            warmup_timeout_secs: default_warmup_timeout_secs(),
            settle_delay_secs: default_settle_delay_secs(),
            broker_rpc_timeout_secs: default_broker_rpc_timeout_secs(),
            order_poll_interval_secs: default_poll_interval_secs(),
            max_consecutive_errors: default_max_consecutive_errors(),
            default_account_equity: default_account_equity(),
            short_selling: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_control_addr() -> String {
    "127.0.0.1:8400".to_string()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./strategies")
}

fn default_credentials_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".stratequeue").join("credentials.toml")
}

fn default_evaluator_timeout_secs() -> u64 {
    5
}

fn default_warmup_timeout_secs() -> u64 {
    60
}

fn default_settle_delay_secs() -> u64 {
    2
}

fn default_broker_rpc_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_account_equity() -> Decimal {
    Decimal::from(100_000)
}

/// Load configuration from `config/default.toml`, `config/{env}.toml`, and
/// `STRATEQUEUE_*` environment overrides, in that order.
pub fn load_config(env: &str) -> ConfigResult<AppConfig> {
    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{env}")).required(false))
        .add_source(Environment::with_prefix("STRATEQUEUE").separator("__"))
        .build()?;
    Ok(config.try_deserialize()?)
}

/// Key/value credential file owned by the user. Written atomically and kept
/// at mode 0600; values never appear in logs.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every stored credential. A missing file is an empty store.
    pub fn load(&self) -> ConfigResult<HashMap<String, String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(ConfigError::CredentialIo {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };
        toml::from_str(&raw).map_err(|err| ConfigError::CredentialFormat {
            path: self.path.clone(),
            source: err,
        })
    }

    /// Fetch one credential.
    pub fn get(&self, key: &str) -> ConfigResult<Option<String>> {
        Ok(self.load()?.get(key).cloned())
    }

    /// Insert or replace a credential.
    pub fn set(&self, key: &str, value: &str) -> ConfigResult<()> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    /// Merge several credentials in one write.
    pub fn set_many(&self, values: &HashMap<String, String>) -> ConfigResult<()> {
        let mut entries = self.load()?;
        for (key, value) in values {
            entries.insert(key.clone(), value.clone());
        }
        self.persist(&entries)
    }

    /// Delete a credential; missing keys are fine.
    pub fn remove(&self, key: &str) -> ConfigResult<()> {
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn persist(&self, entries: &HashMap<String, String>) -> ConfigResult<()> {
        let io_err = |source| ConfigError::CredentialIo {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let rendered =
            toml::to_string_pretty(entries).expect("string map always serializes to TOML");
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, rendered).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        tracing::debug!(path = %self.path.display(), "credentials updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("credentials.toml"));
        assert!(store.load().unwrap().is_empty());
        assert!(store.get("alpaca_key").unwrap().is_none());
    }

    #[test]
    fn set_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("credentials.toml"));
        store.set("alpaca_key", "abc123").unwrap();
        store.set("alpaca_secret", "shh").unwrap();
        assert_eq!(store.get("alpaca_key").unwrap().as_deref(), Some("abc123"));
        store.remove("alpaca_key").unwrap();
        assert!(store.get("alpaca_key").unwrap().is_none());
        assert_eq!(store.get("alpaca_secret").unwrap().as_deref(), Some("shh"));
    }

    #[cfg(unix)]
    #[test]
    fn credential_file_is_user_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("credentials.toml"));
        store.set("key", "value").unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn updates_replace_atomically() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("credentials.toml"));
        store.set("key", "first").unwrap();
        store.set("key", "second").unwrap();
        assert_eq!(store.get("key").unwrap().as_deref(), Some("second"));
        // No stray temp file left behind.
        assert!(!dir.path().join("credentials.tmp").exists());
    }

    #[test]
    fn runtime_defaults_match_contract() {
        let section = RuntimeConfigSection::default();
        assert_eq!(section.evaluator_timeout_secs, 5);
        assert_eq!(section.warmup_timeout_secs, 60);
        assert_eq!(section.broker_rpc_timeout_secs, 10);
        assert_eq!(section.order_poll_interval_secs, 1);
        assert_eq!(section.max_consecutive_errors, 5);
    }
}
