use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{MemoError, Result};

pub const DEFAULT_KEY_PREFIX: &str = "memo_app_";
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Whole credential values that ship in templates and demos.
const PLACEHOLDER_VALUES: &[&str] = &[
    "demo-project",
    "demo-api-key",
    "placeholder",
    "changeme",
    "https://example.com",
    "http://example.com",
];

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memosync")
}

/// Local key-value storage settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Prefix applied to every key this application writes
    pub key_prefix: String,
    /// Assumed quota ceiling for usage reporting and write rejection
    pub quota_bytes: u64,
    /// JSON file backing the key-value store
    pub data_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            data_file: default_data_dir().join("store.json"),
        }
    }
}

/// Remote document store connection settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub api_key: String,
    pub project_id: String,
    pub collection: String,
    /// How often the HTTP backend polls for remote changes
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Mirror local note writes to the remote store
    pub mirror_writes: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            endpoint: String::new(),
            api_key: String::new(),
            project_id: String::new(),
            collection: "memos".to_string(),
            poll_interval_secs: 15,
            request_timeout_secs: 30,
            mirror_writes: true,
        }
    }
}

impl RemoteConfig {
    fn looks_like_placeholder(value: &str) -> bool {
        let lowered = value.trim().trim_end_matches('/').to_ascii_lowercase();
        PLACEHOLDER_VALUES.contains(&lowered.as_str())
            || lowered.starts_with("your-")
            || lowered.starts_with("your_")
            || lowered.starts_with('<')
            || lowered.chars().all(|c| c == 'x')
    }

    /// Fails when credentials are missing or are template values.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("endpoint", &self.endpoint),
            ("api key", &self.api_key),
            ("project id", &self.project_id),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(MemoError::RemoteNotConfigured {
                    message: format!("{} is missing", name),
                });
            }
            if Self::looks_like_placeholder(value) {
                return Err(MemoError::RemoteNotConfigured {
                    message: format!("{} is a placeholder value", name),
                });
            }
        }
        if self.collection.trim().is_empty() {
            return Err(MemoError::RemoteNotConfigured {
                message: "collection name is missing".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.validate().is_ok()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub default_max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            default_max_results: 20,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory for backups
    pub backup_dir: PathBuf,
    /// Maximum number of backups to keep, 0 keeps all
    pub max_backups: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            backup_dir: default_data_dir().join("backups"),
            max_backups: 10,
        }
    }
}

/// Application configuration settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub remote: RemoteConfig,
    pub search: SearchConfig,
    pub backup: BackupConfig,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            remote: RemoteConfig::default(),
            search: SearchConfig::default(),
            backup: BackupConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.json")
    }

    /// Loads the configuration at `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let text = fs::read_to_string(path)?;
        let config = serde_json::from_str(&text).map_err(|e| MemoError::ConfigError {
            message: format!("{}: {}", path.display(), e),
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Writes the configuration atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut temp_file = NamedTempFile::new_in(dir)?;
        temp_file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        temp_file.flush()?;
        temp_file
            .persist(path)
            .map_err(|e| MemoError::Io(e.error))?;

        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Overlays values from `MEMOSYNC_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("MEMOSYNC_REMOTE_ENDPOINT") {
            self.remote.endpoint = endpoint;
        }
        if let Some(api_key) = lookup("MEMOSYNC_REMOTE_API_KEY") {
            self.remote.api_key = api_key;
        }
        if let Some(project_id) = lookup("MEMOSYNC_REMOTE_PROJECT_ID") {
            self.remote.project_id = project_id;
        }
        if let Some(level) = lookup("MEMOSYNC_LOG_LEVEL") {
            if level.trim().is_empty() {
                warn!("Ignoring empty MEMOSYNC_LOG_LEVEL");
            } else {
                self.log_level = level;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn configured() -> RemoteConfig {
        RemoteConfig {
            endpoint: "https://docs.internal.test".into(),
            api_key: "k-8c1f0e".into(),
            project_id: "memo-prod".into(),
            ..Default::default()
        }
    }

    #[test]
    fn remote_validation_rejects_missing_and_placeholder_values() {
        assert!(configured().validate().is_ok());

        let missing = RemoteConfig::default();
        assert!(matches!(
            missing.validate(),
            Err(MemoError::RemoteNotConfigured { .. })
        ));

        let demo = RemoteConfig {
            api_key: "your-api-key".into(),
            ..configured()
        };
        assert!(!demo.is_configured());

        for template in ["https://example.com/", "XXXX", "<api-key>", "your_project"] {
            let templated = RemoteConfig {
                endpoint: template.into(),
                ..configured()
            };
            assert!(!templated.is_configured(), "{template} accepted");
        }
    }

    #[test]
    fn real_values_containing_template_words_are_accepted() {
        let config = RemoteConfig {
            endpoint: "https://docs.example.com".into(),
            api_key: "k-9xxx1f".into(),
            project_id: "memo-prod".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_missing_file_gives_defaults_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::load(&path).unwrap();
        assert_eq!(config.storage.key_prefix, DEFAULT_KEY_PREFIX);

        config.search.default_max_results = 5;
        config.remote = configured();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.search.default_max_results, 5);
        assert_eq!(loaded.remote.project_id, "memo-prod");
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "search": { "default_max_results": 7 } }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.search.default_max_results, 7);
        assert_eq!(config.storage.quota_bytes, DEFAULT_QUOTA_BYTES);
        assert_eq!(config.remote.collection, "memos");
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("MEMOSYNC_REMOTE_API_KEY", "k-live"),
            ("MEMOSYNC_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.remote.api_key, "k-live");
        assert_eq!(config.log_level, "debug");
        assert!(config.remote.endpoint.is_empty());
    }
}
