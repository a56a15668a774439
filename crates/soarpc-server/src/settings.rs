//! Server settings, loaded from a TOML/JSON/YAML file.

use serde::Deserialize;
use soarpc_common::transport::redis::RedisTransportSettings;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Names the settings file when no `--settings` argument is given.
pub const SETTINGS_ENV: &str = "SOARPC_SETTINGS";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot load settings: {0}")]
    Load(String),
}

/// Per-request watchdog configuration. A zero `timeout` disables it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarakiriSettings {
    /// Seconds a single request may run before the worker is terminated.
    pub timeout: u64,
    /// Seconds allowed for graceful shutdown before hard termination.
    pub shutdown_grace: u64,
}

impl Default for HarakiriSettings {
    fn default() -> Self {
        Self { timeout: 300, shutdown_grace: 30 }
    }
}

/// Auto-reload file watcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileWatcherSettings {
    /// Directories or files to watch for changes.
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    300
}

/// Everything a server process is configured with.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// The service's inbound transport.
    pub transport: RedisTransportSettings,
    pub harakiri: HarakiriSettings,
    /// Liveness file path template; `{pid}` and `{fid}` are substituted.
    pub heartbeat_file: Option<String>,
    /// Field names to redact from logged payloads, in addition to the
    /// built-in set.
    pub extra_fields_to_redact: Vec<String>,
    /// Outbound transports for the nested client handlers receive, keyed
    /// by service name.
    pub client_routing: HashMap<String, RedisTransportSettings>,
    /// When present (and enabled on the command line), watch these paths
    /// and reload on change.
    pub file_watcher: Option<FileWatcherSettings>,
}

impl ServerSettings {
    /// Loads settings from a TOML, JSON, or YAML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| SettingsError::Load(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SettingsError::Load(e.to_string()))
    }
}

/// The settings file named by the environment, if any.
pub fn settings_path_from_env() -> Option<PathBuf> {
    std::env::var_os(SETTINGS_ENV).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ServerSettings::default();
        assert_eq!(settings.harakiri.timeout, 300);
        assert_eq!(settings.harakiri.shutdown_grace, 30);
        assert!(settings.heartbeat_file.is_none());
        assert!(settings.client_routing.is_empty());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!(
            "soarpc-settings-{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"
heartbeat_file = "/tmp/service-{pid}-{fid}.heartbeat"
extra_fields_to_redact = ["ssn"]

[harakiri]
timeout = 60
shutdown_grace = 10

[transport]
hosts = ["redis://redis.internal:6379/0"]
queue_capacity = 5000

[client_routing.user]
hosts = ["redis://redis.internal:6379/0"]
"#,
        )
        .unwrap();

        let settings = ServerSettings::load(&path).unwrap();
        assert_eq!(settings.harakiri.timeout, 60);
        assert_eq!(settings.transport.queue_capacity, 5000);
        assert_eq!(settings.extra_fields_to_redact, vec!["ssn".to_owned()]);
        assert!(settings.client_routing.contains_key("user"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let path = std::env::temp_dir().join(format!(
            "soarpc-settings-bad-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "not_a_real_setting = true\n").unwrap();
        assert!(ServerSettings::load(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
