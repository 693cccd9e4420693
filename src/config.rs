//! Configuration loading and persistence.
//!
//! Reads `config.json` from the vrms config directory, applies `VRMS_*`
//! environment overrides, and falls back to defaults when no file exists.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{
    DEFAULT_HEAD_TRACKER_POLL, DEFAULT_HOTPLUG_POLL, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_OBJECTS_PER_SCENE, DEFAULT_SCRIPT_TICK,
};
use crate::server::ServerConfig;

/// Configuration for the vrms server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listening socket path. Defaults to [`default_socket_path`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Seconds of silence before a connection is closed. `0` disables.
    pub idle_timeout_secs: u64,
    /// Live objects allowed per scene.
    pub max_objects_per_scene: usize,
    /// Background modules.
    pub modules: ModulesConfig,
    /// Append log output here instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            max_objects_per_scene: DEFAULT_MAX_OBJECTS_PER_SCENE,
            modules: ModulesConfig::default(),
            log_file: None,
        }
    }
}

/// Which built-in modules run, and how.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ModulesConfig {
    /// Pose record source. Head tracking is off when unset.
    pub head_tracker_device: Option<PathBuf>,
    /// Head tracker poll interval in milliseconds.
    pub head_tracker_poll_ms: u64,
    /// DRM directory to watch. Hotplug is off when unset.
    pub hotplug_dir: Option<PathBuf>,
    /// Hotplug rescan interval in milliseconds.
    pub hotplug_poll_ms: u64,
    /// Lua script to run. Scripting is off when unset.
    pub script: Option<PathBuf>,
    /// Script tick interval in milliseconds.
    pub script_tick_ms: u64,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            head_tracker_device: None,
            head_tracker_poll_ms: millis(DEFAULT_HEAD_TRACKER_POLL),
            hotplug_dir: Some(PathBuf::from("/dev/dri")),
            hotplug_poll_ms: millis(DEFAULT_HOTPLUG_POLL),
            script: None,
            script_tick_ms: millis(DEFAULT_SCRIPT_TICK),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/vrms-test`
    /// 2. `VRMS_CONFIG_DIR` env var
    /// 3. Default: platform config dir + `vrms`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/vrms-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("VRMS_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("vrms")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file yields defaults. A file that exists but does not parse
    /// is an error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid config file {}", config_path.display()))
    }

    /// Parse a config document. Missing fields take their defaults.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `VRMS_*` overrides read through `lookup`. Unparseable numbers
    /// are ignored. An empty path disables the corresponding module.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("VRMS_SOCKET_PATH") {
            self.socket_path = Some(PathBuf::from(path));
        }

        if let Some(timeout) = lookup("VRMS_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Some(max) = lookup("VRMS_MAX_OBJECTS") {
            if let Ok(max) = max.parse::<usize>() {
                self.max_objects_per_scene = max;
            }
        }

        if let Some(device) = lookup("VRMS_HEAD_TRACKER_DEVICE") {
            self.modules.head_tracker_device = non_empty_path(device);
        }

        if let Some(dir) = lookup("VRMS_HOTPLUG_DIR") {
            self.modules.hotplug_dir = non_empty_path(dir);
        }

        if let Some(script) = lookup("VRMS_SCRIPT") {
            self.modules.script = non_empty_path(script);
        }

        if let Some(file) = lookup("VRMS_LOG_FILE") {
            self.log_file = non_empty_path(file);
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Effective socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }

    /// Listener settings derived from this config.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig { socket_path: self.socket_path(), idle_timeout: self.idle_timeout() }
    }
}

fn non_empty_path(value: String) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

/// `$XDG_RUNTIME_DIR/vrms.sock`, else `/tmp/vrms-{uid}/vrms.sock`.
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("vrms.sock"),
        _ => {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/vrms-{uid}/vrms.sock"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.idle_timeout_secs, 300);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.max_objects_per_scene, DEFAULT_MAX_OBJECTS_PER_SCENE);
        assert_eq!(config.modules.hotplug_dir, Some(PathBuf::from("/dev/dri")));
        assert!(config.modules.head_tracker_device.is_none());
        assert!(config.modules.script.is_none());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config =
            Config::from_json(r#"{"idle_timeout_secs": 0, "modules": {"script": "/x.lua"}}"#)
                .unwrap();
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.modules.script, Some(PathBuf::from("/x.lua")));
        assert_eq!(config.modules.script_tick_ms, 16);
        assert_eq!(config.modules.hotplug_dir, Some(PathBuf::from("/dev/dri")));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(Config::from_json("{not json").is_err());
        assert!(Config::from_json(r#"{"idle_timeout_secs": "soon"}"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("VRMS_SOCKET_PATH", "/run/test/vrms.sock"),
            ("VRMS_IDLE_TIMEOUT", "7"),
            ("VRMS_MAX_OBJECTS", "12"),
            ("VRMS_HOTPLUG_DIR", ""),
            ("VRMS_SCRIPT", "/etc/vrms/body.lua"),
        ]));
        assert_eq!(config.socket_path(), PathBuf::from("/run/test/vrms.sock"));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(7)));
        assert_eq!(config.max_objects_per_scene, 12);
        assert!(config.modules.hotplug_dir.is_none());
        assert_eq!(config.modules.script, Some(PathBuf::from("/etc/vrms/body.lua")));
    }

    #[test]
    fn test_unparseable_numbers_ignored() {
        let mut config = Config::default();
        config.apply_overrides(env(&[("VRMS_IDLE_TIMEOUT", "forever"), ("VRMS_MAX_OBJECTS", "-1")]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_serialization_round_trip_omits_unset_paths() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("socket_path"));
        assert!(!json.contains("log_file"));
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_server_config_uses_overrides() {
        let mut config = Config::default();
        config.socket_path = Some(PathBuf::from("/tmp/a.sock"));
        config.idle_timeout_secs = 0;
        let server = config.server_config();
        assert_eq!(server.socket_path, PathBuf::from("/tmp/a.sock"));
        assert!(server.idle_timeout.is_none());
    }

    #[test]
    fn test_default_socket_path_file_name() {
        assert_eq!(default_socket_path().file_name().unwrap(), "vrms.sock");
    }
}
