//! Typed configuration for the puzzle hub, loaded from an optional TOML file
//! and overridden by `PUZZLE_HUB_`-prefixed environment variables.

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

const ENV_PREFIX: &str = "PUZZLE_HUB_";

/// Every tunable named in the wire format's configuration section, plus the
/// transport-level settings a runnable process needs (listen address,
/// store endpoint).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PuzzleConfig {
    pub listen_address: String,
    pub lock_ttl_seconds: u64,
    pub cursor_window_ms: u64,
    pub idle_timeout_seconds: u64,
    pub op_deadline_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub keepalive_interval_seconds: u64,
    pub kv_endpoint: String,
    pub kv_password: Option<String>,
    pub backplane_channel_prefix: String,
    pub position_tolerance: f64,
    pub rotation_tolerance_degrees: f64,
}

impl Default for PuzzleConfig {
    fn default() -> Self {
        PuzzleConfig {
            listen_address: "0.0.0.0:7777".to_string(),
            lock_ttl_seconds: 30,
            cursor_window_ms: 100,
            idle_timeout_seconds: 30,
            op_deadline_seconds: 5,
            shutdown_grace_seconds: 15,
            keepalive_interval_seconds: 15,
            kv_endpoint: String::new(),
            kv_password: None,
            backplane_channel_prefix: "puzzle-app".to_string(),
            position_tolerance: 5.0,
            rotation_tolerance_degrees: 5.0,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read { path: String, detail: String },
    Parse { path: String, detail: String },
    InvalidEnvValue { key: String, detail: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, detail } => {
                write!(f, "failed to read config file {path}: {detail}")
            }
            ConfigError::Parse { path, detail } => {
                write!(f, "failed to parse config file {path}: {detail}")
            }
            ConfigError::InvalidEnvValue { key, detail } => {
                write!(f, "invalid value for {key}: {detail}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl PuzzleConfig {
    /// Loads defaults, merges an optional TOML file over them, then applies
    /// `PUZZLE_HUB_`-prefixed environment variable overrides. This mirrors
    /// (in miniature) a layered `Default -> Config -> Env` resolution order,
    /// with later layers winning.
    pub fn load(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match toml_path {
            Some(path) => Self::from_toml_file(path)?,
            None => PuzzleConfig::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_var("LISTEN_ADDRESS") {
            self.listen_address = v;
        }
        if let Some(v) = env_u64("LOCK_TTL_SECONDS")? {
            self.lock_ttl_seconds = v;
        }
        if let Some(v) = env_u64("CURSOR_WINDOW_MS")? {
            self.cursor_window_ms = v;
        }
        if let Some(v) = env_u64("IDLE_TIMEOUT_SECONDS")? {
            self.idle_timeout_seconds = v;
        }
        if let Some(v) = env_u64("OP_DEADLINE_SECONDS")? {
            self.op_deadline_seconds = v;
        }
        if let Some(v) = env_u64("SHUTDOWN_GRACE_SECONDS")? {
            self.shutdown_grace_seconds = v;
        }
        if let Some(v) = env_u64("KEEPALIVE_INTERVAL_SECONDS")? {
            self.keepalive_interval_seconds = v;
        }
        if let Some(v) = env_var("KV_ENDPOINT") {
            self.kv_endpoint = v;
        }
        if let Some(v) = env_var("KV_PASSWORD") {
            self.kv_password = Some(v);
        }
        if let Some(v) = env_var("BACKPLANE_CHANNEL_PREFIX") {
            self.backplane_channel_prefix = v;
        }
        if let Some(v) = env_f64("POSITION_TOLERANCE")? {
            self.position_tolerance = v;
        }
        if let Some(v) = env_f64("ROTATION_TOLERANCE_DEGREES")? {
            self.rotation_tolerance_degrees = v;
        }
        Ok(())
    }
}

fn env_var(suffix: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn env_u64(suffix: &str) -> Result<Option<u64>, ConfigError> {
    match env_var(suffix) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvValue {
                key: format!("{ENV_PREFIX}{suffix}"),
                detail: e.to_string(),
            }),
    }
}

fn env_f64(suffix: &str) -> Result<Option<f64>, ConfigError> {
    match env_var(suffix) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvValue {
                key: format!("{ENV_PREFIX}{suffix}"),
                detail: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_spec_tunables() {
        let config = PuzzleConfig::default();
        assert_eq!(config.lock_ttl_seconds, 30);
        assert_eq!(config.cursor_window_ms, 100);
        assert_eq!(config.shutdown_grace_seconds, 15);
        assert_eq!(config.position_tolerance, 5.0);
        assert_eq!(config.keepalive_interval_seconds, 15);
        assert_eq!(config.backplane_channel_prefix, "puzzle-app");
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lock_ttl_seconds = 60\nkv_endpoint = \"redis://localhost:6379\"").unwrap();
        let config = PuzzleConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.lock_ttl_seconds, 60);
        assert_eq!(config.kv_endpoint, "redis://localhost:6379");
        assert_eq!(config.cursor_window_ms, 100);
    }

    #[test]
    fn env_override_wins_over_file_and_defaults() {
        // SAFETY: the test harness runs single-threaded-per-process env mutation
        // is confined to this one variable for the duration of this test.
        env::set_var(format!("{ENV_PREFIX}LOCK_TTL_SECONDS"), "45");
        let config = PuzzleConfig::load(None).unwrap();
        env::remove_var(format!("{ENV_PREFIX}LOCK_TTL_SECONDS"));
        assert_eq!(config.lock_ttl_seconds, 45);
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        env::set_var(format!("{ENV_PREFIX}LOCK_TTL_SECONDS"), "not-a-number");
        let result = PuzzleConfig::load(None);
        env::remove_var(format!("{ENV_PREFIX}LOCK_TTL_SECONDS"));
        assert!(result.is_err());
    }
}
