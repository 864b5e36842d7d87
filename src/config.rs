use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 150;
pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_SCAN_CAP: usize = 2000;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    pub probe_timeout_ms: u64,
    pub batch_size: usize,
    pub default_cap: usize,
    pub probe_fallback: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            default_cap: DEFAULT_SCAN_CAP,
            probe_fallback: true,
        }
    }
}

impl ScanConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    pub kill_timeout_ms: u64,
    pub bind_address: String,
    pub python: String,
    pub node: String,
    pub shell: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            kill_timeout_ms: crate::handle::DEFAULT_KILL_TIMEOUT_MS,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            python: "python3".to_string(),
            node: "node".to_string(),
            shell: "sh".to_string(),
        }
    }
}

impl LifecycleConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub scan: ScanConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("{0}")]
    IoError(String),
}

/// Load settings from `path`, falling back to defaults when the file is absent.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_settings(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
        Err(e) => Err(ConfigError::IoError(format!("{}: {}", path.display(), e))),
    }
}

pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    let settings: Settings =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.scan.batch_size == 0 {
        return Err(ConfigError::Invalid {
            field: "scan.batch_size",
            reason: "must be at least 1".to_string(),
        });
    }
    if settings.scan.probe_timeout_ms == 0 {
        return Err(ConfigError::Invalid {
            field: "scan.probe_timeout_ms",
            reason: "must be at least 1".to_string(),
        });
    }
    for (field, value) in [
        ("lifecycle.python", &settings.lifecycle.python),
        ("lifecycle.node", &settings.lifecycle.node),
        ("lifecycle.shell", &settings.lifecycle.shell),
    ] {
        let words = shell_words::split(value).map_err(|e| ConfigError::Invalid {
            field,
            reason: e.to_string(),
        })?;
        if words.is_empty() {
            return Err(ConfigError::Invalid {
                field,
                reason: "command is empty".to_string(),
            });
        }
    }
    Ok(())
}
