use crate::NarrativeError;
use crate::metrics::MetricsConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
pub struct NarrativeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// How long a transition waits for the user's lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Budget for one transition transaction; past it, nothing commits.
    #[serde(default = "default_transition_timeout_ms")]
    pub transition_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub retry_on_conflict: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            transition_timeout_ms: default_transition_timeout_ms(),
            retry_on_conflict: true,
        }
    }
}

impl EngineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_transition_timeout_ms() -> u64 {
    5000
}

fn default_busy_timeout_ms() -> u64 {
    crate::db::DEFAULT_BUSY_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

/// Load config from NARRATIVE_CONFIG env var, ~/.narrative/config.toml, or defaults.
pub fn load_config() -> Result<NarrativeConfig, NarrativeError> {
    match config_path() {
        Some(p) if p.exists() => load_config_from(&p),
        _ => Ok(NarrativeConfig::default()),
    }
}

pub fn load_config_from(path: &Path) -> Result<NarrativeConfig, NarrativeError> {
    let content = std::fs::read_to_string(path)?;
    let config: NarrativeConfig = toml::from_str(&content)
        .map_err(|e| NarrativeError::Config(format!("{}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("NARRATIVE_CONFIG") {
        return Some(PathBuf::from(p));
    }
    let home = std::env::var("HOME").ok()?;
    Some(Path::new(&home).join(".narrative").join("config.toml"))
}

fn validate_config(config: &NarrativeConfig) -> Result<(), NarrativeError> {
    if config.engine.lock_timeout_ms == 0 {
        return Err(NarrativeError::Config("engine.lock_timeout_ms must be > 0".into()));
    }
    if config.engine.transition_timeout_ms == 0 {
        return Err(NarrativeError::Config(
            "engine.transition_timeout_ms must be > 0".into(),
        ));
    }
    if config.metrics.enabled && !matches!(config.metrics.transport.as_str(), "http" | "grpc") {
        return Err(NarrativeError::Config(format!(
            "metrics.transport must be \"http\" or \"grpc\", got {:?}",
            config.metrics.transport
        )));
    }
    Ok(())
}
