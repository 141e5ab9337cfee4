//! Configuration management
//!
//! Options can be set on the command line, in a YAML configuration file
//! (searched in the current folder, then `~/.config/powerhouse/`, then
//! `/etc/powerhouse/`) and via environment variables (all uppercase,
//! prefixed with `POWERHOUSE_`, dots and hyphens mapped to underscores).
//! Flags win over the environment, the environment wins over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

const FILE_NAME: &str = "config.yaml";
const ENV_PREFIX: &str = "POWERHOUSE_";

/// Configuration values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub measure: MeasureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Verbosity of logging output
    pub level: String,
    /// Change logging format to JSON
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureConfig {
    /// Time between samples
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Loads the configuration, layering environment overrides on top of
    /// the first configuration file found
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = match path.map(PathBuf::from).or_else(Self::locate) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("read configuration file {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parse configuration file {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Finds the first configuration file in the search path
    fn locate() -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from(FILE_NAME)];
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(
                PathBuf::from(home)
                    .join(".config")
                    .join("powerhouse")
                    .join(FILE_NAME),
            );
        }
        candidates.push(PathBuf::from("/etc/powerhouse").join(FILE_NAME));

        candidates.into_iter().find(|p| p.exists())
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(level) = env_var("log.level") {
            self.log.level = level;
        }
        if let Some(json) = env_var("log.json") {
            self.log.json = json
                .parse()
                .with_context(|| format!("parse {}LOG_JSON", ENV_PREFIX))?;
        }
        if let Some(interval) = env_var("measure.interval") {
            self.measure.interval = humantime::parse_duration(&interval)
                .with_context(|| format!("parse {}MEASURE_INTERVAL", ENV_PREFIX))?;
        }
        Ok(())
    }
}

/// Looks up the environment override for a configuration key
fn env_var(key: &str) -> Option<String> {
    std::env::var(env_key(key)).ok()
}

/// Maps a configuration key to its environment variable name
fn env_key(key: &str) -> String {
    format!(
        "{ENV_PREFIX}{}",
        key.replace(['.', '-'], "_").to_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_replace_dots_and_hyphens() {
        assert_eq!(env_key("log.level"), "POWERHOUSE_LOG_LEVEL");
        assert_eq!(env_key("log.json"), "POWERHOUSE_LOG_JSON");
        assert_eq!(env_key("measure.interval"), "POWERHOUSE_MEASURE_INTERVAL");
        assert_eq!(env_key("log-as-json"), "POWERHOUSE_LOG_AS_JSON");
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert!(!config.log.json);
        assert_eq!(config.measure.interval, Duration::from_secs(5));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "log:\n  level: debug\nmeasure:\n  interval: 10s\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.measure.interval, Duration::from_secs(10));
        // Untouched sections keep their defaults
        assert!(!config.log.json);
    }

    #[test]
    fn unreadable_file_is_a_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
