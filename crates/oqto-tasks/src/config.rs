use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Overrides the worker executable used for fork+exec.
pub const ENV_WORKER_EXE: &str = "OQTO_TASKS_WORKER_EXE";

/// Forces fork+exec when set to a truthy value.
pub const ENV_MUST_EXEC: &str = "OQTO_TASKS_MUST_EXEC";

/// Task system configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Executable re-run for fork+exec workers (default: the current executable)
    #[serde(default)]
    pub worker_exe: Option<PathBuf>,

    /// Always fork+exec instead of forking only
    #[serde(default)]
    pub must_exec: bool,

    /// Step of timed joins (in milliseconds)
    #[serde(default = "default_join_poll_interval_ms")]
    pub join_poll_interval_ms: u64,

    /// Environment overrides for fork+exec workers
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Log worker start and finish at info level
    #[serde(default)]
    pub verbose: bool,
}

fn default_join_poll_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_exe: None,
            must_exec: false,
            join_poll_interval_ms: default_join_poll_interval_ms(),
            env: HashMap::new(),
            verbose: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `OQTO_TASKS_*` environment overrides on top of this config.
    pub fn apply_env(&mut self) {
        if let Some(exe) = std::env::var_os(ENV_WORKER_EXE).filter(|v| !v.is_empty()) {
            self.worker_exe = Some(PathBuf::from(exe));
        }
        if let Ok(value) = std::env::var(ENV_MUST_EXEC) {
            self.must_exec = parse_flag(&value);
        }
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms.max(1))
    }
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.must_exec);
        assert_eq!(config.join_poll_interval(), Duration::from_secs(1));
        assert!(config.worker_exe.is_none());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
must_exec = true
join_poll_interval_ms = 250

[env]
WORKER_MODE = "batch"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.must_exec);
        assert_eq!(config.join_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.env.get("WORKER_MODE").map(String::as_str), Some("batch"));
        assert!(!config.verbose);
    }

    #[test]
    fn test_from_file_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.toml");
        std::fs::write(&path, "must_exec = \"maybe\"").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" TRUE "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }
}
