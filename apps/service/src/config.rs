use std::{env, fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::monitoring::SchedulerConfig;
use crate::orchestrator::RetentionPolicy;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("failed to write config: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config directory: neither XDG_CONFIG_HOME nor HOME is set")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: Database,
    pub scheduler: Scheduler,
    pub retention: Retention,
    pub export: Export,
    pub logging: Logging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scheduler {
    pub tick_seconds: u64,
    pub lookahead_seconds: u64,
    pub stagger_ms: u64,
    pub shutdown_grace_seconds: u64,
    /// Added to every probe's `timeout * (retry + 1)` to bound a dispatch
    pub budget_grace_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Retention {
    pub history_days: i64,
    pub event_log_days: i64,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Export {
    /// JSON lines file receiving every result of `always`/`ai` items
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
}

impl Default for Database {
    fn default() -> Self {
        Self { path: "netwatch.db".into(), pool_size: 8 }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            tick_seconds: 30,
            lookahead_seconds: 30,
            stagger_ms: 5,
            shutdown_grace_seconds: 30,
            budget_grace_seconds: 5,
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self { history_days: 30, event_log_days: 90, interval_seconds: 3600 }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/netwatch/config.toml or
/// $HOME/.config/...)
pub fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("netwatch/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;
        write_1(f, "Pool Size", &self.database.pool_size)?;

        write_title_1(f, "Scheduler")?;
        write_1(f, "Tick (s)", &self.scheduler.tick_seconds)?;
        write_1(f, "Lookahead (s)", &self.scheduler.lookahead_seconds)?;
        write_1(f, "Stagger (ms)", &self.scheduler.stagger_ms)?;
        write_1(f, "Shutdown Grace (s)", &self.scheduler.shutdown_grace_seconds)?;
        write_1(f, "Budget Grace (s)", &self.scheduler.budget_grace_seconds)?;

        write_title_1(f, "Retention")?;
        write_1(f, "History (days)", &self.retention.history_days)?;
        write_1(f, "Event Log (days)", &self.retention.event_log_days)?;
        write_1(f, "Interval (s)", &self.retention.interval_seconds)?;

        write_title_1(f, "Export")?;
        write_1(f, "Path", &self.export.path.as_deref().unwrap_or("(disabled)"))?;

        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/netwatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path).map_err(Error::ReadFailed)?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::WriteFailed)?;
        }

        fs::write(path, config_str).map_err(Error::WriteFailed)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_period: Duration::from_secs(self.scheduler.tick_seconds.max(1)),
            lookahead: Duration::from_secs(self.scheduler.lookahead_seconds),
            stagger: Duration::from_millis(self.scheduler.stagger_ms),
            shutdown_grace: Duration::from_secs(self.scheduler.shutdown_grace_seconds),
        }
    }

    pub fn budget_grace(&self) -> Duration {
        Duration::from_secs(self.scheduler.budget_grace_seconds)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            history_days: self.retention.history_days,
            event_log_days: self.retention.event_log_days,
            interval: Duration::from_secs(self.retention.interval_seconds.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config");

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config, Config::default());
        // Extension is forced to .toml
        assert!(dir.path().join("nested/config.toml").exists());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[scheduler]\ntick_seconds = 10\n\n[export]\npath = \"/tmp/results.jsonl\"\n").unwrap();

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.scheduler.tick_seconds, 10);
        assert_eq!(config.scheduler.lookahead_seconds, 30);
        assert_eq!(config.export.path.as_deref(), Some("/tmp/results.jsonl"));
        assert_eq!(config.database, Database::default());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.retention.history_days = 7;
        config.logging.level = "debug".into();

        config.write_config(&path).unwrap();
        assert_eq!(Config::from_config(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[scheduler\n").unwrap();

        assert!(matches!(Config::from_config(Some(&path)), Err(Error::ParseFailed(_))));
    }

    #[test]
    fn test_scheduler_config_conversion() {
        let config = Config::default();
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.tick_period, Duration::from_secs(30));
        assert_eq!(scheduler.stagger, Duration::from_millis(5));
        assert_eq!(config.budget_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_display_lists_sections() {
        let rendered = Config::default().to_string();
        for section in ["Database", "Scheduler", "Retention", "Export", "Logging"] {
            assert!(rendered.contains(section), "missing {section}");
        }
        assert!(rendered.contains("(disabled)"));
    }
}
