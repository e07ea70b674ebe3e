use std::time::Duration;
use std::{env, fmt, fs, io, path};

use logger::LogFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use vigil::{DownPolicy, IncidentConfig, OverlapPolicy, ProbeConfig, RunnerConfig, Schedule};

use crate::orchestrator::RetentionPolicy;

/// Environment variable overriding `[database] path`
pub const DATABASE_PATH_ENV: &str = "VIGIL_DATABASE_PATH";

const MIN_TIMEOUT_SECONDS: u64 = 1;
const MAX_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed {
        path: path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed {
        path: path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config directory available, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: Scheduler,
    pub jobs: Jobs,
    pub probes: Probes,
    pub incidents: Incidents,
    pub notifications: Notifications,
    pub retention: Retention,
    pub database: Database,
    pub logging: Logging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scheduler {
    pub workers: usize,
    pub shutdown_timeout_seconds: u64,
    pub overlap: OverlapPolicy,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            workers: vigil::DEFAULT_WORKERS,
            shutdown_timeout_seconds: 30,
            overlap: OverlapPolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Jobs {
    pub uptime_enabled: bool,
    pub uptime_schedule: String,
    pub certificate_enabled: bool,
    pub certificate_schedule: String,
}

impl Default for Jobs {
    fn default() -> Self {
        Self {
            uptime_enabled: true,
            uptime_schedule: "*/5 * * * *".into(),
            certificate_enabled: true,
            certificate_schedule: "0 * * * *".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Probes {
    pub http_timeout_seconds: u64,
    pub tls_timeout_seconds: u64,
    pub certificate_threshold_days: i64,
    pub down_policy: DownPolicy,
}

impl Default for Probes {
    fn default() -> Self {
        Self {
            http_timeout_seconds: 10,
            tls_timeout_seconds: 10,
            certificate_threshold_days: vigil::DEFAULT_CERTIFICATE_THRESHOLD_DAYS,
            down_policy: DownPolicy::Unreachable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Incidents {
    pub notify_on_recovery: bool,
}

impl Default for Incidents {
    fn default() -> Self {
        Self { notify_on_recovery: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notifications {
    pub webhook_url: Option<String>,
    pub notify_certificate_expiry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Retention {
    pub enabled: bool,
    pub schedule: String,
    /// Days to keep uptime and TLS results
    pub result_days: i64,
    /// Days to keep resolved incidents; open incidents are never pruned
    pub incident_days: i64,
}

impl Default for Retention {
    fn default() -> Self {
        Self { enabled: true, schedule: "30 * * * *".into(), result_days: 30, incident_days: 90 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: String,
}

impl Default for Database {
    fn default() -> Self {
        Self { path: "vigil.db".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self { level: "info".into(), format: LogFormat::Compact }
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

/// Get default config path ($XDG_CONFIG_HOME/vigil/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("vigil/config.toml"))
}

fn validate_timeout(label: &str, seconds: u64) -> Result<(), ConfigError> {
    if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&seconds) {
        return Err(ConfigError::Invalid(format!(
            "{label} must be between {MIN_TIMEOUT_SECONDS} and {MAX_TIMEOUT_SECONDS} seconds, got {seconds}"
        )));
    }
    Ok(())
}

fn validate_schedule(label: &str, descriptor: &str) -> Result<(), ConfigError> {
    Schedule::parse(descriptor)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("{label} '{descriptor}': {e}")))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Scheduler")?;
        write_1(f, "Workers", &self.scheduler.workers)?;
        write_1(f, "Shutdown Timeout (s)", &self.scheduler.shutdown_timeout_seconds)?;
        write_1(f, "Overlap", &format!("{:?}", self.scheduler.overlap).to_lowercase())?;

        write_title_1(f, "Jobs")?;
        write_1(f, "Uptime Enabled", &self.jobs.uptime_enabled)?;
        write_1(f, "Uptime Schedule", &self.jobs.uptime_schedule)?;
        write_1(f, "Certificate Enabled", &self.jobs.certificate_enabled)?;
        write_1(f, "Certificate Schedule", &self.jobs.certificate_schedule)?;

        write_title_1(f, "Probes")?;
        write_1(f, "HTTP Timeout (s)", &self.probes.http_timeout_seconds)?;
        write_1(f, "TLS Timeout (s)", &self.probes.tls_timeout_seconds)?;
        write_1(f, "Certificate Threshold (days)", &self.probes.certificate_threshold_days)?;
        write_1(f, "Down Policy", &format!("{:?}", self.probes.down_policy))?;

        write_title_1(f, "Incidents")?;
        write_1(f, "Notify On Recovery", &self.incidents.notify_on_recovery)?;

        write_title_1(f, "Notifications")?;
        write_1(f, "Webhook", &self.notifications.webhook_url.as_deref().unwrap_or("(none)"))?;
        write_1(f, "Certificate Expiry", &self.notifications.notify_certificate_expiry)?;

        write_title_1(f, "Retention")?;
        write_1(f, "Enabled", &self.retention.enabled)?;
        write_1(f, "Schedule", &self.retention.schedule)?;
        write_1(f, "Results (days)", &self.retention.result_days)?;
        write_1(f, "Resolved Incidents (days)", &self.retention.incident_days)?;

        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;

        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;
        write_1(f, "Format", &self.logging.format)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/vigil/config.toml, or at the given
    /// path, when no file exists there yet.
    /// Environment overrides are applied and the result is validated.
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let mut config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var(DATABASE_PATH_ENV) {
            if !path.trim().is_empty() {
                self.database.path = path;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.workers == 0 {
            return Err(ConfigError::Invalid("scheduler.workers must be at least 1".into()));
        }
        validate_timeout("scheduler.shutdown_timeout_seconds", self.scheduler.shutdown_timeout_seconds)?;
        validate_timeout("probes.http_timeout_seconds", self.probes.http_timeout_seconds)?;
        validate_timeout("probes.tls_timeout_seconds", self.probes.tls_timeout_seconds)?;

        if self.probes.certificate_threshold_days < 0 {
            return Err(ConfigError::Invalid(
                "probes.certificate_threshold_days must not be negative".into(),
            ));
        }

        validate_schedule("jobs.uptime_schedule", &self.jobs.uptime_schedule)?;
        validate_schedule("jobs.certificate_schedule", &self.jobs.certificate_schedule)?;
        validate_schedule("retention.schedule", &self.retention.schedule)?;

        if self.retention.result_days < 1 || self.retention.incident_days < 1 {
            return Err(ConfigError::Invalid("retention periods must be at least 1 day".into()));
        }

        if let Some(webhook) = &self.notifications.webhook_url {
            let url = Url::parse(webhook).map_err(|e| {
                ConfigError::Invalid(format!("notifications.webhook_url '{webhook}': {e}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "notifications.webhook_url must be http or https, got {}",
                    url.scheme()
                )));
            }
        }

        if self.database.path.trim().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".into()));
        }

        Ok(())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            workers: self.scheduler.workers,
            shutdown_timeout: Duration::from_secs(self.scheduler.shutdown_timeout_seconds),
            overlap: self.scheduler.overlap,
            ..RunnerConfig::default()
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            http_timeout: Duration::from_secs(self.probes.http_timeout_seconds),
            tls_timeout: Duration::from_secs(self.probes.tls_timeout_seconds),
        }
    }

    pub fn incident_config(&self) -> IncidentConfig {
        IncidentConfig { notify_on_recovery: self.incidents.notify_on_recovery }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            result_days: self.retention.result_days,
            incident_days: self.retention.incident_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.workers, 5);
        assert_eq!(config.jobs.uptime_schedule, "*/5 * * * *");
        assert_eq!(config.jobs.certificate_schedule, "0 * * * *");
        assert_eq!(config.probes.certificate_threshold_days, 30);
        assert!(!config.notifications.notify_certificate_expiry);
    }

    #[test]
    fn test_missing_file_writes_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/vigil");

        let config = Config::from_config(Some(&path)).unwrap();

        let written = dir.path().join("nested/vigil.toml");
        assert!(written.exists());
        let reread: Config = toml::from_str(&fs::read_to_string(written).unwrap()).unwrap();
        assert_eq!(reread.scheduler, config.scheduler);
        assert_eq!(reread.jobs, config.jobs);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[scheduler]
workers = 2
overlap = "allow"

[probes]
down_policy = "server_errors"

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.overlap, OverlapPolicy::Allow);
        assert_eq!(config.scheduler.shutdown_timeout_seconds, 30);
        assert_eq!(config.probes.down_policy, DownPolicy::ServerErrors);
        assert_eq!(config.probes.http_timeout_seconds, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.jobs, Jobs::default());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = Config::default();
        config.scheduler.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_out_of_range_timeouts() {
        let mut config = Config::default();
        config.probes.http_timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probes.tls_timeout_seconds = 301;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_schedule() {
        let mut config = Config::default();
        config.jobs.uptime_schedule = "*/0 * * * *".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("jobs.uptime_schedule"));

        let mut config = Config::default();
        config.jobs.certificate_schedule = "0 * *".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_day_retention() {
        let mut config = Config::default();
        config.retention.result_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_http_webhook() {
        let mut config = Config::default();
        config.notifications.webhook_url = Some("ftp://hooks.example.com".into());
        assert!(config.validate().is_err());

        config.notifications.webhook_url = Some("https://hooks.example.com/vigil".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[scheduler\nworkers = ").unwrap();

        assert!(matches!(Config::from_config(Some(&path)), Err(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn test_engine_configs_follow_file() {
        let mut config = Config::default();
        config.scheduler.workers = 8;
        config.scheduler.shutdown_timeout_seconds = 5;
        config.probes.http_timeout_seconds = 3;
        config.incidents.notify_on_recovery = false;

        let runner = config.runner_config();
        assert_eq!(runner.workers, 8);
        assert_eq!(runner.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(runner.tick_interval, Duration::from_secs(60));
        assert_eq!(config.probe_config().http_timeout, Duration::from_secs(3));
        assert!(!config.incident_config().notify_on_recovery);
    }

    #[test]
    fn test_display_lists_sections() {
        let rendered = Config::default().to_string();
        for section in ["Scheduler", "Jobs", "Probes", "Notifications", "Retention", "Database", "Logging"] {
            assert!(rendered.contains(section), "missing {section}");
        }
        assert!(rendered.contains("*/5 * * * *"));
    }
}
