//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Limits applied by a mailbox session to keep IMAP requests small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxLimits {
    /// Maximum sender addresses OR-combined into one search.
    pub sender_batch_size: usize,
    /// Maximum UIDs per header fetch.
    pub fetch_batch_size: usize,
}

impl Default for MailboxLimits {
    fn default() -> Self {
        Self {
            sender_batch_size: 80,
            fetch_batch_size: 100,
        }
    }
}

/// Timing knobs for the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// How often running tasks are checked during a cycle.
    pub supervise_interval: Duration,
    /// A task still running after this long is killed.
    pub hang_threshold: Duration,
    /// How long shutdown waits for cancelled tasks before killing them.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            supervise_interval: Duration::from_secs(5),
            hang_threshold: Duration::from_secs(600), // 10 minutes
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Daemon configuration, built from `AMF_*` environment variables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub rules_file: PathBuf,
    pub scheduler: SchedulerConfig,
    pub limits: MailboxLimits,
    pub imap_port: u16,
    /// Socket read/write timeout for IMAP connections.
    pub io_timeout: Duration,
    /// Skip rules whose folders are missing on the server.
    pub validate_folders: bool,
    /// Log to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            rules_file: PathBuf::from("./data/rules.json"),
            scheduler: SchedulerConfig::default(),
            limits: MailboxLimits::default(),
            imap_port: 993,
            io_timeout: Duration::from_secs(60),
            validate_folders: true,
            log_file: None,
        }
    }
}

impl DaemonConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rules_file = lookup("AMF_RULES_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.rules_file);

        let scheduler = SchedulerConfig {
            poll_interval: secs(&lookup, "AMF_POLL_INTERVAL_SECS", defaults.scheduler.poll_interval)?,
            supervise_interval: secs(
                &lookup,
                "AMF_SUPERVISE_INTERVAL_SECS",
                defaults.scheduler.supervise_interval,
            )?,
            hang_threshold: secs(
                &lookup,
                "AMF_HANG_THRESHOLD_SECS",
                defaults.scheduler.hang_threshold,
            )?,
            shutdown_grace: secs(
                &lookup,
                "AMF_SHUTDOWN_GRACE_SECS",
                defaults.scheduler.shutdown_grace,
            )?,
        };

        if scheduler.supervise_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "AMF_SUPERVISE_INTERVAL_SECS".into(),
                message: "must be at least 1 second".into(),
            });
        }

        let limits = MailboxLimits {
            sender_batch_size: parse_or(
                &lookup,
                "AMF_SENDER_BATCH_SIZE",
                defaults.limits.sender_batch_size,
            )?,
            fetch_batch_size: parse_or(
                &lookup,
                "AMF_FETCH_BATCH_SIZE",
                defaults.limits.fetch_batch_size,
            )?,
        };

        for (key, value) in [
            ("AMF_SENDER_BATCH_SIZE", limits.sender_batch_size),
            ("AMF_FETCH_BATCH_SIZE", limits.fetch_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: "batch size must be positive".into(),
                });
            }
        }

        Ok(Self {
            rules_file,
            scheduler,
            limits,
            imap_port: parse_or(&lookup, "AMF_IMAP_PORT", defaults.imap_port)?,
            io_timeout: secs(&lookup, "AMF_IO_TIMEOUT_SECS", defaults.io_timeout)?,
            validate_folders: flag_or(&lookup, "AMF_VALIDATE_FOLDERS", defaults.validate_folders)?,
            log_file: lookup("AMF_LOG_FILE")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn flag_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got {other:?}"),
            }),
        },
        None => Ok(default),
    }
}
