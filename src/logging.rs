//! Tracing subscriber setup.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;

/// Install the global subscriber. `RUST_LOG` overrides the default `info`.
///
/// With a `log_file`, output goes through a non-blocking file writer; keep
/// the returned guard alive until exit so buffered lines are flushed.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let Some(path) = log_file else {
        builder
            .try_init()
            .map_err(|e| ConfigError::Logging(e.to_string()))?;
        return Ok(None);
    };

    let (dir, name) = split_log_path(path)?;
    std::fs::create_dir_all(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    builder
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;
    Ok(Some(guard))
}

fn split_log_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr), ConfigError> {
    let name = path.file_name().ok_or_else(|| ConfigError::InvalidValue {
        key: "AMF_LOG_FILE".into(),
        message: format!("{} does not name a file", path.display()),
    })?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    Ok((dir, name))
}
