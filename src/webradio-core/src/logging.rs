//! Process-wide `tracing` setup for the webradio binary.
//!
//! Output always goes to a daily-rolling file in the log directory; stdout is
//! reserved for printed events, so the optional console mirror uses stderr.

use crate::{config::LoggingConfig, paths::AppDirs};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "webradio.log";

/// Keeps the non-blocking file writer flushing; drop it last.
pub struct LoggingGuard {
    _file: WorkerGuard,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    LogDir { path: PathBuf, source: io::Error },
    #[error("failed to install tracing subscriber: {0}")]
    Install(Box<dyn std::error::Error + Send + Sync>),
}

/// Install the global subscriber. `RUST_LOG`, when set, takes precedence
/// over the configured level.
pub fn init_logging(config: &LoggingConfig, dirs: &AppDirs) -> Result<LoggingGuard, LoggingError> {
    let log_dir = dirs.log_dir();
    fs::create_dir_all(log_dir).map_err(|source| LoggingError::LogDir {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let file_name = config.file_name.as_deref().unwrap_or(DEFAULT_LOG_FILE);
    let prune_failures = prune_rotated_logs(log_dir, file_name, config.max_log_files.max(1));

    let (file, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, file_name));
    let writer = if config.console {
        BoxMakeWriter::new(io::stderr.and(file))
    } else {
        BoxMakeWriter::new(file)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level.into()).into())
        .from_env_lossy();

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::Install)?;

    // Nothing could be logged before the subscriber existed.
    for (path, err) in prune_failures {
        tracing::warn!(path = %path.display(), error = %err, "could not prune old log file");
    }

    Ok(LoggingGuard { _file: guard })
}

/// Remove rotated `<file_name>.<date>` files, keeping the `keep` newest.
/// The daily suffix sorts chronologically, so names order the files.
/// Returns the paths that could not be removed.
fn prune_rotated_logs(dir: &Path, file_name: &str, keep: usize) -> Vec<(PathBuf, io::Error)> {
    let prefix = format!("{file_name}.");
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => return vec![(dir.to_path_buf(), err)],
    };

    let mut rotated: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix))
        })
        .collect();
    rotated.sort();

    let excess = rotated.len().saturating_sub(keep);
    rotated
        .into_iter()
        .take(excess)
        .filter_map(|path| fs::remove_file(&path).err().map(|err| (path, err)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "x").unwrap();
    }

    #[test]
    fn pruning_keeps_the_newest_rotations() {
        let dir = tempfile::tempdir().unwrap();
        for day in ["2024-01-03", "2024-01-01", "2024-01-02"] {
            touch(dir.path(), &format!("webradio.log.{day}"));
        }
        touch(dir.path(), "webradio.logbook");
        touch(dir.path(), "other.log.2023-12-31");

        let failures = prune_rotated_logs(dir.path(), "webradio.log", 2);

        assert!(failures.is_empty());
        assert!(!dir.path().join("webradio.log.2024-01-01").exists());
        assert!(dir.path().join("webradio.log.2024-01-02").exists());
        assert!(dir.path().join("webradio.log.2024-01-03").exists());
        assert!(dir.path().join("webradio.logbook").exists());
        assert!(dir.path().join("other.log.2023-12-31").exists());
    }

    #[test]
    fn missing_directory_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let failures = prune_rotated_logs(&missing, "webradio.log", 3);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, missing);
    }

    #[test]
    fn configured_level_maps_to_tracing_level() {
        use crate::config::LogLevel;
        assert_eq!(tracing::Level::from(LogLevel::Warn), tracing::Level::WARN);
        assert_eq!(
            LevelFilter::from_level(LogLevel::default().into()),
            LevelFilter::INFO
        );
    }
}
