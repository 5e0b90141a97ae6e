//! Log sink configuration.
//!
//! The crate itself only talks to the `log` facade. This module wires an
//! `env_logger` backend that appends to a per-device file when the caller
//! asks for one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use env_logger::{Builder, Target};
use log::{LevelFilter, debug};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Verbosity accepted by the `level` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Debug,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
        }
    }
}

/// Where and how verbosely to log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LogSettings {
    /// Explicit log file. Takes precedence over `logdir`.
    pub logfile: Option<PathBuf>,
    /// Directory receiving `<host>.log`.
    pub logdir: Option<PathBuf>,
    /// Defaults to warnings only.
    pub level: Option<LogLevel>,
}

impl LogSettings {
    /// Resolved log file for a host, if file logging was requested.
    pub fn log_path(&self, host: &str) -> Option<PathBuf> {
        match (&self.logfile, &self.logdir) {
            (Some(file), _) => Some(file.clone()),
            (None, Some(dir)) => Some(dir.join(format!("{host}.log"))),
            (None, None) => None,
        }
    }

    /// `logfile` and `logdir` are mutually exclusive.
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.logfile.is_some() && self.logdir.is_some() {
            return Err(DeviceError::Validation(
                "parameters are mutually exclusive: logfile|logdir".to_string(),
            ));
        }
        Ok(())
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.level.map(LevelFilter::from).unwrap_or(LevelFilter::Warn)
    }
}

fn open_log_file(path: &Path) -> Result<File, DeviceError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| {
            DeviceError::Validation(format!(
                "Unable to open the log file {}. {e}",
                path.display()
            ))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            DeviceError::Validation(format!(
                "Unable to open the log file {}. {e}",
                path.display()
            ))
        })
}

/// Install the process-wide logger for `host`.
///
/// Only the first call in a process installs a logger; later calls are
/// accepted and leave the existing sink in place.
pub fn init(settings: &LogSettings, host: &str) -> Result<(), DeviceError> {
    settings.validate()?;
    let mut builder = Builder::new();
    builder
        .filter_level(settings.level_filter())
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                buf.timestamp_millis(),
                record.target(),
                record.level(),
                record.args()
            )
        });

    let path = settings.log_path(host);
    match &path {
        Some(path) => {
            let file = open_log_file(path)?;
            builder.target(Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(Target::Stderr);
        }
    }

    if builder.try_init().is_err() {
        debug!("[{host}] logger already installed, keeping existing sink");
    } else if let Some(path) = path {
        debug!("[{host}] logging to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logfile_and_logdir_are_exclusive() {
        let settings = LogSettings {
            logfile: Some(PathBuf::from("/tmp/a.log")),
            logdir: Some(PathBuf::from("/var/log/junos")),
            level: None,
        };
        assert!(settings.validate().is_err());
        assert_eq!(settings.log_path("r1"), Some(PathBuf::from("/tmp/a.log")));
    }

    #[test]
    fn logdir_uses_host_name() {
        let settings = LogSettings {
            logdir: Some(PathBuf::from("/var/log/junos")),
            ..Default::default()
        };
        assert_eq!(
            settings.log_path("r1"),
            Some(PathBuf::from("/var/log/junos/r1.log"))
        );
        assert_eq!(LogSettings::default().log_path("r1"), None);
    }

    #[test]
    fn level_defaults_to_warn() {
        assert_eq!(LogSettings::default().level_filter(), LevelFilter::Warn);
        let settings: LogSettings = serde_json::from_str(r#"{"level":"DEBUG"}"#).unwrap();
        assert_eq!(settings.level_filter(), LevelFilter::Debug);
    }

    #[test]
    fn unwritable_log_file_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let err = open_log_file(&blocker.join("nested.log")).unwrap_err();
        assert!(matches!(err, DeviceError::Validation(_)));
        assert!(err.to_string().starts_with("Unable to open the log file"));
    }
}
