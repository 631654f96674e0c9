// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide logging setup.
//!
//! Crates log with the `log` macros re-exported from `base`; nothing is printed until
//! [`init`] or [`init_with`] installs the backend.
//!
//! ```
//! use base::syslog;
//! use base::warn;
//!
//! if let Err(e) = syslog::init() {
//!     println!("failed to initialize syslog: {}", e);
//!     return;
//! }
//! warn!("this is your {} warning", "final");
//! ```

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::PathBuf;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Errors returned by [`init`].
#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// A logger has already been installed for this process.
    #[error("logger already initialized")]
    AlreadyInitialized,
    /// The log file could not be opened for appending.
    #[error("failed to open log file: {0}")]
    OpenLogFile(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct LogConfig {
    /// `env_logger` style filter, e.g. `info` or `audio=debug,info`. `RUST_LOG` takes priority.
    pub filter: String,
    /// Name prefixed to each line.
    pub proc_name: String,
    /// Appends to this file instead of writing to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            proc_name: "cf_bridge".to_string(),
            log_file: None,
        }
    }
}

/// Initializes logging to stderr with the default configuration.
pub fn init() -> Result<()> {
    init_with(LogConfig::default())
}

/// Initializes logging. Only the first successful call in a process takes effect.
pub fn init_with(cfg: LogConfig) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&cfg.filter);
    if let Ok(filter) = env::var("RUST_LOG") {
        builder.parse_filters(&filter);
    }

    let proc_name = cfg.proc_name;
    builder.format(move |buf, record| {
        writeln!(
            buf,
            "[{} {} {}: {}:{}] {}",
            chrono::Utc::now().format(TIMESTAMP_FMT),
            record.level(),
            proc_name,
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        )
    });

    if let Some(path) = &cfg.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::OpenLogFile)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().map_err(|_| Error::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_json() {
        let cfg: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, LogConfig::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<LogConfig>(r#"{"level": "debug"}"#).is_err());
    }

    #[test]
    fn log_file_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LogConfig {
            log_file: Some(dir.path().join("missing").join("log.txt")),
            ..Default::default()
        };
        assert!(matches!(init_with(cfg), Err(Error::OpenLogFile(_))));
    }

    #[test]
    fn second_init_is_rejected() {
        let _ = init();
        assert!(matches!(init(), Err(Error::AlreadyInitialized)));
    }
}
