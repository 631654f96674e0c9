// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supervises the host-side helper processes of a device.
//!
//! [`ProcessMonitor`] forks a monitor process that becomes the subreaper of the configured
//! commands, restarts or tears them down when they exit, and accepts stop/suspend/resume requests
//! from the launcher over a framed channel.

mod monitor;
mod properties;
pub mod secure_env;
mod suspend;

use base::process::WaitStatus;
use base::FailureKind;
use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::monitor::ProcessMonitor;
pub use crate::properties::MonitorCommand;
pub use crate::properties::ProcessMonitorProperties;
pub use crate::secure_env::SecureEnvRequest;
pub use crate::secure_env::SecureEnvSuspendResponder;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("the monitor process was already started")]
    AlreadyStarted,
    #[error("monitor channel failure: {0}")]
    Channel(transport::Error),
    #[error("monitor control thread panicked")]
    ControlThreadPanicked,
    #[error("failed to create the monitor channel: {0}")]
    CreateChannel(std::io::Error),
    #[error("failed to fork the monitor process: {0}")]
    Fork(base::Error),
    #[error("monitor process exited with {0:?}")]
    MonitorExited(WaitStatus),
    #[error("the monitor process is not running")]
    NotStarted,
    #[error("timed out waiting for the OEM lock")]
    OemLockTimeout,
    #[error("failed to set up the monitor process: {0}")]
    Prctl(base::Error),
    #[error("monitor replied kFailure to {0}")]
    Rejected(&'static str),
    #[error("secure_env {request:?} failed: {reason}")]
    SecureEnv {
        request: SecureEnvRequest,
        reason: String,
    },
    #[error("failed to signal {name}: {error}")]
    Signal { name: String, error: base::Error },
    #[error("failed to start subprocess {name}: {error}")]
    SpawnSubprocess { name: String, error: std::io::Error },
    #[error("failed to spawn the monitor control thread: {0}")]
    SpawnThread(std::io::Error),
    #[error("didn't stop all subprocesses: {stopped} of {total}")]
    StopSubprocesses { stopped: usize, total: usize },
    #[error("wait failed: {0}")]
    Wait(base::Error),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::AlreadyStarted | Error::NotStarted | Error::Rejected(_) => FailureKind::State,
            Error::Channel(e) => e.kind(),
            Error::OemLockTimeout => FailureKind::Timeout,
            Error::ControlThreadPanicked
            | Error::CreateChannel(_)
            | Error::Fork(_)
            | Error::MonitorExited(_)
            | Error::Prctl(_)
            | Error::SecureEnv { .. }
            | Error::Signal { .. }
            | Error::SpawnSubprocess { .. }
            | Error::SpawnThread(_)
            | Error::StopSubprocesses { .. }
            | Error::Wait(_) => FailureKind::Io,
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Error::Channel(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
