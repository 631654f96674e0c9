// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Simulated motion and environment sensors for the guest.
//!
//! A client drives the device orientation over a framed channel
//! ([`handler::SensorsHandler`]); the derived readings are served back to the client on demand
//! and pushed to the guest sensors HAL over its virtio consoles ([`hal_proxy::SensorsHalProxy`]).

pub mod common;
pub mod hal_proxy;
pub mod handler;
pub mod simulator;

use base::FailureKind;
use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::common::DeviceType;
pub use crate::common::SensorId;
pub use crate::hal_proxy::HalProxyConfig;
pub use crate::hal_proxy::SensorsHalProxy;
pub use crate::handler::SensorsHandler;
pub use crate::simulator::SensorsSimulator;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failed to access the HAL console: {0}")]
    Console(std::io::Error),
    #[error("malformed {what} payload: {reason}")]
    InvalidPayload { what: &'static str, reason: String },
    #[error("failed to spawn {0} thread: {1}")]
    SpawnThread(&'static str, std::io::Error),
    #[error("sensor channel failure: {0}")]
    Transport(transport::Error),
    #[error("unknown sensors command {0}")]
    UnknownCommand(u32),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::InvalidPayload { .. } | Error::UnknownCommand(_) => FailureKind::BadMsg,
            Error::Console(_) | Error::SpawnThread(..) => FailureKind::Io,
            Error::Transport(e) => e.kind(),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Error::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
