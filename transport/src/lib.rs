// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Length-prefixed message framing shared by the sensors, kernel-log and process-monitor
//! channels.

mod channel;
pub mod kernel_log;
mod message;
mod storage;

use base::FailureKind;
use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::channel::Channel;
pub use crate::channel::FdChannel;
pub use crate::message::create_message;
pub use crate::message::ManagedMessage;
pub use crate::message::RawMessageHeader;
pub use crate::message::MAX_COMMAND;
pub use crate::message::MAX_PAYLOAD_SIZE;
pub use crate::message::RAW_MESSAGE_HEADER_SIZE;
pub use crate::storage::StorageData;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("command {0:#x} does not fit in 31 bits")]
    CommandOutOfRange(u32),
    #[error("peer closed the channel")]
    Eof,
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
    #[error("payload of {0} bytes exceeds the maximum message size")]
    PayloadTooLarge(usize),
    #[error("failed to poll channel: {0}")]
    Poll(std::io::Error),
    #[error("failed to read message: {0}")]
    Read(std::io::Error),
    #[error("failed to write message: {0}")]
    Write(std::io::Error),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::CommandOutOfRange(_) | Error::Malformed { .. } | Error::PayloadTooLarge(_) => {
                FailureKind::BadMsg
            }
            Error::Eof | Error::Poll(_) | Error::Read(_) | Error::Write(_) => FailureKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
