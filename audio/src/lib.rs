// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side of the VioS virtio-snd protocol: the control/IO server, a 10 ms realtime mixer,
//! and the stream handler that sits between them.

pub mod common;
pub mod constants;
mod handler;
pub mod layout;
mod mixer;
mod server;

use std::io;

use base::FailureKind;
use base::MmapError;
use enumn::N;
use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::common::ChannelLayout;
pub use crate::common::StreamDirection;
pub use crate::handler::AudioHandler;
pub use crate::handler::AudioSource;
pub use crate::handler::AudioStreamSettings;
pub use crate::handler::SourceRead;
pub use crate::mixer::AudioMixer;
pub use crate::mixer::AudioSink;
pub use crate::mixer::MixBuffer;
pub use crate::mixer::MixerSettings;
pub use crate::server::AudioClientConnection;
pub use crate::server::AudioServer;
pub use crate::server::AudioServerExecutor;
pub use crate::server::RxBuffer;
pub use crate::server::StreamParams;
pub use crate::server::TxBuffer;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failed to accept audio client: {0}")]
    Accept(io::Error),
    #[error("failed to bind audio server socket: {0}")]
    Bind(io::Error),
    #[error("failed to create shared memory queue: {0}")]
    CreateQueue(MmapError),
    #[error("failed to create socket pair: {0}")]
    CreateSocketPair(io::Error),
    #[error("failed to duplicate descriptor: {0}")]
    DupFd(io::Error),
    #[error("{0} channels cannot be mixed")]
    InvalidChannelCount(u32),
    #[error("invalid sample rate for the mixer")]
    InvalidSampleRate,
    #[error("stream id {0} is out of range or used twice")]
    InvalidStreamId(u32),
    #[error("failed to map shared memory queue: {0}")]
    MapQueue(MmapError),
    #[error("failed to receive from socket: {0}")]
    Recv(io::Error),
    #[error("failed to send on socket: {0}")]
    Send(io::Error),
    #[error("failed to send the welcome message: {0}")]
    SendWelcome(io::Error),
    #[error("failed to spawn thread: {0}")]
    SpawnThread(io::Error),
    #[error("{0} bit samples are not supported by the mixer")]
    UnsupportedSampleWidth(u32),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::InvalidChannelCount(_)
            | Error::InvalidSampleRate
            | Error::InvalidStreamId(_)
            | Error::UnsupportedSampleWidth(_) => FailureKind::BadMsg,
            _ => FailureKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// virtio-snd request status, as carried in command replies and per-buffer status messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum AudioStatus {
    Ok = constants::VIRTIO_SND_S_OK,
    BadMsg = constants::VIRTIO_SND_S_BAD_MSG,
    NotSupported = constants::VIRTIO_SND_S_NOT_SUPP,
    IoErr = constants::VIRTIO_SND_S_IO_ERR,
}

impl From<FailureKind> for AudioStatus {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::BadMsg | FailureKind::State => AudioStatus::BadMsg,
            FailureKind::NotSupported => AudioStatus::NotSupported,
            FailureKind::Io | FailureKind::Timeout => AudioStatus::IoErr,
        }
    }
}
