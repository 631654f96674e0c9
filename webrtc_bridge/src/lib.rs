// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device side of the WebRTC streamer: signaling, data channels and input injection.
//!
//! The crate never owns a network transport or a WebRTC stack. Signaling messages arrive already
//! parsed and leave through a [`signaling::SignalingSink`], the peer connection is supplied by a
//! [`peer::PeerConnectionBuilder`], and data-channel traffic is dispatched to a
//! [`observer::ConnectionObserver`] implemented by the device.

pub mod data_channels;
pub mod input;
pub mod keyboard;
pub mod observer;
pub mod peer;
pub mod signaling;

use base::FailureKind;
use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::data_channels::DataChannel;
pub use crate::data_channels::DataChannelRouter;
pub use crate::data_channels::DataChannelState;
pub use crate::data_channels::JsonSender;
pub use crate::data_channels::MessageSender;
pub use crate::input::InputConnector;
pub use crate::input::InputConnectorBuilder;
pub use crate::input::InputEventSink;
pub use crate::input::MultiTouchContact;
pub use crate::observer::ConnectionObserver;
pub use crate::observer::InputForwarder;
pub use crate::observer::SwitchEvent;
pub use crate::signaling::ConnectionController;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("a device is already registered for display {0}")]
    DuplicateDevice(String),
    #[error("field `{field}` is missing or is not {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("no {0} device is attached")]
    NoDevice(&'static str),
    #[error("peer connection failure: {0}")]
    PeerConnection(String),
    #[error("remote reported an error: {0}")]
    Remote(String),
    #[error("no touch device for display {0}")]
    UnknownDisplay(String),
    #[error("no evdev code for key {0}")]
    UnknownKey(String),
    #[error("failed to write input events: {0}")]
    Write(std::io::Error),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::DuplicateDevice(_)
            | Error::InvalidField { .. }
            | Error::InvalidMessage(_)
            | Error::UnknownDisplay(_) => FailureKind::BadMsg,
            Error::InvalidState(_) | Error::NoDevice(_) => FailureKind::State,
            Error::UnknownKey(_) => FailureKind::NotSupported,
            Error::PeerConnection(_) | Error::Remote(_) | Error::Write(_) => FailureKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
