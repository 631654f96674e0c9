// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The seam between the connection controller and a WebRTC implementation.
//!
//! A peer connection reports asynchronous results through a [`PeerObserverShim`], which only
//! queues [`PeerEvent`]s. The controller drains the queue on its own thread, so it never needs to
//! be shared with the WebRTC stack's callback threads.

use std::fmt;
use std::sync::mpsc::Sender;

use base::debug;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceCandidate {
    pub mid: String,
    pub mline_index: i32,
    pub candidate: String,
}

/// A STUN/TURN server handed to the peer connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    CreateSdpSuccess(SessionDescription),
    CreateSdpFailure(String),
    SetLocalResult(std::result::Result<(), String>),
    SetRemoteResult(std::result::Result<(), String>),
    IceCandidate(IceCandidate),
    ConnectionChange(PeerConnectionState),
    RenegotiationNeeded,
}

/// Handed to the peer connection in place of the controller.
#[derive(Clone)]
pub struct PeerObserverShim {
    events: Sender<PeerEvent>,
}

impl PeerObserverShim {
    pub(crate) fn new(events: Sender<PeerEvent>) -> Self {
        PeerObserverShim { events }
    }

    pub fn notify(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            debug!("connection controller is gone, dropping peer event");
        }
    }
}

/// The operations the controller performs on a peer connection.
///
/// The asynchronous ones complete by posting a [`PeerEvent`] to the shim the connection was built
/// with.
pub trait PeerConnection: Send {
    fn create_offer(&mut self);
    fn create_answer(&mut self);
    fn set_local_description(&mut self, desc: SessionDescription);
    fn set_remote_description(&mut self, desc: SessionDescription);
    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;
    fn close(&mut self);
}

pub trait PeerConnectionBuilder {
    fn build(
        &self,
        observer: PeerObserverShim,
        ice_servers: &[IceServer],
    ) -> Result<Box<dyn PeerConnection>>;
}
