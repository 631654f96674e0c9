// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-client signaling state machine.
//!
//! The controller is not a transport. Inbound messages arrive already parsed, outbound ones leave
//! through a [`SignalingSink`], and results from the peer connection come back as [`PeerEvent`]s
//! that the owner feeds in with [`ConnectionController::process_peer_events`].
//!
//! Answering side:
//!
//! ```text
//! New --request_offer()--> AwaitOffer --offer--> HaveRemote
//! HaveRemote --remote set--> DrainIce --create answer--> AwaitLocalSet --local set--> Connected
//! ```
//!
//! Offering side, entered on an inbound `request-offer` or a renegotiation:
//!
//! ```text
//! CreatingOffer --offer created--> AwaitAnswer --answer--> HaveRemote --remote set--> Connected
//! ```
//!
//! Any error moves to `Failed`, which is terminal.

use std::sync::mpsc::channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use base::debug;
use base::error;
use base::info;
use serde_json::json;
use serde_json::Value;

use crate::peer::IceCandidate;
use crate::peer::IceServer;
use crate::peer::PeerConnection;
use crate::peer::PeerConnectionBuilder;
use crate::peer::PeerConnectionState;
use crate::peer::PeerEvent;
use crate::peer::PeerObserverShim;
use crate::peer::SdpType;
use crate::peer::SessionDescription;
use crate::Error;
use crate::Result;

/// Delivers outbound signaling messages to the client.
pub trait SignalingSink: Send + Sync {
    fn send(&self, msg: Value);
}

pub trait Observer {
    /// Called with every peer connection state change, and once with the error that failed the
    /// connection.
    fn on_connection_state_change(&self, state: Result<PeerConnectionState>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    New,
    AwaitOffer,
    HaveRemote,
    DrainIce,
    AwaitLocalSet,
    Connected,
    CreatingOffer,
    AwaitAnswer,
    Failed,
}

pub struct ConnectionController {
    sink: Arc<dyn SignalingSink>,
    builder: Box<dyn PeerConnectionBuilder>,
    observer: Arc<dyn Observer>,
    state: ControllerState,
    offerer: bool,
    peer: Option<Box<dyn PeerConnection>>,
    remote_set: bool,
    pending_ice: Vec<IceCandidate>,
    events_tx: Sender<PeerEvent>,
    events_rx: Receiver<PeerEvent>,
}

fn invalid_field(field: &'static str, expected: &'static str) -> Error {
    Error::InvalidField { field, expected }
}

fn get_str<'a>(msg: &'a Value, field: &'static str) -> Result<&'a str> {
    msg.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_field(field, "a string"))
}

/// Parses the `ice_servers` array of a `request-offer` message.
pub fn parse_ice_servers(value: &Value) -> Result<Vec<IceServer>> {
    let entries = value
        .as_array()
        .ok_or_else(|| invalid_field("ice_servers", "an array"))?;
    entries
        .iter()
        .map(|entry| {
            if !entry.is_object() {
                return Err(invalid_field("ice_servers", "an array of objects"));
            }
            let urls = match entry.get("urls") {
                Some(Value::String(url)) => vec![url.clone()],
                Some(Value::Array(urls)) => urls
                    .iter()
                    .map(|url| url.as_str().map(str::to_owned))
                    .collect::<Option<Vec<String>>>()
                    .ok_or_else(|| invalid_field("urls", "a string or an array of strings"))?,
                _ => return Err(invalid_field("urls", "a string or an array of strings")),
            };
            let optional_str = |field: &'static str| -> Result<Option<String>> {
                match entry.get(field) {
                    None => Ok(None),
                    Some(Value::String(s)) => Ok(Some(s.clone())),
                    Some(_) => Err(invalid_field(field, "a string")),
                }
            };
            Ok(IceServer {
                urls,
                username: optional_str("username")?,
                credential: optional_str("credential")?,
            })
        })
        .collect()
}

/// Accepts the flat `{mid, mLineIndex, candidate}` form sent by the controller itself and the
/// browser's nested `{candidate: {sdpMid, sdpMLineIndex, candidate}}` form.
fn parse_ice_candidate(msg: &Value) -> Result<IceCandidate> {
    let (fields, mid_key, index_key) = match msg.get("candidate") {
        Some(Value::String(_)) => (msg, "mid", "mLineIndex"),
        Some(nested @ Value::Object(_)) => (nested, "sdpMid", "sdpMLineIndex"),
        _ => return Err(invalid_field("candidate", "a string or an object")),
    };
    let mline_index = fields
        .get(index_key)
        .and_then(Value::as_i64)
        .and_then(|i| i32::try_from(i).ok())
        .ok_or_else(|| invalid_field(index_key, "an integer"))?;
    Ok(IceCandidate {
        mid: get_str(fields, mid_key)?.to_owned(),
        mline_index,
        candidate: get_str(fields, "candidate")?.to_owned(),
    })
}

fn ice_servers_json(ice_servers: &[IceServer]) -> Value {
    Value::Array(
        ice_servers
            .iter()
            .map(|server| {
                let mut entry = json!({ "urls": server.urls });
                if let Some(username) = &server.username {
                    entry["username"] = json!(username);
                }
                if let Some(credential) = &server.credential {
                    entry["credential"] = json!(credential);
                }
                entry
            })
            .collect(),
    )
}

impl ConnectionController {
    pub fn new(
        sink: Arc<dyn SignalingSink>,
        builder: Box<dyn PeerConnectionBuilder>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let (events_tx, events_rx) = channel();
        ConnectionController {
            sink,
            builder,
            observer,
            state: ControllerState::New,
            offerer: false,
            peer: None,
            remote_set: false,
            pending_ice: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Builds the peer connection and asks the client for an offer.
    pub fn request_offer(&mut self, ice_servers: &[IceServer]) -> Result<()> {
        if self.state != ControllerState::New {
            return Err(Error::InvalidState(format!(
                "offer requested in state {:?}",
                self.state
            )));
        }
        self.ensure_peer(ice_servers)?;
        let mut msg = json!({ "type": "request-offer" });
        if !ice_servers.is_empty() {
            msg["ice_servers"] = ice_servers_json(ice_servers);
        }
        self.sink.send(msg);
        self.state = ControllerState::AwaitOffer;
        Ok(())
    }

    /// Handles one inbound signaling message. Errors fail the connection.
    pub fn handle_signaling_message(&mut self, msg: &Value) {
        if self.state == ControllerState::Failed {
            info!("ignoring signaling message on a failed connection");
            return;
        }
        let msg_type = match get_str(msg, "type") {
            Ok(t) => t,
            Err(e) => return self.fail(e),
        };
        let result = match msg_type {
            "request-offer" => self.on_request_offer(msg),
            "offer" => self.on_remote_description(msg, SdpType::Offer),
            "answer" => self.on_remote_description(msg, SdpType::Answer),
            "ice-candidate" => self.on_ice_candidate(msg),
            "error" => {
                let reason = msg
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_owned();
                // Not echoed back: the client already knows.
                self.fail_quietly(Error::Remote(reason));
                return;
            }
            other => Err(Error::InvalidMessage(format!(
                "unknown signaling message type {}",
                other
            ))),
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// Drains every event the peer connection has posted so far.
    pub fn process_peer_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_peer_event(event);
        }
    }

    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.state == ControllerState::Failed {
            debug!("ignoring peer event on a failed connection: {:?}", event);
            return;
        }
        if let Err(e) = self.on_peer_event(event) {
            self.fail(e);
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::CreateSdpSuccess(desc) => {
                self.sink.send(json!({
                    "type": desc.sdp_type.as_str(),
                    "sdp": desc.sdp,
                }));
                if desc.sdp_type == SdpType::Offer {
                    self.state = ControllerState::AwaitAnswer;
                }
                self.peer()?.set_local_description(desc);
            }
            PeerEvent::CreateSdpFailure(e) => {
                return Err(Error::PeerConnection(format!("failed to create sdp: {}", e)))
            }
            PeerEvent::SetLocalResult(Ok(())) => {
                if self.state == ControllerState::AwaitLocalSet {
                    self.state = ControllerState::Connected;
                }
            }
            PeerEvent::SetLocalResult(Err(e)) => {
                return Err(Error::PeerConnection(format!(
                    "failed to set local description: {}",
                    e
                )))
            }
            PeerEvent::SetRemoteResult(Ok(())) => self.on_remote_description_set()?,
            PeerEvent::SetRemoteResult(Err(e)) => {
                return Err(Error::PeerConnection(format!(
                    "failed to set remote description: {}",
                    e
                )))
            }
            PeerEvent::IceCandidate(candidate) => self.sink.send(json!({
                "type": "ice-candidate",
                "mid": candidate.mid,
                "mLineIndex": candidate.mline_index,
                "candidate": candidate.candidate,
            })),
            PeerEvent::ConnectionChange(state) => {
                info!("peer connection state: {:?}", state);
                self.observer.on_connection_state_change(Ok(state));
            }
            PeerEvent::RenegotiationNeeded => {
                if self.state == ControllerState::Connected {
                    self.start_offer()?;
                } else {
                    debug!("renegotiation deferred in state {:?}", self.state);
                }
            }
        }
        Ok(())
    }

    fn peer(&mut self) -> Result<&mut Box<dyn PeerConnection>> {
        self.peer
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no peer connection".to_owned()))
    }

    fn ensure_peer(&mut self, ice_servers: &[IceServer]) -> Result<()> {
        if self.peer.is_none() {
            let shim = PeerObserverShim::new(self.events_tx.clone());
            self.peer = Some(self.builder.build(shim, ice_servers)?);
        }
        Ok(())
    }

    fn start_offer(&mut self) -> Result<()> {
        self.offerer = true;
        self.remote_set = false;
        self.state = ControllerState::CreatingOffer;
        self.peer()?.create_offer();
        Ok(())
    }

    fn on_request_offer(&mut self, msg: &Value) -> Result<()> {
        if !matches!(
            self.state,
            ControllerState::New | ControllerState::AwaitOffer
        ) {
            return Err(Error::InvalidState(format!(
                "request-offer received in state {:?}",
                self.state
            )));
        }
        let ice_servers = match msg.get("ice_servers") {
            Some(value) => parse_ice_servers(value)?,
            None => Vec::new(),
        };
        self.ensure_peer(&ice_servers)?;
        self.start_offer()
    }

    fn on_remote_description(&mut self, msg: &Value, sdp_type: SdpType) -> Result<()> {
        let expected = match sdp_type {
            SdpType::Offer => matches!(
                self.state,
                ControllerState::New | ControllerState::AwaitOffer | ControllerState::Connected
            ),
            SdpType::Answer => self.state == ControllerState::AwaitAnswer,
        };
        if !expected {
            return Err(Error::InvalidState(format!(
                "{} received in state {:?}",
                sdp_type, self.state
            )));
        }
        let sdp = get_str(msg, "sdp")?.to_owned();
        if sdp_type == SdpType::Offer {
            self.ensure_peer(&[])?;
            self.offerer = false;
        }
        self.remote_set = false;
        self.state = ControllerState::HaveRemote;
        self.peer()?
            .set_remote_description(SessionDescription { sdp_type, sdp });
        Ok(())
    }

    fn on_ice_candidate(&mut self, msg: &Value) -> Result<()> {
        if self.peer.is_none() {
            return Err(Error::InvalidState(
                "ice candidate received before the peer connection exists".to_owned(),
            ));
        }
        let candidate = parse_ice_candidate(msg)?;
        if !self.remote_set {
            self.pending_ice.push(candidate);
            return Ok(());
        }
        self.peer()?.add_ice_candidate(&candidate)
    }

    fn on_remote_description_set(&mut self) -> Result<()> {
        if self.state != ControllerState::HaveRemote {
            return Err(Error::InvalidState(format!(
                "remote description set in state {:?}",
                self.state
            )));
        }
        self.remote_set = true;
        self.state = ControllerState::DrainIce;
        let pending = std::mem::take(&mut self.pending_ice);
        let peer = self.peer()?;
        for candidate in &pending {
            peer.add_ice_candidate(candidate)?;
        }
        if self.offerer {
            self.state = ControllerState::Connected;
        } else {
            self.state = ControllerState::AwaitLocalSet;
            self.peer()?.create_answer();
        }
        Ok(())
    }

    fn fail(&mut self, e: Error) {
        self.sink
            .send(json!({ "type": "error", "error": e.to_string() }));
        self.fail_quietly(e);
    }

    fn fail_quietly(&mut self, e: Error) {
        error!("signaling failed: {}", e);
        self.state = ControllerState::Failed;
        self.pending_ice.clear();
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        self.observer.on_connection_state_change(Err(e));
    }
}
