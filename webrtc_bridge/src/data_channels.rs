// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-label handling of the data channels a client opens.
//!
//! Each label gets one handler. Handlers for device subsystems that may be absent (adb,
//! bluetooth, location, sensors) only connect the subsystem once the first message proves the
//! client actually uses the channel.

use std::collections::HashMap;
use std::sync::Arc;

use base::debug;
use base::info;
use base::warn;
use serde_json::Value;

use crate::input::MultiTouchContact;
use crate::keyboard::KeyMapping;
use crate::observer::ConnectionObserver;
use crate::observer::SwitchEvent;
use crate::Error;
use crate::Result;

const CAMERA_DATA_EOF: &[u8] = b"EOF";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The outbound half of a data channel, supplied by the WebRTC stack.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Queues `data` for the client. Returns false if the channel could not take it.
    fn send(&self, data: &[u8], binary: bool) -> bool;
}

/// Sends binary messages to the client over one channel.
#[derive(Clone)]
pub struct MessageSender {
    channel: Arc<dyn DataChannel>,
}

impl MessageSender {
    pub fn send(&self, data: &[u8]) -> bool {
        self.channel.send(data, true)
    }
}

/// Sends JSON text messages to the client over one channel.
#[derive(Clone)]
pub struct JsonSender {
    channel: Arc<dyn DataChannel>,
}

impl JsonSender {
    pub fn send(&self, msg: &Value) -> bool {
        self.channel.send(msg.to_string().as_bytes(), false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelKind {
    Input,
    Control,
    Adb,
    Bluetooth,
    Camera,
    Sensors,
    Lights,
    Location,
    KmlLocations,
    GpxLocations,
}

impl ChannelKind {
    fn from_label(label: &str) -> Option<ChannelKind> {
        Some(match label {
            "input-channel" => ChannelKind::Input,
            "device-control" => ChannelKind::Control,
            "adb-channel" => ChannelKind::Adb,
            "bluetooth-channel" => ChannelKind::Bluetooth,
            "camera-data-channel" => ChannelKind::Camera,
            "sensors-channel" => ChannelKind::Sensors,
            "lights-channel" => ChannelKind::Lights,
            "location-channel" => ChannelKind::Location,
            "kml-locations-channel" => ChannelKind::KmlLocations,
            "gpx-locations-channel" => ChannelKind::GpxLocations,
            _ => return None,
        })
    }
}

struct ChannelHandler {
    kind: ChannelKind,
    channel: Arc<dyn DataChannel>,
    first_message_received: bool,
    camera_frame: Vec<u8>,
}

impl ChannelHandler {
    fn message_sender(&self) -> MessageSender {
        MessageSender {
            channel: self.channel.clone(),
        }
    }

    fn json_sender(&self) -> JsonSender {
        JsonSender {
            channel: self.channel.clone(),
        }
    }
}

/// Routes data-channel traffic of one client connection to a [`ConnectionObserver`].
pub struct DataChannelRouter {
    observer: Arc<dyn ConnectionObserver>,
    key_mapping: KeyMapping,
    handlers: HashMap<String, ChannelHandler>,
}

impl DataChannelRouter {
    pub fn new(observer: Arc<dyn ConnectionObserver>) -> Self {
        DataChannelRouter {
            observer,
            key_mapping: KeyMapping::default(),
            handlers: HashMap::new(),
        }
    }

    pub fn with_key_mapping(mut self, key_mapping: KeyMapping) -> Self {
        self.key_mapping = key_mapping;
        self
    }

    /// Registers a channel the client created. Unknown labels and duplicates are ignored.
    pub fn on_data_channel_open(&mut self, channel: Arc<dyn DataChannel>) {
        let label = channel.label().to_owned();
        let kind = match ChannelKind::from_label(&label) {
            Some(kind) => kind,
            None => {
                warn!("unknown data channel: {}", label);
                return;
            }
        };
        if self.handlers.contains_key(&label) {
            warn!("data channel {} already has a handler", label);
            return;
        }
        debug!("data channel {} created", label);
        self.handlers.insert(
            label,
            ChannelHandler {
                kind,
                channel,
                first_message_received: false,
                camera_frame: Vec::new(),
            },
        );
    }

    pub fn on_state_change(&mut self, label: &str, state: DataChannelState) {
        let handler = match self.handlers.get(label) {
            Some(handler) => handler,
            None => return,
        };
        info!("data channel {} is {:?}", label, state);
        match (handler.kind, state) {
            (ChannelKind::Control, DataChannelState::Open) => {
                self.observer.on_control_channel_open(handler.json_sender())
            }
            (ChannelKind::Lights, DataChannelState::Open) => {
                self.observer.on_lights_channel_open(handler.json_sender())
            }
            (ChannelKind::Lights, DataChannelState::Closed) => {
                self.observer.on_lights_channel_closed()
            }
            (ChannelKind::Sensors, DataChannelState::Closed) if handler.first_message_received => {
                self.observer.on_sensors_channel_closed()
            }
            _ => {}
        }
        if state == DataChannelState::Closed {
            self.handlers.remove(label);
        }
    }

    /// Handles one client message. Failures are logged and the channel stays open.
    pub fn on_message(&mut self, label: &str, data: &[u8], binary: bool) {
        let handler = match self.handlers.get_mut(label) {
            Some(handler) => handler,
            None => {
                debug!("message on unregistered data channel {}", label);
                return;
            }
        };
        if !handler.first_message_received {
            handler.first_message_received = true;
            let observer = &self.observer;
            match handler.kind {
                ChannelKind::Adb => observer.on_adb_channel_open(handler.message_sender()),
                ChannelKind::Bluetooth => {
                    observer.on_bluetooth_channel_open(handler.message_sender())
                }
                ChannelKind::Location => observer.on_location_channel_open(handler.message_sender()),
                ChannelKind::KmlLocations => {
                    observer.on_kml_locations_channel_open(handler.message_sender())
                }
                ChannelKind::GpxLocations => {
                    observer.on_gpx_locations_channel_open(handler.message_sender())
                }
                ChannelKind::Sensors => {
                    // The first sensors message is a handshake.
                    observer.on_sensors_channel_open(handler.message_sender());
                    return;
                }
                _ => {}
            }
        }
        let result = match handler.kind {
            ChannelKind::Input => handle_input(&*self.observer, &self.key_mapping, data, binary),
            ChannelKind::Control => handle_control(&*self.observer, data),
            ChannelKind::Adb => self.observer.on_adb_message(data),
            ChannelKind::Bluetooth => self.observer.on_bluetooth_message(data),
            ChannelKind::Sensors => self.observer.on_sensors_message(data),
            ChannelKind::Location => self.observer.on_location_message(data),
            ChannelKind::KmlLocations => self.observer.on_kml_locations_message(data),
            ChannelKind::GpxLocations => self.observer.on_gpx_locations_message(data),
            ChannelKind::Camera => {
                if data == CAMERA_DATA_EOF {
                    let frame = std::mem::take(&mut handler.camera_frame);
                    self.observer.on_camera_data(&frame)
                } else {
                    handler.camera_frame.extend_from_slice(data);
                    Ok(())
                }
            }
            ChannelKind::Lights => {
                debug!("ignoring client message on the lights channel");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("failed to handle message on {}: {}", label, e);
        }
    }
}

fn parse_json(data: &[u8]) -> Result<Value> {
    serde_json::from_slice(data).map_err(|e| Error::InvalidMessage(e.to_string()))
}

fn get_field<'a>(msg: &'a Value, field: &'static str, expected: &'static str) -> Result<&'a Value> {
    msg.get(field).ok_or(Error::InvalidField { field, expected })
}

fn get_str<'a>(msg: &'a Value, field: &'static str) -> Result<&'a str> {
    const EXPECTED: &str = "a string";
    get_field(msg, field, EXPECTED)?
        .as_str()
        .ok_or(Error::InvalidField {
            field,
            expected: EXPECTED,
        })
}

fn to_i32(value: &Value, field: &'static str) -> Result<i32> {
    value
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or(Error::InvalidField {
            field,
            expected: "a 32-bit integer",
        })
}

fn get_int(msg: &Value, field: &'static str) -> Result<i32> {
    to_i32(get_field(msg, field, "a 32-bit integer")?, field)
}

fn get_bool(msg: &Value, field: &'static str) -> Result<bool> {
    const EXPECTED: &str = "a boolean";
    get_field(msg, field, EXPECTED)?
        .as_bool()
        .ok_or(Error::InvalidField {
            field,
            expected: EXPECTED,
        })
}

fn get_int_array(msg: &Value, field: &'static str) -> Result<Vec<i32>> {
    const EXPECTED: &str = "an array of integers";
    get_field(msg, field, EXPECTED)?
        .as_array()
        .ok_or(Error::InvalidField {
            field,
            expected: EXPECTED,
        })?
        .iter()
        .map(|v| to_i32(v, field))
        .collect()
}

fn handle_input(
    observer: &dyn ConnectionObserver,
    key_mapping: &KeyMapping,
    data: &[u8],
    binary: bool,
) -> Result<()> {
    if binary {
        return Err(Error::InvalidMessage(
            "binary data on the input channel".to_owned(),
        ));
    }
    let evt = parse_json(data)?;
    match get_str(&evt, "type")? {
        "mouse" => {
            let down = get_int(&evt, "down")? != 0;
            let x = get_int(&evt, "x")?;
            let y = get_int(&evt, "y")?;
            let label = get_str(&evt, "display_label")?;
            observer.on_touch_event(label, x, y, down)
        }
        "multi-touch" => {
            let label = match evt.get("display_label") {
                Some(_) => get_str(&evt, "display_label")?,
                None => get_str(&evt, "device_label")?,
            };
            let ids = get_int_array(&evt, "id")?;
            let xs = get_int_array(&evt, "x")?;
            let ys = get_int_array(&evt, "y")?;
            let down = get_int(&evt, "down")? != 0;
            if xs.len() != ids.len() || ys.len() != ids.len() {
                return Err(Error::InvalidMessage(format!(
                    "multi-touch arrays differ in length: id={} x={} y={}",
                    ids.len(),
                    xs.len(),
                    ys.len()
                )));
            }
            let contacts: Vec<MultiTouchContact> = ids
                .iter()
                .zip(xs.iter().zip(ys.iter()))
                .map(|(&id, (&x, &y))| MultiTouchContact { id, x, y })
                .collect();
            observer.on_multi_touch_event(label, &contacts, down)
        }
        "keyboard" => {
            let down = match get_str(&evt, "event_type")? {
                "keydown" => true,
                "keyup" => false,
                _ => {
                    return Err(Error::InvalidField {
                        field: "event_type",
                        expected: "keydown or keyup",
                    })
                }
            };
            let keycode = get_str(&evt, "keycode")?;
            let code = key_mapping
                .translate(keycode)
                .ok_or_else(|| Error::UnknownKey(keycode.to_owned()))?;
            observer.on_keyboard_event(code, down)
        }
        "wheel" => observer.on_wheel_event(get_int(&evt, "pixels")?),
        "mouseMove" => observer.on_mouse_move(get_int(&evt, "x")?, get_int(&evt, "y")?),
        "mouseButton" => {
            observer.on_mouse_button(get_int(&evt, "button")?, get_int(&evt, "down")? != 0)
        }
        "mouseWheel" => observer.on_mouse_wheel(get_int(&evt, "pixels")?),
        other => Err(Error::InvalidMessage(format!(
            "unrecognized input event type {}",
            other
        ))),
    }
}

fn handle_control(observer: &dyn ConnectionObserver, data: &[u8]) -> Result<()> {
    let evt = parse_json(data)?;
    let command = get_str(&evt, "command")?;
    match command {
        "device_state" => {
            if evt.get("lid_switch_open").is_some() {
                let open = get_bool(&evt, "lid_switch_open")?;
                observer.on_switch_event(SwitchEvent::LidOpen(open))?;
            }
            if evt.get("hinge_angle_value").is_some() {
                let angle = get_int(&evt, "hinge_angle_value")?;
                observer.on_switch_event(SwitchEvent::HingeAngle(angle))?;
            }
            return Ok(());
        }
        "display" | "add-display" | "remove-display" => {
            return observer.on_display_control_msg(&evt);
        }
        _ if command.starts_with("camera_") => return observer.on_camera_control_msg(&evt),
        _ => {}
    }
    let down = match get_str(&evt, "button_state")? {
        "down" => true,
        "up" => false,
        _ => {
            return Err(Error::InvalidField {
                field: "button_state",
                expected: "down or up",
            })
        }
    };
    debug!("control command {} ({})", command, down);
    match command {
        "power" => observer.on_power_button(down),
        "back" => observer.on_back_button(down),
        "home" => observer.on_home_button(down),
        "menu" => observer.on_menu_button(down),
        "volumedown" => observer.on_volume_down_button(down),
        "volumeup" => observer.on_volume_up_button(down),
        custom => observer.on_custom_action_button(custom, down),
    }
}
