// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;

use base::debug;
use base::warn;
use serde_json::Value;

use crate::data_channels::JsonSender;
use crate::data_channels::MessageSender;
use crate::input::events::SW_LID;
use crate::input::InputEventSink;
use crate::input::MultiTouchContact;
use crate::keyboard::KEY_BACK;
use crate::keyboard::KEY_HOMEPAGE;
use crate::keyboard::KEY_MENU;
use crate::keyboard::KEY_POWER;
use crate::keyboard::KEY_VOLUMEDOWN;
use crate::keyboard::KEY_VOLUMEUP;
use crate::Result;

/// Device state reported on the control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchEvent {
    LidOpen(bool),
    HingeAngle(i32),
}

fn unhandled(what: &str) -> Result<()> {
    warn!("unhandled {}", what);
    Ok(())
}

/// Device-side receiver of everything a client sends over its data channels.
///
/// Every method has a default that logs and drops the event, so an implementation only needs the
/// subsystems it actually attaches.
pub trait ConnectionObserver: Send + Sync {
    fn on_touch_event(&self, _display_label: &str, _x: i32, _y: i32, _down: bool) -> Result<()> {
        unhandled("touch event")
    }

    fn on_multi_touch_event(
        &self,
        _display_label: &str,
        _contacts: &[MultiTouchContact],
        _down: bool,
    ) -> Result<()> {
        unhandled("multi-touch event")
    }

    /// `code` is already translated to an evdev key code.
    fn on_keyboard_event(&self, _code: u16, _down: bool) -> Result<()> {
        unhandled("keyboard event")
    }

    fn on_wheel_event(&self, _pixels: i32) -> Result<()> {
        unhandled("wheel event")
    }

    fn on_mouse_move(&self, _x: i32, _y: i32) -> Result<()> {
        unhandled("mouse move")
    }

    fn on_mouse_button(&self, _button: i32, _down: bool) -> Result<()> {
        unhandled("mouse button")
    }

    fn on_mouse_wheel(&self, _pixels: i32) -> Result<()> {
        unhandled("mouse wheel")
    }

    fn on_switch_event(&self, _event: SwitchEvent) -> Result<()> {
        unhandled("switch event")
    }

    fn on_power_button(&self, _down: bool) -> Result<()> {
        unhandled("power button")
    }

    fn on_back_button(&self, _down: bool) -> Result<()> {
        unhandled("back button")
    }

    fn on_home_button(&self, _down: bool) -> Result<()> {
        unhandled("home button")
    }

    fn on_menu_button(&self, _down: bool) -> Result<()> {
        unhandled("menu button")
    }

    fn on_volume_down_button(&self, _down: bool) -> Result<()> {
        unhandled("volume down button")
    }

    fn on_volume_up_button(&self, _down: bool) -> Result<()> {
        unhandled("volume up button")
    }

    fn on_custom_action_button(&self, _command: &str, _down: bool) -> Result<()> {
        unhandled("custom action button")
    }

    fn on_display_control_msg(&self, _msg: &Value) -> Result<()> {
        unhandled("display control message")
    }

    fn on_camera_control_msg(&self, _msg: &Value) -> Result<()> {
        unhandled("camera control message")
    }

    fn on_control_channel_open(&self, _sender: JsonSender) {
        debug!("control channel open");
    }

    fn on_adb_channel_open(&self, _sender: MessageSender) {
        debug!("unhandled adb channel");
    }

    fn on_adb_message(&self, _msg: &[u8]) -> Result<()> {
        unhandled("adb message")
    }

    fn on_bluetooth_channel_open(&self, _sender: MessageSender) {
        debug!("unhandled bluetooth channel");
    }

    fn on_bluetooth_message(&self, _msg: &[u8]) -> Result<()> {
        unhandled("bluetooth message")
    }

    fn on_sensors_channel_open(&self, _sender: MessageSender) {
        debug!("unhandled sensors channel");
    }

    fn on_sensors_channel_closed(&self) {}

    fn on_sensors_message(&self, _msg: &[u8]) -> Result<()> {
        unhandled("sensors message")
    }

    fn on_lights_channel_open(&self, _sender: JsonSender) {
        debug!("unhandled lights channel");
    }

    fn on_lights_channel_closed(&self) {}

    fn on_location_channel_open(&self, _sender: MessageSender) {
        debug!("unhandled location channel");
    }

    fn on_location_message(&self, _msg: &[u8]) -> Result<()> {
        unhandled("location message")
    }

    fn on_kml_locations_channel_open(&self, _sender: MessageSender) {
        debug!("unhandled kml locations channel");
    }

    fn on_kml_locations_message(&self, _msg: &[u8]) -> Result<()> {
        unhandled("kml locations message")
    }

    fn on_gpx_locations_channel_open(&self, _sender: MessageSender) {
        debug!("unhandled gpx locations channel");
    }

    fn on_gpx_locations_message(&self, _msg: &[u8]) -> Result<()> {
        unhandled("gpx locations message")
    }

    fn on_camera_data(&self, _frame: &[u8]) -> Result<()> {
        unhandled("camera frame")
    }
}

/// Forwards a client's input and hardware buttons to the guest's input devices.
pub struct InputForwarder {
    sink: InputEventSink,
    custom_actions: HashMap<String, u16>,
}

impl InputForwarder {
    pub fn new(sink: InputEventSink) -> Self {
        InputForwarder {
            sink,
            custom_actions: HashMap::new(),
        }
    }

    /// Maps custom control buttons to the key code they press.
    pub fn with_custom_actions(mut self, custom_actions: HashMap<String, u16>) -> Self {
        self.custom_actions = custom_actions;
        self
    }
}

impl ConnectionObserver for InputForwarder {
    fn on_touch_event(&self, display_label: &str, x: i32, y: i32, down: bool) -> Result<()> {
        self.sink.send_touch_event(display_label, x, y, down)
    }

    fn on_multi_touch_event(
        &self,
        display_label: &str,
        contacts: &[MultiTouchContact],
        down: bool,
    ) -> Result<()> {
        self.sink.send_multi_touch_event(display_label, contacts, down)
    }

    fn on_keyboard_event(&self, code: u16, down: bool) -> Result<()> {
        self.sink.send_keyboard_event(code, down)
    }

    fn on_wheel_event(&self, pixels: i32) -> Result<()> {
        self.sink.send_rotary_event(pixels)
    }

    fn on_switch_event(&self, event: SwitchEvent) -> Result<()> {
        match event {
            // The switch reports "lid closed".
            SwitchEvent::LidOpen(open) => self.sink.send_switches_event(SW_LID, !open),
            SwitchEvent::HingeAngle(angle) => {
                debug!("hinge angle {} has no input device", angle);
                Ok(())
            }
        }
    }

    fn on_power_button(&self, down: bool) -> Result<()> {
        self.sink.send_keyboard_event(KEY_POWER, down)
    }

    fn on_back_button(&self, down: bool) -> Result<()> {
        self.sink.send_keyboard_event(KEY_BACK, down)
    }

    fn on_home_button(&self, down: bool) -> Result<()> {
        self.sink.send_keyboard_event(KEY_HOMEPAGE, down)
    }

    fn on_menu_button(&self, down: bool) -> Result<()> {
        self.sink.send_keyboard_event(KEY_MENU, down)
    }

    fn on_volume_down_button(&self, down: bool) -> Result<()> {
        self.sink.send_keyboard_event(KEY_VOLUMEDOWN, down)
    }

    fn on_volume_up_button(&self, down: bool) -> Result<()> {
        self.sink.send_keyboard_event(KEY_VOLUMEUP, down)
    }

    fn on_custom_action_button(&self, command: &str, down: bool) -> Result<()> {
        match self.custom_actions.get(command) {
            Some(&code) => self.sink.send_keyboard_event(code, down),
            None => unhandled(command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::events::*;
    use crate::input::test_util::SharedBuf;
    use crate::input::InputConnectorBuilder;

    #[test]
    fn buttons_and_lid() {
        let keyboard = SharedBuf::default();
        let switches = SharedBuf::default();
        let connector = InputConnectorBuilder::new(InputEventEncoding::Virtio)
            .with_keyboard(keyboard.boxed())
            .with_switches(switches.boxed())
            .build();
        let forwarder = InputForwarder::new(connector.create_sink())
            .with_custom_actions(HashMap::from([("screenshot".to_string(), 0x63)]));

        forwarder.on_power_button(true).unwrap();
        forwarder.on_home_button(false).unwrap();
        forwarder.on_custom_action_button("screenshot", true).unwrap();
        forwarder.on_custom_action_button("unknown", true).unwrap();
        assert_eq!(
            keyboard.take_events(),
            vec![
                (EV_KEY, KEY_POWER, 1),
                (EV_SYN, SYN_REPORT, 0),
                (EV_KEY, KEY_HOMEPAGE, 0),
                (EV_SYN, SYN_REPORT, 0),
                (EV_KEY, 0x63, 1),
                (EV_SYN, SYN_REPORT, 0),
            ]
        );

        forwarder.on_switch_event(SwitchEvent::LidOpen(false)).unwrap();
        assert_eq!(
            switches.take_events(),
            vec![(EV_SW, SW_LID, 1), (EV_SYN, SYN_REPORT, 0)]
        );
    }
}
