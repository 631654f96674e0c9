// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Translation of client input into evdev event streams written to the guest's input devices.
//!
//! Every device writes to its own sink (normally the socket of a vhost-user-input backend). Each
//! client gets an [`InputEventSink`] with a distinct source id so that multi-touch contacts from
//! different clients never share a slot.

pub mod events;
mod touch;

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::debug;
use base::sync::Mutex;
use base::warn;

use crate::input::events::virtio_input_event;
use crate::input::events::InputEventEncoding;
use crate::input::events::REL_WHEEL;
pub use crate::input::touch::SlotMap;
pub use crate::input::touch::SourceId;
pub use crate::input::touch::DEFAULT_MAX_SLOT;
pub use crate::input::touch::TouchSlotTracker;
use crate::Error;
use crate::Result;

/// One finger reported in a multi-touch batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultiTouchContact {
    pub id: i32,
    pub x: i32,
    pub y: i32,
}

struct EventDevice {
    writer: Mutex<Box<dyn Write + Send>>,
    encoding: InputEventEncoding,
}

impl EventDevice {
    fn new(writer: Box<dyn Write + Send>, encoding: InputEventEncoding) -> Self {
        EventDevice {
            writer: Mutex::new(writer),
            encoding,
        }
    }

    fn write_events(&self, events: &[virtio_input_event]) -> Result<()> {
        let bytes = self.encoding.encode(events);
        let mut writer = self.writer.lock();
        writer.write_all(&bytes).map_err(Error::Write)?;
        writer.flush().map_err(Error::Write)
    }
}

struct TouchDevice {
    device: EventDevice,
    slots: TouchSlotTracker,
}

pub struct InputConnectorBuilder {
    encoding: InputEventEncoding,
    touch_devices: HashMap<String, TouchDevice>,
    keyboard: Option<EventDevice>,
    rotary: Option<EventDevice>,
    switches: Option<EventDevice>,
}

impl InputConnectorBuilder {
    pub fn new(encoding: InputEventEncoding) -> Self {
        InputConnectorBuilder {
            encoding,
            touch_devices: HashMap::new(),
            keyboard: None,
            rotary: None,
            switches: None,
        }
    }

    /// Attaches the touch device for the display named `label`, advertising slots up to
    /// [`DEFAULT_MAX_SLOT`].
    pub fn with_touch_device(
        self,
        label: impl Into<String>,
        writer: Box<dyn Write + Send>,
    ) -> Result<Self> {
        self.with_touch_device_max_slot(label, writer, DEFAULT_MAX_SLOT)
    }

    /// Like [`Self::with_touch_device`] for a device whose `ABS_MT_SLOT` maximum is `max_slot`.
    pub fn with_touch_device_max_slot(
        mut self,
        label: impl Into<String>,
        writer: Box<dyn Write + Send>,
        max_slot: i32,
    ) -> Result<Self> {
        let label = label.into();
        if self.touch_devices.contains_key(&label) {
            return Err(Error::DuplicateDevice(label));
        }
        let device = TouchDevice {
            device: EventDevice::new(writer, self.encoding),
            slots: TouchSlotTracker::new(max_slot),
        };
        self.touch_devices.insert(label, device);
        Ok(self)
    }

    pub fn with_keyboard(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.keyboard = Some(EventDevice::new(writer, self.encoding));
        self
    }

    pub fn with_rotary(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.rotary = Some(EventDevice::new(writer, self.encoding));
        self
    }

    pub fn with_switches(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.switches = Some(EventDevice::new(writer, self.encoding));
        self
    }

    pub fn build(self) -> Arc<InputConnector> {
        Arc::new(InputConnector {
            touch_devices: self.touch_devices,
            keyboard: self.keyboard,
            rotary: self.rotary,
            switches: self.switches,
            next_source: AtomicU32::new(0),
        })
    }
}

/// The set of input devices exposed to the guest.
pub struct InputConnector {
    touch_devices: HashMap<String, TouchDevice>,
    keyboard: Option<EventDevice>,
    rotary: Option<EventDevice>,
    switches: Option<EventDevice>,
    next_source: AtomicU32,
}

impl InputConnector {
    /// Creates the event sink for a newly connected client.
    pub fn create_sink(self: &Arc<Self>) -> InputEventSink {
        InputEventSink {
            connector: self.clone(),
            source: self.next_source.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn display_labels(&self) -> impl Iterator<Item = &str> {
        self.touch_devices.keys().map(String::as_str)
    }

    fn touch_device(&self, display: &str) -> Result<&TouchDevice> {
        self.touch_devices
            .get(display)
            .ok_or_else(|| Error::UnknownDisplay(display.to_owned()))
    }

    /// Number of contacts currently down on `display`, across all sources.
    pub fn num_active_contacts(&self, display: &str) -> Result<usize> {
        Ok(self.touch_device(display)?.slots.num_active_slots())
    }
}

/// Per-client handle used to inject events. Dropping it lifts every contact the client still
/// holds without emitting events.
pub struct InputEventSink {
    connector: Arc<InputConnector>,
    source: SourceId,
}

impl InputEventSink {
    pub fn source_id(&self) -> SourceId {
        self.source
    }

    pub fn send_touch_event(&self, display: &str, x: i32, y: i32, down: bool) -> Result<()> {
        let touch = self.connector.touch_device(display)?;
        touch.device.write_events(&[
            virtio_input_event::absolute_x(x),
            virtio_input_event::absolute_y(y),
            virtio_input_event::touch(down),
            virtio_input_event::syn(),
        ])
    }

    /// Presses (`down`) or lifts the given contacts as one batch ended by a single `SYN_REPORT`.
    pub fn send_multi_touch_event(
        &self,
        display: &str,
        contacts: &[MultiTouchContact],
        down: bool,
    ) -> Result<()> {
        let touch = self.connector.touch_device(display)?;
        // Held until the batch is written so batches never interleave on the device.
        let mut slots = touch.slots.lock();
        let mut events = Vec::with_capacity(contacts.len() * 4 + 2);
        if down {
            let was_idle = slots.num_active_slots() == 0;
            for contact in contacts {
                let Some((slot, tracking_id)) = slots.get_or_acquire_slot(self.source, contact.id)
                else {
                    warn!("{}: no free touch slot, dropping contact {}", display, contact.id);
                    continue;
                };
                events.push(virtio_input_event::multitouch_slot(slot));
                if let Some(tracking_id) = tracking_id {
                    events.push(virtio_input_event::multitouch_tracking_id(tracking_id));
                }
                events.push(virtio_input_event::multitouch_absolute_x(contact.x));
                events.push(virtio_input_event::multitouch_absolute_y(contact.y));
            }
            if was_idle && !events.is_empty() {
                events.insert(0, virtio_input_event::touch(true));
            }
        } else {
            let had_contacts = slots.num_active_slots() > 0;
            for contact in contacts {
                match slots.release_slot(self.source, contact.id) {
                    Some(slot) => {
                        events.push(virtio_input_event::multitouch_slot(slot));
                        events.push(virtio_input_event::multitouch_tracking_id(-1));
                    }
                    None => debug!("ignoring release of untracked contact {}", contact.id),
                }
            }
            if had_contacts && slots.num_active_slots() == 0 {
                events.push(virtio_input_event::touch(false));
            }
        }
        if events.is_empty() {
            return Ok(());
        }
        events.push(virtio_input_event::syn());
        touch.device.write_events(&events)
    }

    pub fn send_keyboard_event(&self, code: u16, down: bool) -> Result<()> {
        let keyboard = self
            .connector
            .keyboard
            .as_ref()
            .ok_or(Error::NoDevice("keyboard"))?;
        keyboard.write_events(&[virtio_input_event::key(code, down), virtio_input_event::syn()])
    }

    pub fn send_rotary_event(&self, pixels: i32) -> Result<()> {
        let rotary = self
            .connector
            .rotary
            .as_ref()
            .ok_or(Error::NoDevice("rotary"))?;
        rotary.write_events(&[
            virtio_input_event::relative(REL_WHEEL, pixels),
            virtio_input_event::syn(),
        ])
    }

    pub fn send_switches_event(&self, code: u16, state: bool) -> Result<()> {
        let switches = self
            .connector
            .switches
            .as_ref()
            .ok_or(Error::NoDevice("switches"))?;
        switches.write_events(&[
            virtio_input_event::switch(code, state as i32),
            virtio_input_event::syn(),
        ])
    }
}

impl Drop for InputEventSink {
    fn drop(&mut self) {
        for touch in self.connector.touch_devices.values() {
            touch.slots.on_disconnected_source(self.source);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::io;
    use std::io::Write;
    use std::sync::Arc;

    use base::sync::Mutex;

    use crate::input::events::InputEventEncoding;

    /// Writer whose contents can be inspected after being handed to a device.
    #[derive(Clone, Default)]
    pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn boxed(&self) -> Box<dyn Write + Send> {
            Box::new(self.clone())
        }

        /// Drains the written bytes as `(type, code, value)` triples.
        pub fn take_events(&self) -> Vec<(u16, u16, i32)> {
            let bytes = std::mem::take(&mut *self.0.lock());
            InputEventEncoding::Virtio
                .decode(&bytes)
                .iter()
                .map(|e| e.triple())
                .collect()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::events::*;
    use super::test_util::SharedBuf;
    use super::*;

    fn touch_connector(out: &SharedBuf) -> Arc<InputConnector> {
        InputConnectorBuilder::new(InputEventEncoding::Virtio)
            .with_touch_device("display_0", out.boxed())
            .unwrap()
            .build()
    }

    fn contact(id: i32, x: i32, y: i32) -> MultiTouchContact {
        MultiTouchContact { id, x, y }
    }

    #[test]
    fn contacts_beyond_the_last_slot_are_dropped() {
        let out = SharedBuf::default();
        let connector = InputConnectorBuilder::new(InputEventEncoding::Virtio)
            .with_touch_device_max_slot("display_0", out.boxed(), 0)
            .unwrap()
            .build();
        let sink = connector.create_sink();

        sink.send_multi_touch_event("display_0", &[contact(1, 5, 6), contact(2, 7, 8)], true)
            .unwrap();
        assert_eq!(
            out.take_events(),
            vec![
                (EV_KEY, BTN_TOUCH, 1),
                (EV_ABS, ABS_MT_SLOT, 0),
                (EV_ABS, ABS_MT_TRACKING_ID, 1),
                (EV_ABS, ABS_MT_POSITION_X, 5),
                (EV_ABS, ABS_MT_POSITION_Y, 6),
                (EV_SYN, SYN_REPORT, 0),
            ]
        );
        assert_eq!(connector.num_active_contacts("display_0").unwrap(), 1);

        // Nothing is written when no contact of the batch gets a slot.
        let other = connector.create_sink();
        other
            .send_multi_touch_event("display_0", &[contact(1, 9, 9)], true)
            .unwrap();
        assert!(out.take_events().is_empty());
    }

    #[test]
    fn press_and_release_single_contact() {
        let out = SharedBuf::default();
        let connector = touch_connector(&out);
        let sink = connector.create_sink();

        sink.send_multi_touch_event("display_0", &[contact(3, 100, 200)], true)
            .unwrap();
        sink.send_multi_touch_event("display_0", &[contact(3, 100, 200)], false)
            .unwrap();

        assert_eq!(
            out.take_events(),
            vec![
                (EV_KEY, BTN_TOUCH, 1),
                (EV_ABS, ABS_MT_SLOT, 0),
                (EV_ABS, ABS_MT_TRACKING_ID, 1),
                (EV_ABS, ABS_MT_POSITION_X, 100),
                (EV_ABS, ABS_MT_POSITION_Y, 200),
                (EV_SYN, SYN_REPORT, 0),
                (EV_ABS, ABS_MT_SLOT, 0),
                (EV_ABS, ABS_MT_TRACKING_ID, -1),
                (EV_KEY, BTN_TOUCH, 0),
                (EV_SYN, SYN_REPORT, 0),
            ]
        );
    }

    #[test]
    fn repeated_press_keeps_slot_and_counts_match() {
        let out = SharedBuf::default();
        let connector = touch_connector(&out);
        let first = connector.create_sink();
        let second = connector.create_sink();

        first
            .send_multi_touch_event("display_0", &[contact(7, 1, 1)], true)
            .unwrap();
        second
            .send_multi_touch_event("display_0", &[contact(7, 5, 5)], true)
            .unwrap();
        out.take_events();

        // Moving the same finger reuses its slot and does not toggle BTN_TOUCH.
        first
            .send_multi_touch_event("display_0", &[contact(7, 2, 2)], true)
            .unwrap();
        assert_eq!(
            out.take_events(),
            vec![
                (EV_ABS, ABS_MT_SLOT, 0),
                (EV_ABS, ABS_MT_POSITION_X, 2),
                (EV_ABS, ABS_MT_POSITION_Y, 2),
                (EV_SYN, SYN_REPORT, 0),
            ]
        );
        assert_eq!(connector.num_active_contacts("display_0").unwrap(), 2);

        // Releasing one of two contacts keeps BTN_TOUCH down.
        first
            .send_multi_touch_event("display_0", &[contact(7, 2, 2)], false)
            .unwrap();
        assert_eq!(
            out.take_events(),
            vec![
                (EV_ABS, ABS_MT_SLOT, 0),
                (EV_ABS, ABS_MT_TRACKING_ID, -1),
                (EV_SYN, SYN_REPORT, 0),
            ]
        );
        assert_eq!(connector.num_active_contacts("display_0").unwrap(), 1);

        first
            .send_multi_touch_event("display_0", &[contact(7, 3, 3)], true)
            .unwrap();
        assert_eq!(
            out.take_events()[..2],
            [(EV_ABS, ABS_MT_SLOT, 0), (EV_ABS, ABS_MT_TRACKING_ID, 3)]
        );
        assert_eq!(connector.num_active_contacts("display_0").unwrap(), 2);
    }

    #[test]
    fn release_without_slot_is_ignored() {
        let out = SharedBuf::default();
        let connector = touch_connector(&out);
        let sink = connector.create_sink();
        sink.send_multi_touch_event("display_0", &[contact(1, 0, 0)], false)
            .unwrap();
        assert!(out.take_events().is_empty());
    }

    #[test]
    fn dropped_sink_releases_contacts_silently() {
        let out = SharedBuf::default();
        let connector = touch_connector(&out);
        let sink = connector.create_sink();
        sink.send_multi_touch_event("display_0", &[contact(1, 0, 0), contact(2, 9, 9)], true)
            .unwrap();
        out.take_events();
        drop(sink);
        assert!(out.take_events().is_empty());
        assert_eq!(connector.num_active_contacts("display_0").unwrap(), 0);

        let sink = connector.create_sink();
        sink.send_multi_touch_event("display_0", &[contact(1, 0, 0)], true)
            .unwrap();
        assert_eq!(out.take_events()[..2], [(EV_KEY, BTN_TOUCH, 1), (EV_ABS, ABS_MT_SLOT, 0)]);
    }

    #[test]
    fn unknown_display_is_rejected() {
        let out = SharedBuf::default();
        let sink = touch_connector(&out).create_sink();
        let err = sink
            .send_multi_touch_event("display_9", &[contact(1, 0, 0)], true)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDisplay(label) if label == "display_9"));
        assert!(out.take_events().is_empty());
    }

    #[test]
    fn duplicate_touch_device_is_rejected() {
        let out = SharedBuf::default();
        let result = InputConnectorBuilder::new(InputEventEncoding::Virtio)
            .with_touch_device("display_0", out.boxed())
            .unwrap()
            .with_touch_device("display_0", out.boxed());
        assert!(matches!(result, Err(Error::DuplicateDevice(_))));
    }

    #[test]
    fn mouse_keyboard_rotary_and_switches() {
        let touch = SharedBuf::default();
        let keyboard = SharedBuf::default();
        let rotary = SharedBuf::default();
        let switches = SharedBuf::default();
        let connector = InputConnectorBuilder::new(InputEventEncoding::Virtio)
            .with_touch_device("display_0", touch.boxed())
            .unwrap()
            .with_keyboard(keyboard.boxed())
            .with_rotary(rotary.boxed())
            .with_switches(switches.boxed())
            .build();
        let sink = connector.create_sink();

        sink.send_touch_event("display_0", 10, 20, true).unwrap();
        assert_eq!(
            touch.take_events(),
            vec![
                (EV_ABS, ABS_X, 10),
                (EV_ABS, ABS_Y, 20),
                (EV_KEY, BTN_TOUCH, 1),
                (EV_SYN, SYN_REPORT, 0),
            ]
        );

        sink.send_keyboard_event(30, true).unwrap();
        assert_eq!(
            keyboard.take_events(),
            vec![(EV_KEY, 30, 1), (EV_SYN, SYN_REPORT, 0)]
        );

        sink.send_rotary_event(-3).unwrap();
        assert_eq!(
            rotary.take_events(),
            vec![(EV_REL, REL_WHEEL, -3), (EV_SYN, SYN_REPORT, 0)]
        );

        sink.send_switches_event(SW_LID, true).unwrap();
        assert_eq!(
            switches.take_events(),
            vec![(EV_SW, SW_LID, 1), (EV_SYN, SYN_REPORT, 0)]
        );
    }

    #[test]
    fn missing_device_is_reported() {
        let out = SharedBuf::default();
        let sink = touch_connector(&out).create_sink();
        assert!(matches!(
            sink.send_keyboard_event(30, true),
            Err(Error::NoDevice("keyboard"))
        ));
    }
}
