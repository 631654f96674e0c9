// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Linux input event codes and the two wire encodings accepted by vhost-user-input devices.

use std::mem::size_of;

use serde::Deserialize;
use serde::Serialize;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::I32 as SLe32;
use zerocopy::byteorder::little_endian::U16 as Le16;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;
pub const EV_SW: u16 = 0x05;

pub const SYN_REPORT: u16 = 0;

pub const REL_WHEEL: u16 = 0x08;

pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_MT_SLOT: u16 = 0x2f;
pub const ABS_MT_POSITION_X: u16 = 0x35;
pub const ABS_MT_POSITION_Y: u16 = 0x36;
pub const ABS_MT_TRACKING_ID: u16 = 0x39;

pub const BTN_LEFT: u16 = 0x110;
pub const BTN_RIGHT: u16 = 0x111;
pub const BTN_MIDDLE: u16 = 0x112;
pub const BTN_TOUCH: u16 = 0x14a;

pub const SW_LID: u16 = 0x00;

/// Event as carried on a virtio-input queue.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct virtio_input_event {
    pub type_: Le16,
    pub code: Le16,
    pub value: SLe32,
}

/// Event as read from or written to an evdev character device.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout,
)]
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct input_event {
    pub timestamp_fields: [u64; 2],
    pub type_: u16,
    pub code: u16,
    pub value: i32,
}

const_assert_eq!(size_of::<virtio_input_event>(), 8);
const_assert_eq!(size_of::<input_event>(), 24);

impl input_event {
    pub fn from_virtio_input_event(other: &virtio_input_event) -> input_event {
        input_event {
            timestamp_fields: [0, 0],
            type_: other.type_.get(),
            code: other.code.get(),
            value: other.value.get(),
        }
    }
}

impl virtio_input_event {
    fn new(type_: u16, code: u16, value: i32) -> virtio_input_event {
        virtio_input_event {
            type_: Le16::new(type_),
            code: Le16::new(code),
            value: SLe32::new(value),
        }
    }

    #[inline]
    pub fn syn() -> virtio_input_event {
        Self::new(EV_SYN, SYN_REPORT, 0)
    }

    #[inline]
    pub fn absolute(code: u16, value: i32) -> virtio_input_event {
        Self::new(EV_ABS, code, value)
    }

    #[inline]
    pub fn relative(code: u16, value: i32) -> virtio_input_event {
        Self::new(EV_REL, code, value)
    }

    #[inline]
    pub fn switch(code: u16, value: i32) -> virtio_input_event {
        Self::new(EV_SW, code, value)
    }

    #[inline]
    pub fn multitouch_tracking_id(id: i32) -> virtio_input_event {
        Self::absolute(ABS_MT_TRACKING_ID, id)
    }

    #[inline]
    pub fn multitouch_slot(slot: i32) -> virtio_input_event {
        Self::absolute(ABS_MT_SLOT, slot)
    }

    #[inline]
    pub fn multitouch_absolute_x(x: i32) -> virtio_input_event {
        Self::absolute(ABS_MT_POSITION_X, x)
    }

    #[inline]
    pub fn multitouch_absolute_y(y: i32) -> virtio_input_event {
        Self::absolute(ABS_MT_POSITION_Y, y)
    }

    #[inline]
    pub fn absolute_x(x: i32) -> virtio_input_event {
        Self::absolute(ABS_X, x)
    }

    #[inline]
    pub fn absolute_y(y: i32) -> virtio_input_event {
        Self::absolute(ABS_Y, y)
    }

    #[inline]
    pub fn touch(has_contact: bool) -> virtio_input_event {
        Self::key(BTN_TOUCH, has_contact)
    }

    #[inline]
    pub fn key(code: u16, down: bool) -> virtio_input_event {
        Self::new(EV_KEY, code, down as i32)
    }

    /// Returns `(type, code, value)` in host order.
    pub fn triple(&self) -> (u16, u16, i32) {
        (self.type_.get(), self.code.get(), self.value.get())
    }
}

/// Which struct layout a device socket expects.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputEventEncoding {
    #[default]
    Virtio,
    Evdev,
}

impl InputEventEncoding {
    pub fn event_size(self) -> usize {
        match self {
            InputEventEncoding::Virtio => size_of::<virtio_input_event>(),
            InputEventEncoding::Evdev => size_of::<input_event>(),
        }
    }

    /// Serializes `events` back to back.
    pub fn encode(self, events: &[virtio_input_event]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(events.len() * self.event_size());
        for event in events {
            match self {
                InputEventEncoding::Virtio => buf.extend_from_slice(event.as_bytes()),
                InputEventEncoding::Evdev => {
                    buf.extend_from_slice(input_event::from_virtio_input_event(event).as_bytes())
                }
            }
        }
        buf
    }

    /// Splits a byte stream back into events. Trailing partial events are dropped.
    pub fn decode(self, data: &[u8]) -> Vec<virtio_input_event> {
        data.chunks_exact(self.event_size())
            .filter_map(|chunk| match self {
                InputEventEncoding::Virtio => virtio_input_event::read_from_bytes(chunk).ok(),
                InputEventEncoding::Evdev => input_event::read_from_bytes(chunk)
                    .ok()
                    .map(|e| virtio_input_event::new(e.type_, e.code, e.value)),
            })
            .collect()
    }
}
