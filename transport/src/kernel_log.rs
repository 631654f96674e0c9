// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Boot milestones parsed from the guest kernel log, as a stream of framed messages.
//!
//! Each event is one message whose command is the event code and whose payload is a JSON object
//! of metadata (possibly `{}`).

use base::warn;
use enumn::N;
use serde_json::Value;

use crate::Channel;
use crate::Error;
use crate::ManagedMessage;
use crate::Result;

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum KernelLogEventType {
    BootStarted = 0,
    BootCompleted = 1,
    BootFailed = 2,
    WifiNetworkConnected = 3,
    MobileNetworkConnected = 4,
    AdbdStarted = 5,
    ScreenChanged = 6,
    EthernetNetworkConnected = 7,
    KernelLoaded = 8,
    BootloaderLoaded = 9,
    BootPending = 10,
    DisplayPowerModeChanged = 11,
    FastbootStarted = 12,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KernelLogEvent {
    pub event: KernelLogEventType,
    pub metadata: Value,
}

impl KernelLogEvent {
    pub fn new(event: KernelLogEventType) -> Self {
        KernelLogEvent {
            event,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn to_message(&self) -> Result<ManagedMessage> {
        let payload = self.metadata.to_string();
        ManagedMessage::with_payload(self.event as u32, payload.as_bytes())
    }

    pub fn from_message(message: &ManagedMessage) -> Result<Self> {
        let event = KernelLogEventType::n(message.command()).ok_or_else(|| Error::Malformed {
            what: "kernel log event",
            reason: format!("unknown event code {}", message.command()),
        })?;
        let metadata = if message.payload().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(message.payload()).map_err(|e| Error::Malformed {
                what: "kernel log metadata",
                reason: e.to_string(),
            })?
        };
        Ok(KernelLogEvent { event, metadata })
    }
}

pub fn write_event(channel: &dyn Channel, event: &KernelLogEvent) -> Result<()> {
    let mut message = event.to_message()?;
    channel.send_request(&mut message)
}

/// Reads events until the channel reaches EOF, passing each to `handler`.
///
/// Undecodable events are logged and skipped. Returns `Ok` on EOF.
pub fn for_each_event<F>(channel: &dyn Channel, mut handler: F) -> Result<()>
where
    F: FnMut(KernelLogEvent),
{
    loop {
        let message = match channel.receive_message() {
            Ok(m) => m,
            Err(Error::Eof) => return Ok(()),
            Err(e) => return Err(e),
        };
        match KernelLogEvent::from_message(&message) {
            Ok(event) => handler(event),
            Err(e) => warn!("kernel_log: skipping event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::FdChannel;

    #[test]
    fn events_are_delivered_in_order_and_unknown_codes_skipped() {
        let (writer, reader) = FdChannel::pair().unwrap();
        write_event(&writer, &KernelLogEvent::new(KernelLogEventType::BootStarted)).unwrap();
        let mut bogus = ManagedMessage::with_payload(99, b"{}").unwrap();
        writer.send_request(&mut bogus).unwrap();
        let mut screen = KernelLogEvent::new(KernelLogEventType::ScreenChanged);
        screen.metadata = json!({"screen_state": "on"});
        write_event(&writer, &screen).unwrap();
        drop(writer);

        let mut seen = Vec::new();
        for_each_event(&reader, |e| seen.push(e)).unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event, KernelLogEventType::BootStarted);
        assert_eq!(seen[1], screen);
    }

    #[test]
    fn empty_payload_means_no_metadata() {
        let message = ManagedMessage::with_payload(9, b"").unwrap();
        let event = KernelLogEvent::from_message(&message).unwrap();
        assert_eq!(event.event, KernelLogEventType::BootloaderLoaded);
        assert!(event.metadata.as_object().unwrap().is_empty());
    }
}
