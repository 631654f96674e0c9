// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use base::debug;
use base::warn;
use enumn::N;
use transport::Channel;
use transport::ManagedMessage;

use crate::common::SensorsMask;
use crate::simulator::SensorsSimulator;
use crate::Error;
use crate::Result;

/// Request commands sent by the client.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum SensorsCommand {
    UpdateRotationVec = 0,
    GetSensorsData = 1,
    UpdateLowLatencyOffBodyDetect = 2,
}

fn parse_f64(text: &str, what: &'static str) -> Result<f64> {
    text.trim().parse().map_err(|e| Error::InvalidPayload {
        what,
        reason: format!("{:?}: {}", text, e),
    })
}

/// Parses `"x:y:z"`.
fn parse_rotation(payload: &str) -> Result<(f64, f64, f64)> {
    const WHAT: &str = "rotation vector";
    let parts: Vec<&str> = payload.split(':').collect();
    if parts.len() != 3 {
        return Err(Error::InvalidPayload {
            what: WHAT,
            reason: format!("expected 3 components, got {}", parts.len()),
        });
    }
    Ok((
        parse_f64(parts[0], WHAT)?,
        parse_f64(parts[1], WHAT)?,
        parse_f64(parts[2], WHAT)?,
    ))
}

fn parse_mask(payload: &str) -> Result<SensorsMask> {
    payload.trim().parse().map_err(|e| Error::InvalidPayload {
        what: "sensors mask",
        reason: format!("{:?}: {}", payload, e),
    })
}

fn is_channel_failure(e: &Error) -> bool {
    matches!(e, Error::Transport(t) if !matches!(t, transport::Error::Malformed { .. }))
}

/// Serves client requests against a [`SensorsSimulator`].
pub struct SensorsHandler {
    simulator: Arc<SensorsSimulator>,
}

impl SensorsHandler {
    pub fn new(simulator: Arc<SensorsSimulator>) -> Self {
        SensorsHandler { simulator }
    }

    /// Handles one request, replying on `channel` when the command has a response.
    pub fn process_request(&self, channel: &dyn Channel, request: &ManagedMessage) -> Result<()> {
        let command = SensorsCommand::n(request.command())
            .ok_or(Error::UnknownCommand(request.command()))?;
        let payload = request.payload_str()?;
        match command {
            SensorsCommand::UpdateRotationVec => {
                let (x, y, z) = parse_rotation(payload)?;
                self.simulator.update_rotation_vec(x, y, z);
            }
            SensorsCommand::GetSensorsData => {
                let mask = parse_mask(payload)?;
                let data = self.simulator.get_sensors_data(mask);
                let mut reply = ManagedMessage::with_payload(command as u32, data.as_bytes())?;
                channel.send_response(&mut reply)?;
            }
            SensorsCommand::UpdateLowLatencyOffBodyDetect => {
                let value = parse_f64(payload, "off-body value")?;
                self.simulator.set_low_latency_off_body(value);
            }
        }
        Ok(())
    }

    /// Serves requests until the peer closes the channel. Bad requests are logged and skipped.
    pub fn run(&self, channel: &dyn Channel) -> Result<()> {
        loop {
            let request = match channel.receive_message() {
                Ok(request) => request,
                Err(transport::Error::Eof) => {
                    debug!("sensors channel closed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = self.process_request(channel, &request) {
                if is_channel_failure(&e) {
                    return Err(e);
                }
                warn!("sensors: dropping request {}: {}", request.command(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use base::FailureKind;
    use transport::FdChannel;

    use super::*;

    fn request(command: u32, payload: &str) -> ManagedMessage {
        ManagedMessage::with_payload(command, payload.as_bytes()).unwrap()
    }

    #[test]
    fn rotation_then_acceleration_query() {
        let (client, device) = FdChannel::pair().unwrap();
        let handler = SensorsHandler::new(Arc::new(SensorsSimulator::new()));

        handler.process_request(&device, &request(0, "0:0:0")).unwrap();
        handler.process_request(&device, &request(1, "1")).unwrap();

        let reply = client.receive_message().unwrap();
        assert!(reply.is_response());
        assert_eq!(reply.command(), 1);
        assert_eq!(reply.payload_str().unwrap(), "0.000000:0.000000:9.810000");
    }

    #[test]
    fn malformed_requests_are_bad_msg() {
        let (_client, device) = FdChannel::pair().unwrap();
        let handler = SensorsHandler::new(Arc::new(SensorsSimulator::new()));
        for (command, payload) in [(0, "1:2"), (0, "a:b:c"), (1, "-1"), (2, "x"), (7, "")] {
            let err = handler
                .process_request(&device, &request(command, payload))
                .unwrap_err();
            assert_eq!(err.kind(), FailureKind::BadMsg, "{} {:?}", command, payload);
        }
    }

    #[test]
    fn off_body_value_is_stored() {
        let (_client, device) = FdChannel::pair().unwrap();
        let simulator = Arc::new(SensorsSimulator::new());
        let handler = SensorsHandler::new(simulator.clone());
        handler.process_request(&device, &request(2, "1.0")).unwrap();
        assert_eq!(simulator.low_latency_off_body(), 1.0);
    }

    #[test]
    fn run_skips_bad_requests_and_stops_on_eof() {
        let (client, device) = FdChannel::pair().unwrap();
        let handler = SensorsHandler::new(Arc::new(SensorsSimulator::new()));
        let worker = thread::spawn(move || handler.run(&device));

        client.send_request(&mut request(0, "garbage")).unwrap();
        client.send_request(&mut request(0, "90:0:0")).unwrap();
        client.send_request(&mut request(1, "4096")).unwrap();
        let reply = client.receive_message().unwrap();
        assert_eq!(reply.payload_str().unwrap(), "90.000000:0.000000:0.000000");

        drop(client);
        worker.join().unwrap().unwrap();
    }
}
