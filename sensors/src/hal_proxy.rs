// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side of the guest sensors HAL.
//!
//! The HAL talks over two virtio consoles. The control console carries `\n`-terminated commands
//! and their replies; the data console carries framed reports, one message per push with a
//! `<name>:<x:y:z>\n` line per continuous sensor.

use std::io::BufRead;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use base::error;
use base::info;
use base::warn;
use base::WorkerThread;
use serde::Deserialize;
use serde::Serialize;
use transport::kernel_log;
use transport::kernel_log::KernelLogEventType;
use transport::Channel;
use transport::ManagedMessage;

use crate::common::continuous_sensors_mask;
use crate::common::DeviceType;
use crate::simulator::SensorsSimulator;
use crate::Error;
use crate::Result;

const LIST_SENSORS: &str = "list-sensors";
const REPORT_COMMAND: u32 = 0;

const DEFAULT_REPORT_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HalProxyConfig {
    pub device_type: DeviceType,
    /// Milliseconds between two pushed reports.
    pub report_interval_ms: u64,
}

impl HalProxyConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

impl Default for HalProxyConfig {
    fn default() -> Self {
        HalProxyConfig {
            device_type: DeviceType::default(),
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
        }
    }
}

pub struct SensorsHalProxy {
    simulator: Arc<SensorsSimulator>,
    config: HalProxyConfig,
    data: Arc<dyn Channel>,
    activated: Arc<AtomicBool>,
}

impl SensorsHalProxy {
    pub fn new(
        simulator: Arc<SensorsSimulator>,
        config: HalProxyConfig,
        data: Arc<dyn Channel>,
    ) -> Self {
        SensorsHalProxy {
            simulator,
            config,
            data,
            activated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the HAL has asked for sensors since boot.
    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Serves the control console until it reaches EOF, then stops the report thread.
    pub fn run<R: BufRead, W: Write>(&self, mut control_in: R, mut control_out: W) -> Result<()> {
        let mut push_thread: Option<WorkerThread<()>> = None;
        let mut line = String::new();
        loop {
            line.clear();
            if control_in.read_line(&mut line).map_err(Error::Console)? == 0 {
                info!("sensors HAL control console closed");
                break;
            }
            match line.trim() {
                LIST_SENSORS => {
                    let mask = self.config.device_type.enabled_sensors();
                    control_out
                        .write_all(format!("{}\n", mask).as_bytes())
                        .and_then(|()| control_out.flush())
                        .map_err(Error::Console)?;
                    self.activated.store(true, Ordering::SeqCst);
                    if push_thread.is_none() {
                        push_thread = Some(self.start_push_thread()?);
                    }
                }
                "" => {}
                other => warn!("sensors HAL: unknown command {:?}", other),
            }
        }
        if let Some(push_thread) = push_thread {
            push_thread.stop();
        }
        Ok(())
    }

    fn start_push_thread(&self) -> Result<WorkerThread<()>> {
        let simulator = self.simulator.clone();
        let data = self.data.clone();
        let activated = self.activated.clone();
        let mask = self.config.device_type.enabled_sensors() & continuous_sensors_mask();
        let interval = self.config.report_interval();
        WorkerThread::start("sensors_hal_push", move |stop| loop {
            if activated.load(Ordering::SeqCst) {
                let report = simulator.hal_report(mask);
                let sent = ManagedMessage::with_payload(REPORT_COMMAND, report.as_bytes())
                    .and_then(|mut message| data.send_request(&mut message));
                if let Err(e) = sent {
                    error!("sensors HAL: failed to push report: {}", e);
                    return;
                }
            }
            if stop.wait_timeout(interval) {
                return;
            }
        })
        .map_err(|e| Error::SpawnThread("sensors HAL push", e))
    }

    /// Watches the kernel log and deactivates reporting when the guest reboots. The thread exits
    /// when the kernel log reaches EOF.
    pub fn start_reboot_monitor(&self, kernel_log: Box<dyn Channel>) -> Result<JoinHandle<()>> {
        let activated = self.activated.clone();
        thread::Builder::new()
            .name("sensors_reboot_monitor".to_owned())
            .spawn(move || {
                let result = kernel_log::for_each_event(&*kernel_log, |event| {
                    if event.event == KernelLogEventType::BootloaderLoaded {
                        info!("guest rebooting, sensors HAL deactivated");
                        activated.store(false, Ordering::SeqCst);
                    }
                });
                if let Err(e) = result {
                    error!("sensors reboot monitor: {}", e);
                }
            })
            .map_err(|e| Error::SpawnThread("sensors reboot monitor", e))
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::BufReader;
    use std::io::Cursor;

    use transport::kernel_log::KernelLogEvent;
    use transport::FdChannel;

    use super::*;

    fn proxy(report_interval_ms: u64) -> (SensorsHalProxy, FdChannel) {
        let (device, guest) = FdChannel::pair().unwrap();
        let config = HalProxyConfig {
            device_type: DeviceType::Phone,
            report_interval_ms,
        };
        let simulator = Arc::new(SensorsSimulator::new());
        (SensorsHalProxy::new(simulator, config, Arc::new(device)), guest)
    }

    #[test]
    fn list_sensors_replies_mask_and_starts_reports() {
        let (proxy, guest) = proxy(20);
        let (control_in_read, control_in_write) = base::pipe().unwrap();
        let (control_out_read, control_out_write) = base::pipe().unwrap();
        let runner = thread::spawn(move || {
            proxy.run(
                BufReader::new(File::from(control_in_read)),
                File::from(control_out_write),
            )
        });

        let mut control_in = File::from(control_in_write);
        control_in.write_all(b"bogus\nlist-sensors\n").unwrap();
        let mut reply = String::new();
        BufReader::new(File::from(control_out_read))
            .read_line(&mut reply)
            .unwrap();
        assert_eq!(reply, format!("{}\n", DeviceType::Phone.enabled_sensors()));

        for _ in 0..2 {
            let report = guest.receive_message().unwrap();
            assert_eq!(report.command(), REPORT_COMMAND);
            assert!(!report.is_response());
            let names: Vec<&str> = report
                .payload_str()
                .unwrap()
                .lines()
                .map(|l| l.split(':').next().unwrap())
                .collect();
            assert_eq!(
                names,
                [
                    "acceleration",
                    "gyroscope",
                    "magnetic",
                    "pressure",
                    "gyroscope-uncalibrated",
                    "acceleration-uncalibrated",
                ]
            );
        }

        drop(control_in);
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn bootloader_event_deactivates() {
        let (proxy, _guest) = proxy(60_000);
        proxy.run(Cursor::new("list-sensors\n"), Vec::new()).unwrap();
        assert!(proxy.is_activated());

        let (writer, reader) = FdChannel::pair().unwrap();
        let monitor = proxy.start_reboot_monitor(Box::new(reader)).unwrap();
        kernel_log::write_event(&writer, &KernelLogEvent::new(KernelLogEventType::BootStarted))
            .unwrap();
        kernel_log::write_event(
            &writer,
            &KernelLogEvent::new(KernelLogEventType::BootloaderLoaded),
        )
        .unwrap();
        drop(writer);
        monitor.join().unwrap();
        assert!(!proxy.is_activated());
    }

    #[test]
    fn config_defaults() {
        let config = HalProxyConfig::default();
        assert_eq!(config.device_type, DeviceType::Phone);
        assert_eq!(config.report_interval(), Duration::from_secs(1));
        let parsed: HalProxyConfig = serde_json::from_str(r#"{"device_type": "wear"}"#).unwrap();
        assert_eq!(parsed.device_type, DeviceType::Wear);
        assert_eq!(parsed.report_interval_ms, 1000);
    }
}
