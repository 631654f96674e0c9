// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufReader;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use anyhow::Context;
use argh::FromArgs;
use base::error;
use base::info;
use sensors::DeviceType;
use sensors::HalProxyConfig;
use sensors::SensorsHalProxy;
use sensors::SensorsHandler;
use sensors::SensorsSimulator;
use transport::FdChannel;

use crate::config::SensorsConfig;

fn parse_device_type(value: &str) -> Result<DeviceType, String> {
    serde_json::from_value(serde_json::Value::String(value.to_owned()))
        .map_err(|_| format!("unknown device type {:?}", value))
}

#[derive(FromArgs)]
#[argh(subcommand, name = "sensors")]
/// Simulate the guest sensors and serve the sensors HAL consoles
pub struct Options {
    #[argh(option, arg_name = "TYPE", from_str_fn(parse_device_type))]
    /// form factor of the guest: phone, wear, auto, foldable, tv, minidroid, go
    device_type: Option<DeviceType>,
    #[argh(option, arg_name = "PATH")]
    /// HAL control console
    control_console: Option<PathBuf>,
    #[argh(option, arg_name = "PATH")]
    /// HAL data console
    data_console: Option<PathBuf>,
    #[argh(option, arg_name = "PATH")]
    /// kernel-log event stream
    kernel_log: Option<PathBuf>,
    #[argh(option, arg_name = "PATH")]
    /// socket to accept streaming client connections on
    client_socket: Option<PathBuf>,
}

fn open_rw(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

/// A framed channel reading and writing the same file.
fn file_channel(path: &Path) -> anyhow::Result<FdChannel> {
    let file = open_rw(path)?;
    let read = file
        .try_clone()
        .with_context(|| format!("failed to duplicate {}", path.display()))?;
    Ok(FdChannel::new(OwnedFd::from(read), OwnedFd::from(file)))
}

/// Serves orientation updates and sensor queries from streaming clients, one at a time.
fn serve_clients(listener: UnixListener, simulator: Arc<SensorsSimulator>) {
    let handler = SensorsHandler::new(simulator);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("sensors: failed to accept client: {}", e);
                continue;
            }
        };
        let read = match stream.try_clone() {
            Ok(read) => read,
            Err(e) => {
                error!("sensors: failed to duplicate client socket: {}", e);
                continue;
            }
        };
        let channel = FdChannel::new(OwnedFd::from(read), OwnedFd::from(stream));
        info!("sensors: client connected");
        if let Err(e) = handler.run(&channel) {
            error!("sensors: client channel failed: {}", e);
        }
    }
}

pub fn run(opts: Options, mut cfg: SensorsConfig) -> anyhow::Result<()> {
    if let Some(device_type) = opts.device_type {
        cfg.device_type = device_type;
    }
    cfg.control_console = opts.control_console.or(cfg.control_console);
    cfg.data_console = opts.data_console.or(cfg.data_console);
    cfg.kernel_log = opts.kernel_log.or(cfg.kernel_log);
    cfg.client_socket = opts.client_socket.or(cfg.client_socket);

    let control_path = cfg
        .control_console
        .ok_or_else(|| anyhow!("no HAL control console configured"))?;
    let data_path = cfg
        .data_console
        .ok_or_else(|| anyhow!("no HAL data console configured"))?;

    let simulator = Arc::new(SensorsSimulator::new());
    if let Some(path) = &cfg.client_socket {
        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        let simulator = simulator.clone();
        thread::Builder::new()
            .name("sensors_clients".to_owned())
            .spawn(move || serve_clients(listener, simulator))
            .context("failed to spawn the sensors client thread")?;
    }

    let mut hal_config = HalProxyConfig {
        device_type: cfg.device_type,
        ..Default::default()
    };
    if let Some(interval) = cfg.report_interval_ms {
        hal_config.report_interval_ms = interval;
    }
    let data = file_channel(&data_path)?;
    let proxy = SensorsHalProxy::new(simulator, hal_config, Arc::new(data));

    let reboot_monitor = match &cfg.kernel_log {
        Some(path) => Some(proxy.start_reboot_monitor(Box::new(file_channel(path)?))?),
        None => None,
    };

    let control = open_rw(&control_path)?;
    let control_in = BufReader::new(
        control
            .try_clone()
            .context("failed to duplicate the control console")?,
    );
    info!("sensors: serving HAL for a {:?} device", cfg.device_type);
    proxy
        .run(control_in, control)
        .context("sensors HAL proxy failed")?;
    // The kernel log stays open for the lifetime of the guest; do not wait for it.
    drop(reboot_monitor);
    Ok(())
}
