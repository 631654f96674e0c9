// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side media and sensor bridge for Android virtual devices.

mod cmd;
mod config;
mod panic_hook;

use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use base::error;
use base::syslog;

use crate::cmd::Command;
use crate::config::BridgeConfig;

#[derive(FromArgs)]
/// Bridge between a streaming client and an Android virtual device
struct CommandLineArgs {
    #[argh(option, arg_name = "PATH")]
    /// JSON configuration file
    cfg: Option<PathBuf>,
    #[argh(option, arg_name = "FILTER")]
    /// log filter, e.g. `info` or `sensors=debug,info`
    log_level: Option<String>,
    #[argh(option, arg_name = "PATH")]
    /// append logs to this file instead of stderr
    log_file: Option<PathBuf>,
    #[argh(subcommand)]
    command: Command,
}

fn bridge_main(args: CommandLineArgs) -> anyhow::Result<()> {
    let mut cfg = match &args.cfg {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(filter) = args.log_level {
        cfg.log.filter = filter;
    }
    if let Some(log_file) = args.log_file {
        cfg.log.log_file = Some(log_file);
    }
    syslog::init_with(cfg.log.clone()).context("failed to initialize syslog")?;
    panic_hook::set_panic_hook();

    match args.command {
        Command::Audio(opts) => cmd::audio::run(opts, cfg.audio),
        Command::ProcessMonitor(opts) => cmd::process_monitor::run(opts, cfg.process_monitor),
        Command::Sensors(opts) => cmd::sensors::run(opts, cfg.sensors),
    }
}

fn main() {
    let args: CommandLineArgs = argh::from_env();
    std::process::exit(match bridge_main(args) {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("cf_bridge: {:#}", e);
            1
        }
    });
}
