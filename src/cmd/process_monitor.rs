// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::io::BufRead;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::Command;

use anyhow::bail;
use anyhow::Context;
use argh::FromArgs;
use base::info;
use base::warn;
use process_monitor::MonitorCommand;
use process_monitor::ProcessMonitor;
use process_monitor::ProcessMonitorProperties;
use transport::FdChannel;

use crate::config::ProcessMonitorConfig;

#[derive(FromArgs)]
#[argh(subcommand, name = "process-monitor")]
/// Run the configured host processes, reading stop/suspend/resume from stdin
pub struct Options {
    #[argh(switch)]
    /// restart subprocesses when they exit
    restart: bool,
}

fn properties(cfg: &ProcessMonitorConfig) -> anyhow::Result<ProcessMonitorProperties> {
    let mut properties = ProcessMonitorProperties::new()
        .restart_subprocesses(cfg.restart_subprocesses)
        .strace_commands(cfg.strace_commands.iter().cloned());
    if let Some(dir) = &cfg.strace_log_dir {
        properties = properties.strace_log_dir(dir);
    }
    for command in &cfg.commands {
        let Some((program, args)) = command.argv.split_first() else {
            bail!("monitored command with an empty argv");
        };
        let mut process = Command::new(program);
        process.args(args);
        let mut monitored = MonitorCommand::new(process);
        if command.critical {
            monitored = monitored.critical();
        }
        properties = properties.add_command(monitored);
    }
    Ok(properties)
}

fn connect_secure_env(cfg: &ProcessMonitorConfig) -> anyhow::Result<Option<FdChannel>> {
    let Some(path) = &cfg.secure_env_socket else {
        return Ok(None);
    };
    let stream = UnixStream::connect(path)
        .with_context(|| format!("failed to connect to secure_env at {}", path.display()))?;
    let read = stream
        .try_clone()
        .context("failed to duplicate the secure_env socket")?;
    Ok(Some(FdChannel::new(OwnedFd::from(read), OwnedFd::from(stream))))
}

pub fn run(opts: Options, mut cfg: ProcessMonitorConfig) -> anyhow::Result<()> {
    cfg.restart_subprocesses |= opts.restart;
    let mut monitor = ProcessMonitor::new(properties(&cfg)?, connect_secure_env(&cfg)?);
    monitor
        .start_and_monitor_processes()
        .context("failed to start the process monitor")?;
    info!("process_monitor: monitoring {} commands", cfg.commands.len());

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        match line.trim() {
            "stop" => break,
            "suspend" => monitor
                .suspend_monitored_processes()
                .context("failed to suspend")?,
            "resume" => monitor
                .resume_monitored_processes()
                .context("failed to resume")?,
            "" => {}
            other => warn!("process_monitor: unknown command {:?}", other),
        }
    }
    monitor
        .stop_monitored_processes()
        .context("failed to stop the monitored processes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoredCommand;

    #[test]
    fn empty_argv_is_rejected() {
        let cfg = ProcessMonitorConfig {
            commands: vec![MonitoredCommand {
                argv: Vec::new(),
                critical: false,
            }],
            ..Default::default()
        };
        assert!(properties(&cfg).is_err());
    }

    #[test]
    fn commands_keep_their_order() {
        let cfg = ProcessMonitorConfig {
            commands: vec![
                MonitoredCommand {
                    argv: vec!["/usr/bin/log_tee".to_owned()],
                    critical: false,
                },
                MonitoredCommand {
                    argv: vec!["crosvm".to_owned(), "run".to_owned()],
                    critical: true,
                },
            ],
            ..Default::default()
        };
        let properties = properties(&cfg).unwrap();
        let names: Vec<&str> = properties.command_names().collect();
        assert_eq!(names, ["log_tee", "crosvm"]);
    }
}
