// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeSet;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use base::process::Pid;

use crate::Error;
use crate::Result;

/// A command to keep running under the monitor.
#[derive(Debug)]
pub struct MonitorCommand {
    pub command: Command,
    /// The whole fleet is torn down when a critical command exits.
    pub is_critical: bool,
}

impl MonitorCommand {
    pub fn new(command: Command) -> Self {
        MonitorCommand {
            command,
            is_critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }
}

impl From<Command> for MonitorCommand {
    fn from(command: Command) -> Self {
        MonitorCommand::new(command)
    }
}

/// File name of the program run by `command`.
pub(crate) fn program_name(command: &Command) -> String {
    let program = Path::new(command.get_program());
    program
        .file_name()
        .unwrap_or_else(|| program.as_os_str())
        .to_string_lossy()
        .into_owned()
}

/// Wraps `command` as `strace -f -o <log> <command...>`, keeping its environment and directory.
fn strace_command(command: &Command, log: &Path) -> Command {
    let mut strace = Command::new("strace");
    strace
        .arg("-f")
        .arg("-o")
        .arg(log)
        .arg(command.get_program())
        .args(command.get_args());
    for (key, value) in command.get_envs() {
        match value {
            Some(value) => strace.env(key, value),
            None => strace.env_remove(key),
        };
    }
    if let Some(dir) = command.get_current_dir() {
        strace.current_dir(dir);
    }
    strace
}

#[derive(Debug)]
pub(crate) struct MonitorEntry {
    command: Command,
    name: String,
    pub is_critical: bool,
    /// Set while the subprocess is running and not yet reaped.
    pub pid: Option<Pid>,
}

impl MonitorEntry {
    fn new(command: MonitorCommand) -> Self {
        MonitorEntry {
            name: program_name(&command.command),
            command: command.command,
            is_critical: command.is_critical,
            pid: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the subprocess in its own process group.
    pub fn start(&mut self) -> Result<Pid> {
        let child = self
            .command
            .process_group(0)
            .spawn()
            .map_err(|error| Error::SpawnSubprocess {
                name: self.name.clone(),
                error,
            })?;
        // Reaping is done with wait(2) by the monitor loop, not through `Child`.
        let pid = child.id() as Pid;
        self.pid = Some(pid);
        Ok(pid)
    }
}

/// What the monitor runs and how it reacts to exits.
#[derive(Debug, Default)]
pub struct ProcessMonitorProperties {
    pub(crate) restart_subprocesses: bool,
    pub(crate) entries: Vec<MonitorEntry>,
    strace_commands: BTreeSet<String>,
    strace_log_dir: PathBuf,
}

impl ProcessMonitorProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart subprocesses when they exit instead of dropping them.
    pub fn restart_subprocesses(mut self, restart: bool) -> Self {
        self.restart_subprocesses = restart;
        self
    }

    /// Commands are started in the order they are added and stopped in reverse.
    pub fn add_command(mut self, command: impl Into<MonitorCommand>) -> Self {
        self.entries.push(MonitorEntry::new(command.into()));
        self
    }

    /// Program names to run under `strace`.
    pub fn strace_commands<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strace_commands = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn strace_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.strace_log_dir = dir.into();
        self
    }

    /// Applies the strace wrapping to every matching command.
    pub(crate) fn prepare_commands(&mut self) {
        for entry in &mut self.entries {
            if self.strace_commands.contains(entry.name()) {
                let log = self
                    .strace_log_dir
                    .join(format!("strace-{}.log", entry.name()));
                entry.command = strace_command(&entry.command, &log);
            }
        }
    }

    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(MonitorEntry::name)
    }
}
