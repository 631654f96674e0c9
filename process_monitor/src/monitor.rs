// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use base::debug;
use base::error;
use base::info;
use base::process;
use base::process::Child;
use base::process::Pid;
use base::process::WaitStatus;
use base::sync::Mutex;
use base::warn;
use enumn::N;
use transport::Channel;
use transport::FdChannel;
use transport::ManagedMessage;

use crate::properties::MonitorEntry;
use crate::properties::ProcessMonitorProperties;
use crate::suspend::suspend_resume;
use crate::Error;
use crate::Result;

/// Requests from the launcher to the monitor process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
enum ParentToChild {
    Stop = 1,
    HostResume = 2,
    HostSuspend = 3,
    Error = 4,
}

/// Reply commands from the monitor process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
enum ChildToParent {
    Success = 0,
    Failure = 1,
}

fn send_empty_request(channel: &dyn Channel, command: ParentToChild) -> Result<()> {
    let mut message = ManagedMessage::with_payload(command as u32, &[])?;
    channel.send_request(&mut message)?;
    Ok(())
}

fn send_empty_response(channel: &dyn Channel, response: ChildToParent) -> Result<()> {
    let mut message = ManagedMessage::with_payload(response as u32, &[])?;
    channel.send_response(&mut message)?;
    Ok(())
}

fn log_subprocess_exit(name: &str, pid: Pid, status: WaitStatus) {
    info!("Detected unexpected exit of monitored subprocess {}", name);
    match status {
        WaitStatus::Exited(code) => {
            info!("Subprocess {} ({}) has exited with exit code {}", name, pid, code)
        }
        WaitStatus::Signaled(signal) => error!(
            "Subprocess {} ({}) was interrupted by a signal '{}' ({})",
            name,
            pid,
            process::signal_name(signal),
            signal
        ),
        WaitStatus::Other(raw) => info!(
            "subprocess {} ({}) has exited for unknown reasons (status = {})",
            name, pid, raw
        ),
    }
}

/// State shared by the wait loop and the control loop inside the monitor process.
struct MonitorState {
    entries: Mutex<Vec<MonitorEntry>>,
    running: AtomicBool,
    restart_subprocesses: bool,
}

impl MonitorState {
    fn new(properties: ProcessMonitorProperties) -> Self {
        MonitorState {
            restart_subprocesses: properties.restart_subprocesses,
            entries: Mutex::new(properties.entries),
            running: AtomicBool::new(true),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start_subprocesses(&self) -> Result<()> {
        debug!("Starting monitored subprocesses");
        for entry in self.entries.lock().iter_mut() {
            let pid = entry.start()?;
            info!("started {} ({})", entry.name(), pid);
        }
        Ok(())
    }

    /// Clears the running flag and wakes the wait loop with a child that exits at once.
    fn request_stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Err(e) = process::spawn_noop_child() {
                warn!("failed to wake the wait loop: {}", e);
            }
        }
    }

    /// Reaps subprocesses until the monitor is stopped or a critical subprocess exits.
    fn wait_loop(&self) -> Result<()> {
        while self.is_running() {
            let (pid, status) = match process::wait_any() {
                Ok(reaped) => reaped,
                Err(e) if e.errno() == libc::ECHILD => {
                    info!("no monitored subprocesses left");
                    return Ok(());
                }
                Err(e) => return Err(Error::Wait(e)),
            };
            if !status.is_terminated() {
                debug!("Unexpected status from wait: {:?} for pid {}", status, pid);
                continue;
            }
            let mut entries = self.entries.lock();
            // Avoid extra restarts near the end.
            if !self.is_running() {
                if let Some(entry) = entries.iter_mut().find(|e| e.pid == Some(pid)) {
                    debug!("{} ({}) exited while stopping", entry.name(), pid);
                    entry.pid = None;
                }
                break;
            }
            let Some(entry) = entries.iter_mut().find(|e| e.pid == Some(pid)) else {
                log_subprocess_exit("(unknown)", pid, status);
                continue;
            };
            log_subprocess_exit(entry.name(), pid, status);
            entry.pid = None;
            if self.restart_subprocesses {
                match entry.start() {
                    Ok(_) => continue,
                    Err(e) => error!("{}", e),
                }
            }
            if entry.is_critical {
                error!("Stopping all monitored processes due to unexpected exit of critical process");
                self.running.store(false, Ordering::SeqCst);
                break;
            }
        }
        Ok(())
    }

    /// Kills the running subprocesses in reverse startup order and reaps each of them.
    fn stop_subprocesses(&self) -> Result<()> {
        debug!("Stopping monitored subprocesses");
        let mut entries = self.entries.lock();
        let mut total = 0;
        let mut stopped = 0;
        for entry in entries.iter_mut().rev() {
            let Some(pid) = entry.pid.take() else {
                continue;
            };
            total += 1;
            match process::kill(pid, libc::SIGKILL) {
                Ok(()) => {}
                Err(e) if e.errno() == libc::ESRCH => {
                    debug!("{} ({}) was already reaped", entry.name(), pid);
                    stopped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Error in stopping \"{}\": {}", entry.name(), e);
                    continue;
                }
            }
            match process::wait_for_pid(pid, 0) {
                Ok((_, status)) => {
                    debug!("{} ({}) stopped: {:?}", entry.name(), pid, status);
                    stopped += 1;
                }
                Err(e) => warn!("Failed to wait for process {}: {}", entry.name(), e),
            }
        }
        if stopped != total {
            return Err(Error::StopSubprocesses { stopped, total });
        }
        Ok(())
    }

    fn handle_control(
        &self,
        command: u32,
        secure_env: Option<&dyn Channel>,
    ) -> (ChildToParent, bool) {
        let suspend = match ParentToChild::n(command) {
            Some(ParentToChild::Stop) => {
                self.request_stop();
                return (ChildToParent::Success, true);
            }
            Some(ParentToChild::HostSuspend) => true,
            Some(ParentToChild::HostResume) => false,
            Some(ParentToChild::Error) | None => {
                warn!("monitor: unexpected control command {}", command);
                return (ChildToParent::Failure, false);
            }
        };
        let entries = self.entries.lock();
        match suspend_resume(&entries, secure_env, suspend) {
            Ok(()) => (ChildToParent::Success, false),
            Err(e) => {
                error!("Failed {}: {}", if suspend { "suspend" } else { "resume" }, e);
                (ChildToParent::Failure, false)
            }
        }
    }

    /// Serves launcher requests. EOF from the launcher counts as a stop request.
    fn control_loop(&self, channel: &dyn Channel, secure_env: Option<&dyn Channel>) -> Result<()> {
        debug!("Waiting for a `stop` message from the parent");
        loop {
            let message = match channel.receive_message() {
                Ok(message) => message,
                Err(transport::Error::Eof) => {
                    info!("launcher closed the monitor channel, stopping");
                    self.request_stop();
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let (response, done) = self.handle_control(message.command(), secure_env);
            send_empty_response(channel, response)?;
            if done {
                return Ok(());
            }
        }
    }
}

fn monitor_routine(
    properties: ProcessMonitorProperties,
    channel: FdChannel,
    secure_env: Option<FdChannel>,
) -> Result<()> {
    // Subreaper so that exits of grandchildren are observed too.
    process::set_child_subreaper().map_err(Error::Prctl)?;
    process::set_parent_death_signal(libc::SIGHUP).map_err(Error::Prctl)?;

    debug!("Monitoring subprocesses");
    let state = Arc::new(MonitorState::new(properties));
    if let Err(e) = state.start_subprocesses() {
        if let Err(stop) = state.stop_subprocesses() {
            warn!("{}", stop);
        }
        return Err(e);
    }

    let control_state = state.clone();
    let control = thread::Builder::new()
        .name("monitor_control".to_owned())
        .spawn(move || {
            let secure_env = secure_env.as_ref().map(|c| c as &dyn Channel);
            control_state.control_loop(&channel, secure_env)
        })
        .map_err(Error::SpawnThread)?;

    let waited = state.wait_loop();
    let stopped = state.stop_subprocesses();
    let controlled = control.join().map_err(|_| Error::ControlThreadPanicked)?;
    waited?;
    stopped?;
    controlled?;
    debug!("Done monitoring subprocesses");
    Ok(())
}

/// Launcher side handle of the monitor process.
pub struct ProcessMonitor {
    properties: Option<ProcessMonitorProperties>,
    secure_env: Option<FdChannel>,
    monitor: Option<Child>,
    channel: Option<FdChannel>,
}

impl ProcessMonitor {
    /// `secure_env` is the channel used to suspend and resume the secure_env worker.
    pub fn new(properties: ProcessMonitorProperties, secure_env: Option<FdChannel>) -> Self {
        ProcessMonitor {
            properties: Some(properties),
            secure_env,
            monitor: None,
            channel: None,
        }
    }

    /// Forks the monitor process, which starts every command and keeps them running.
    pub fn start_and_monitor_processes(&mut self) -> Result<()> {
        if self.monitor.is_some() || self.channel.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let Some(mut properties) = self.properties.take() else {
            return Err(Error::AlreadyStarted);
        };
        properties.prepare_commands();
        let secure_env = self.secure_env.take();
        let (parent, child) = FdChannel::pair().map_err(Error::CreateChannel)?;
        let mut parent = Some(parent);
        let parent_slot = &mut parent;
        let monitor = process::fork_process(move || {
            // Closing the launcher's ends lets the monitor see EOF when the launcher goes away.
            drop(parent_slot.take());
            match monitor_routine(properties, child, secure_env) {
                Ok(()) => 0,
                Err(e) => {
                    error!("Monitoring processes failed: {}", e);
                    1
                }
            }
        })
        .map_err(Error::Fork)?;
        self.monitor = Some(monitor);
        self.channel = parent;
        Ok(())
    }

    fn channel(&self) -> Result<&FdChannel> {
        match (&self.monitor, &self.channel) {
            (Some(_), Some(channel)) => Ok(channel),
            _ => Err(Error::NotStarted),
        }
    }

    fn request(&self, command: ParentToChild, what: &'static str) -> Result<()> {
        let channel = self.channel()?;
        send_empty_request(channel, command)?;
        let response = channel.receive_message()?;
        if ChildToParent::n(response.command()) != Some(ChildToParent::Success) {
            return Err(Error::Rejected(what));
        }
        Ok(())
    }

    /// Stops the subprocesses and waits for a clean exit of the monitor.
    pub fn stop_monitored_processes(&mut self) -> Result<()> {
        let stop = self.request(ParentToChild::Stop, "kStop");
        self.channel = None;
        let monitor = self.monitor.take().ok_or(Error::NotStarted)?;
        let status = monitor.wait().map_err(Error::Wait)?;
        stop?;
        match status {
            WaitStatus::Exited(0) => Ok(()),
            status => Err(Error::MonitorExited(status)),
        }
    }

    pub fn suspend_monitored_processes(&self) -> Result<()> {
        self.request(ParentToChild::HostSuspend, "kHostSuspend")
    }

    pub fn resume_monitored_processes(&self) -> Result<()> {
        self.request(ParentToChild::HostResume, "kHostResume")
    }

    pub fn is_started(&self) -> bool {
        self.monitor.is_some()
    }
}
