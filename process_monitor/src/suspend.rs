// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host suspend/resume of the monitored subprocesses.

use base::process;
use transport::Channel;

use crate::properties::MonitorEntry;
use crate::secure_env;
use crate::secure_env::SecureEnvRequest;
use crate::Error;
use crate::Result;

pub(crate) const SECURE_ENV: &str = "secure_env";
pub(crate) const PROCESS_RESTARTER: &str = "process_restarter";

/// How one subprocess is paused or continued.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SuspendAction {
    /// Keeps running across a host suspend.
    Skip,
    /// Signals only the process itself.
    Process,
    /// Signals the whole process group.
    Group,
}

pub(crate) fn suspend_action(name: &str) -> SuspendAction {
    match name {
        // log_tee keeps processing logs and wmediumd serves the guest snapshot of openWRT.
        "log_tee" | "wmediumd" => SuspendAction::Skip,
        // Handled through its own channel.
        SECURE_ENV => SuspendAction::Skip,
        // vhost-user backends are suspended by the VMM.
        name if name.starts_with("cf_vhost_user_") => SuspendAction::Skip,
        PROCESS_RESTARTER => SuspendAction::Process,
        _ => SuspendAction::Group,
    }
}

/// Suspends (`SIGTSTP`) or resumes (`SIGCONT`) every running subprocess outside the allow-list,
/// after asking secure_env to do the same when it is one of them.
pub(crate) fn suspend_resume(
    entries: &[MonitorEntry],
    secure_env: Option<&dyn Channel>,
    suspend: bool,
) -> Result<()> {
    if entries.iter().any(|e| e.name() == SECURE_ENV) {
        let request = if suspend {
            SecureEnvRequest::Suspend
        } else {
            SecureEnvRequest::Resume
        };
        match secure_env {
            Some(channel) => secure_env::send_request(channel, request)?,
            None => {
                return Err(Error::SecureEnv {
                    request,
                    reason: "no channel to secure_env".to_owned(),
                })
            }
        }
    }

    let signal = if suspend { libc::SIGTSTP } else { libc::SIGCONT };
    for entry in entries {
        let Some(pid) = entry.pid else {
            continue;
        };
        let result = match suspend_action(entry.name()) {
            SuspendAction::Skip => continue,
            SuspendAction::Process => process::kill(pid, signal),
            SuspendAction::Group => process::kill_process_group(pid, signal),
        };
        result.map_err(|error| Error::Signal {
            name: entry.name().to_owned(),
            error,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;
    use crate::properties::ProcessMonitorProperties;

    #[test]
    fn allow_list() {
        for name in ["log_tee", "wmediumd", "secure_env", "cf_vhost_user_gpu"] {
            assert_eq!(suspend_action(name), SuspendAction::Skip, "{}", name);
        }
        assert_eq!(suspend_action("process_restarter"), SuspendAction::Process);
        assert_eq!(suspend_action("crosvm"), SuspendAction::Group);
        assert_eq!(suspend_action("cf_vhost"), SuspendAction::Group);
    }

    #[test]
    fn secure_env_without_channel_fails() {
        let properties = ProcessMonitorProperties::new()
            .add_command(Command::new("/usr/bin/secure_env"))
            .add_command(Command::new("crosvm"));
        for suspend in [true, false] {
            assert!(matches!(
                suspend_resume(&properties.entries, None, suspend),
                Err(Error::SecureEnv { .. })
            ));
        }
    }

    #[test]
    fn fleet_without_secure_env_needs_no_channel() {
        let properties = ProcessMonitorProperties::new().add_command(Command::new("crosvm"));
        suspend_resume(&properties.entries, None, true).unwrap();
    }
}
