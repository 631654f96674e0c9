// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process control: [fork_process], child reaping and signal delivery.

use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::process;

use libc::c_int;
use libc::pid_t;

use crate::errno_result;
use crate::handle_eintr_errno;
use crate::warn;
use crate::Result;

pub type Pid = pid_t;

/// How a reaped child terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(i32),
    Signaled(i32),
    /// Stopped, continued or otherwise not terminated; carries the raw status.
    Other(i32),
}

impl WaitStatus {
    fn from_raw(status: c_int) -> Self {
        if libc::WIFEXITED(status) {
            WaitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            WaitStatus::Signaled(libc::WTERMSIG(status))
        } else {
            WaitStatus::Other(status)
        }
    }

    pub fn is_terminated(self) -> bool {
        !matches!(self, WaitStatus::Other(_))
    }
}

/// Waits for `pid` (or any child when `pid` is -1) with `waitpid(2)`.
pub fn wait_for_pid(pid: Pid, options: c_int) -> Result<(Pid, WaitStatus)> {
    let mut status: c_int = 0;
    // SAFETY: `status` outlives the call and waitpid only writes an int through it.
    let ret = handle_eintr_errno!(unsafe { libc::waitpid(pid, &mut status, options) });
    if ret < 0 {
        return errno_result();
    }
    Ok((ret, WaitStatus::from_raw(status)))
}

/// Blocks until any child terminates or stops. Fails with `ECHILD` when there are no children.
pub fn wait_any() -> Result<(Pid, WaitStatus)> {
    wait_for_pid(-1, 0)
}

/// Sends `signal` to one process.
pub fn kill(pid: Pid, signal: c_int) -> Result<()> {
    // SAFETY: kill takes no pointers.
    if unsafe { libc::kill(pid, signal) } < 0 {
        return errno_result();
    }
    Ok(())
}

/// Sends `signal` to every process in the group led by `pgid`.
pub fn kill_process_group(pgid: Pid, signal: c_int) -> Result<()> {
    kill(-pgid, signal)
}

/// Makes orphaned descendants of this process reparent to it instead of init.
pub fn set_child_subreaper() -> Result<()> {
    // SAFETY: PR_SET_CHILD_SUBREAPER takes an integer flag.
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) } < 0 {
        return errno_result();
    }
    Ok(())
}

/// Asks the kernel to deliver `signal` when the parent of this process dies.
pub fn set_parent_death_signal(signal: c_int) -> Result<()> {
    // SAFETY: PR_SET_PDEATHSIG takes a signal number.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal) } < 0 {
        return errno_result();
    }
    Ok(())
}

/// Human readable name of `signal`.
pub fn signal_name(signal: c_int) -> String {
    // SAFETY: strsignal returns a pointer to a NUL terminated string or null.
    let name = unsafe { libc::strsignal(signal) };
    if name.is_null() {
        return format!("signal {}", signal);
    }
    // SAFETY: checked for null above; the string is copied before any other strsignal call.
    unsafe { CStr::from_ptr(name) }
        .to_string_lossy()
        .into_owned()
}

/// A forked process that must be waited for.
pub struct Child {
    pub pid: Pid,
}

impl Child {
    /// Waits for the child to exit and returns how it ended.
    pub fn wait(self) -> Result<WaitStatus> {
        let (_, status) = wait_for_pid(self.pid, 0)?;
        // suppress warning from the drop().
        let _ = ManuallyDrop::new(self);
        Ok(status)
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        warn!("child process {} was not waited for", self.pid);
    }
}

/// Forks this process and runs `post_fork_cb` in the new process, which then exits with the code
/// it returns. A panic in the callback exits with `101`.
///
/// This function never returns in the forked process. Only the calling thread exists in the child,
/// so the callback must not rely on locks held by other threads at the time of the fork.
pub fn fork_process<F>(post_fork_cb: F) -> Result<Child>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the child only runs `post_fork_cb` and then exits without unwinding into the caller.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => errno_result(),
        0 => {
            struct ExitGuard;
            impl Drop for ExitGuard {
                fn drop(&mut self) {
                    // Rust exits with 101 when panics.
                    process::exit(101);
                }
            }
            // Prevents a panic in post_fork_cb from bypassing the process::exit.
            let exit_guard = ExitGuard {};
            let code = post_fork_cb();
            std::mem::forget(exit_guard);
            process::exit(code);
        }
        pid => Ok(Child { pid }),
    }
}

/// Forks a child that exits immediately. Used to wake a thread blocked in [wait_any].
pub fn spawn_noop_child() -> Result<Pid> {
    // SAFETY: the child calls only the async-signal-safe _exit.
    match unsafe { libc::fork() } {
        -1 => errno_result(),
        0 => unsafe { libc::_exit(0) },
        pid => Ok(pid),
    }
}
