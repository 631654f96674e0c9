// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use base::process;
use process_monitor::MonitorCommand;
use process_monitor::ProcessMonitor;
use process_monitor::ProcessMonitorProperties;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn shell(script: String) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

/// A subprocess that writes its pid to `pid_file` and then sleeps.
fn sleeper(pid_file: &Path) -> Command {
    shell(format!("echo $$ > {}; exec sleep 1000", pid_file.display()))
}

fn read_pid(pid_file: &Path) -> process::Pid {
    assert!(
        wait_until(|| fs::read_to_string(pid_file).map_or(false, |s| s.ends_with('\n'))),
        "{} was never written",
        pid_file.display()
    );
    fs::read_to_string(pid_file).unwrap().trim().parse().unwrap()
}

fn is_gone(pid: process::Pid) -> bool {
    matches!(process::kill(pid, 0), Err(e) if e.errno() == libc::ESRCH)
}

/// Scheduler state letter from /proc/<pid>/stat.
fn process_state(pid: process::Pid) -> char {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap();
    let after_comm = &stat[stat.rfind(')').unwrap() + 1..];
    after_comm.trim_start().chars().next().unwrap()
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).map_or(0, |s| s.lines().count())
}

#[test]
fn restarts_stop_after_stop_request() {
    let dir = TempDir::new().unwrap();
    let runs = dir.path().join("runs");
    let properties = ProcessMonitorProperties::new()
        .restart_subprocesses(true)
        .add_command(shell(format!("echo run >> {}", runs.display())));
    let mut monitor = ProcessMonitor::new(properties, None);
    monitor.start_and_monitor_processes().unwrap();

    assert!(wait_until(|| line_count(&runs) >= 3));
    monitor.stop_monitored_processes().unwrap();

    let after_stop = line_count(&runs);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(line_count(&runs), after_stop);
}

#[test]
fn stop_during_restarts_always_exits_cleanly() {
    let dir = TempDir::new().unwrap();
    for round in 0..20 {
        let runs = dir.path().join(format!("runs{}", round));
        let properties = ProcessMonitorProperties::new()
            .restart_subprocesses(true)
            .add_command(shell(format!("echo run >> {}", runs.display())));
        let mut monitor = ProcessMonitor::new(properties, None);
        monitor.start_and_monitor_processes().unwrap();
        assert!(wait_until(|| line_count(&runs) >= 1));
        monitor
            .stop_monitored_processes()
            .unwrap_or_else(|e| panic!("round {}: {}", round, e));
    }
}

#[test]
fn stop_reaps_every_subprocess() {
    let dir = TempDir::new().unwrap();
    let pid_files = [dir.path().join("a"), dir.path().join("b")];
    let properties = ProcessMonitorProperties::new()
        .add_command(sleeper(&pid_files[0]))
        .add_command(sleeper(&pid_files[1]));
    let mut monitor = ProcessMonitor::new(properties, None);
    monitor.start_and_monitor_processes().unwrap();
    let pids: Vec<process::Pid> = pid_files.iter().map(|f| read_pid(f)).collect();

    let start = Instant::now();
    monitor.stop_monitored_processes().unwrap();
    assert!(start.elapsed() < TIMEOUT);
    for pid in pids {
        assert!(is_gone(pid), "{} still exists", pid);
    }
    assert!(!monitor.is_started());
}

#[test]
fn critical_exit_tears_down_the_fleet() {
    let dir = TempDir::new().unwrap();
    let sleeper_pid = dir.path().join("sleeper");
    let properties = ProcessMonitorProperties::new()
        .add_command(sleeper(&sleeper_pid))
        .add_command(MonitorCommand::new(shell("sleep 0.2; exit 3".to_owned())).critical());
    let mut monitor = ProcessMonitor::new(properties, None);
    monitor.start_and_monitor_processes().unwrap();

    let pid = read_pid(&sleeper_pid);
    assert!(wait_until(|| is_gone(pid)));
    monitor.stop_monitored_processes().unwrap();
}

#[test]
fn suspend_and_resume_signal_subprocesses() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("sleeper");
    let properties = ProcessMonitorProperties::new().add_command(sleeper(&pid_file));
    let mut monitor = ProcessMonitor::new(properties, None);
    monitor.start_and_monitor_processes().unwrap();
    let pid = read_pid(&pid_file);

    monitor.suspend_monitored_processes().unwrap();
    assert!(wait_until(|| process_state(pid) == 'T'));
    monitor.resume_monitored_processes().unwrap();
    assert!(wait_until(|| process_state(pid) != 'T'));

    monitor.stop_monitored_processes().unwrap();
}

#[test]
fn starting_twice_is_rejected() {
    let mut monitor = ProcessMonitor::new(ProcessMonitorProperties::new(), None);
    monitor.start_and_monitor_processes().unwrap();
    assert!(monitor.start_and_monitor_processes().is_err());
    monitor.stop_monitored_processes().unwrap();
}
