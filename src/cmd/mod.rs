// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Subcommands of the bridge binary.

pub mod audio;
pub mod process_monitor;
pub mod sensors;

use argh::FromArgs;

#[derive(FromArgs)]
#[argh(subcommand)]
pub enum Command {
    Audio(audio::Options),
    ProcessMonitor(process_monitor::Options),
    Sensors(sensors::Options),
}
