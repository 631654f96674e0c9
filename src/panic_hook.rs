// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::panic;
use std::process::abort;

use base::error;

/// Sends panics to the log before the default hook prints them, then aborts.
pub fn set_panic_hook() {
    let default_panic = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        // Split by line because the logging facilities do not handle embedded new lines well.
        for line in info.to_string().lines() {
            error!("thread '{}' panicked: {}", name, line);
        }
        default_panic(info);
        abort();
    }));
}
