// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Safe wrappers for the system interfaces shared by the bridge crates.

mod errno;
mod handle_eintr;
mod io;
mod net;
pub mod process;
mod shm;
pub mod sync;
pub mod syslog;
mod worker_thread;

pub use errno::errno_result;
pub use errno::Error;
pub use errno::Result;
pub use io::pipe;
pub use io::poll_readable;
pub use io::read_exact;
pub use io::write_all;
pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;
pub use net::UnixSeqpacket;
pub use net::UnixSeqpacketListener;
pub use shm::MemoryMapping;
pub use shm::MmapError;
pub use shm::SharedMemory;
pub use shm::VolatileSlice;
pub use worker_thread::StopSignal;
pub use worker_thread::WorkerThread;

/// Coarse classification of bridge failures.
///
/// Every crate error can be mapped onto one of these so that callers (status replies, signaling
/// error messages, process exit codes) can react without matching on crate-specific variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed wire frame, unknown opcode, out-of-range id or invalid JSON shape.
    BadMsg,
    /// Well formed but deliberately unimplemented.
    NotSupported,
    /// Short read/write, closed peer, or a failed system call.
    Io,
    /// A bounded wait expired.
    Timeout,
    /// Operation invalid in the current state.
    State,
}
