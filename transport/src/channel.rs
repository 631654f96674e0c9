// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use base::sync::Mutex;
use zerocopy::FromBytes;

use crate::message::ManagedMessage;
use crate::message::RawMessageHeader;
use crate::message::RAW_MESSAGE_HEADER_SIZE;
use crate::Error;
use crate::Result;

/// A full-duplex framed message channel. Both directions use the same layout.
pub trait Channel: Send + Sync {
    /// Clears the response bit and writes the whole frame.
    fn send_request(&self, message: &mut ManagedMessage) -> Result<()>;
    /// Sets the response bit and writes the whole frame.
    fn send_response(&self, message: &mut ManagedMessage) -> Result<()>;
    /// Reads one complete frame, blocking until it is available.
    fn receive_message(&self) -> Result<ManagedMessage>;
    /// Blocks until the read side has data or reports an error/hangup.
    fn wait_for_message(&self) -> Result<()>;
}

/// A [`Channel`] over a pair of file descriptors (read side, write side).
#[derive(Debug)]
pub struct FdChannel {
    read: Mutex<OwnedFd>,
    write: Mutex<OwnedFd>,
    read_raw: RawFd,
}

impl FdChannel {
    pub fn new(read: OwnedFd, write: OwnedFd) -> Self {
        let read_raw = read.as_raw_fd();
        FdChannel {
            read: Mutex::new(read),
            write: Mutex::new(write),
            read_raw,
        }
    }

    /// Creates two channels connected back to back over anonymous pipes.
    pub fn pair() -> io::Result<(FdChannel, FdChannel)> {
        let (a_read, b_write) = base::pipe()?;
        let (b_read, a_write) = base::pipe()?;
        Ok((FdChannel::new(a_read, a_write), FdChannel::new(b_read, b_write)))
    }

    fn send(&self, message: &ManagedMessage) -> Result<()> {
        // One write of the full frame while holding the lock keeps frames from interleaving.
        let fd = self.write.lock();
        base::write_all(&*fd, message.as_frame()).map_err(Error::Write)
    }
}

impl Channel for FdChannel {
    fn send_request(&self, message: &mut ManagedMessage) -> Result<()> {
        message.set_response(false);
        self.send(message)
    }

    fn send_response(&self, message: &mut ManagedMessage) -> Result<()> {
        message.set_response(true);
        self.send(message)
    }

    fn receive_message(&self) -> Result<ManagedMessage> {
        let fd = self.read.lock();
        let mut header_bytes = [0u8; RAW_MESSAGE_HEADER_SIZE];
        base::read_exact(&*fd, &mut header_bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Eof
            } else {
                Error::Read(e)
            }
        })?;
        let header = RawMessageHeader::read_from_bytes(&header_bytes[..]).map_err(|_| {
            Error::Malformed {
                what: "message header",
                reason: "short header".to_string(),
            }
        })?;
        ManagedMessage::receive(header, |chunk| base::read_exact(&*fd, chunk))
    }

    fn wait_for_message(&self) -> Result<()> {
        base::poll_readable(&self.read_raw, None)
            .map(|_| ())
            .map_err(Error::Poll)
    }
}
