// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io;
use std::ptr;
use std::sync::atomic::compiler_fence;
use std::sync::atomic::Ordering;

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32 as Le32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::Error;
use crate::Result;

pub const RAW_MESSAGE_HEADER_SIZE: usize = 8;
/// Largest value that fits in the 31-bit command field.
pub const MAX_COMMAND: u32 = 0x7fff_ffff;
/// Largest payload whose framed size still fits in 32 bits.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize - RAW_MESSAGE_HEADER_SIZE;

const RESPONSE_BIT: u32 = 1 << 31;
/// Received payloads are buffered at most this much ahead of the data read so far.
const RECEIVE_CHUNK_SIZE: usize = 1 << 20;

/// Wire header: `command | is_response << 31`, then `payload_size`, both little-endian.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct RawMessageHeader {
    command_and_flag: Le32,
    payload_size: Le32,
}
const_assert_eq!(std::mem::size_of::<RawMessageHeader>(), RAW_MESSAGE_HEADER_SIZE);

impl RawMessageHeader {
    pub fn new(command: u32, is_response: bool, payload_size: u32) -> Result<Self> {
        if command > MAX_COMMAND {
            return Err(Error::CommandOutOfRange(command));
        }
        let flag = if is_response { RESPONSE_BIT } else { 0 };
        Ok(RawMessageHeader {
            command_and_flag: Le32::new(command | flag),
            payload_size: Le32::new(payload_size),
        })
    }

    pub fn command(&self) -> u32 {
        self.command_and_flag.get() & MAX_COMMAND
    }

    pub fn is_response(&self) -> bool {
        self.command_and_flag.get() & RESPONSE_BIT != 0
    }

    pub fn payload_size(&self) -> u32 {
        self.payload_size.get()
    }

    pub(crate) fn set_response(&mut self, is_response: bool) {
        let command = self.command();
        let flag = if is_response { RESPONSE_BIT } else { 0 };
        self.command_and_flag = Le32::new(command | flag);
    }
}

/// An owned, framed message: header and payload in one contiguous buffer.
///
/// The buffer is zero-filled when the message is dropped.
pub struct ManagedMessage {
    buf: Vec<u8>,
}

impl ManagedMessage {
    pub(crate) fn from_header(header: RawMessageHeader) -> Self {
        let mut buf = vec![0u8; RAW_MESSAGE_HEADER_SIZE + header.payload_size() as usize];
        buf[..RAW_MESSAGE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        ManagedMessage { buf }
    }

    /// Reads the payload announced by `header` through `read`, growing the buffer one chunk at a
    /// time. A header announcing more than [`MAX_PAYLOAD_SIZE`] is rejected before any read.
    pub(crate) fn receive<F>(header: RawMessageHeader, mut read: F) -> Result<Self>
    where
        F: FnMut(&mut [u8]) -> io::Result<()>,
    {
        let payload_size = header.payload_size() as usize;
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(Error::Malformed {
                what: "message header",
                reason: format!("payload size {} exceeds {}", payload_size, MAX_PAYLOAD_SIZE),
            });
        }
        let frame_size = RAW_MESSAGE_HEADER_SIZE + payload_size;
        let mut message = ManagedMessage {
            buf: Vec::with_capacity(frame_size.min(RAW_MESSAGE_HEADER_SIZE + RECEIVE_CHUNK_SIZE)),
        };
        message.buf.extend_from_slice(header.as_bytes());
        while message.buf.len() < frame_size {
            let start = message.buf.len();
            let end = frame_size.min(start + RECEIVE_CHUNK_SIZE);
            message.buf.resize(end, 0);
            read(&mut message.buf[start..]).map_err(Error::Read)?;
        }
        Ok(message)
    }

    pub fn header(&self) -> RawMessageHeader {
        // The buffer always starts with a full header.
        RawMessageHeader::read_from_prefix(&self.buf)
            .map(|(header, _)| header)
            .unwrap_or_default()
    }

    pub fn command(&self) -> u32 {
        self.header().command()
    }

    pub fn is_response(&self) -> bool {
        self.header().is_response()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[RAW_MESSAGE_HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[RAW_MESSAGE_HEADER_SIZE..]
    }

    /// The payload as text, rejecting non-UTF-8 bytes.
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(self.payload()).map_err(|e| Error::Malformed {
            what: "payload",
            reason: e.to_string(),
        })
    }

    /// The complete frame as it appears on the wire.
    pub fn as_frame(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn header_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..RAW_MESSAGE_HEADER_SIZE]
    }

    pub(crate) fn set_response(&mut self, is_response: bool) {
        let mut header = self.header();
        header.set_response(is_response);
        self.header_bytes_mut().copy_from_slice(header.as_bytes());
    }
}

impl Drop for ManagedMessage {
    fn drop(&mut self) {
        for b in self.buf.iter_mut() {
            // SAFETY: `b` is a valid, exclusively borrowed byte.
            unsafe { ptr::write_volatile(b, 0) };
        }
        compiler_fence(Ordering::SeqCst);
    }
}

impl fmt::Debug for ManagedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ManagedMessage")
            .field("command", &self.command())
            .field("is_response", &self.is_response())
            .field("payload_size", &self.payload().len())
            .finish()
    }
}

/// Allocates a message with a zero-initialized payload of `payload_size` bytes.
pub fn create_message(
    command: u32,
    is_response: bool,
    payload_size: usize,
) -> Result<ManagedMessage> {
    if payload_size > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge(payload_size));
    }
    let header = RawMessageHeader::new(command, is_response, payload_size as u32)?;
    Ok(ManagedMessage::from_header(header))
}

impl ManagedMessage {
    /// Convenience constructor copying `payload` into a new request message.
    pub fn with_payload(command: u32, payload: &[u8]) -> Result<ManagedMessage> {
        let mut message = create_message(command, false, payload.len())?;
        message.payload_mut().copy_from_slice(payload);
        Ok(message)
    }
}
