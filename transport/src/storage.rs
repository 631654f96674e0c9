// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::ptr;
use std::sync::atomic::compiler_fence;
use std::sync::atomic::Ordering;

use crate::Error;
use crate::Result;

const SIZE_PREFIX_LEN: usize = 4;

/// An opaque size-prefixed blob handed to key/value storage backends. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageData {
    bytes: Vec<u8>,
}

impl StorageData {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > u32::MAX as usize {
            return Err(Error::PayloadTooLarge(bytes.len()));
        }
        Ok(StorageData {
            bytes: bytes.to_vec(),
        })
    }

    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encodes as a little-endian `u32` size followed by the bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIZE_PREFIX_LEN + self.bytes.len());
        out.extend_from_slice(&self.size().to_le_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Decodes one blob from the front of `buf`, returning it and the remaining bytes.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8])> {
        let malformed = |reason: &str| Error::Malformed {
            what: "storage data",
            reason: reason.to_string(),
        };
        let (prefix, rest) = buf
            .split_first_chunk::<SIZE_PREFIX_LEN>()
            .ok_or_else(|| malformed("missing size prefix"))?;
        let size = u32::from_le_bytes(*prefix) as usize;
        if rest.len() < size {
            return Err(malformed("size prefix exceeds buffer"));
        }
        let (bytes, rest) = rest.split_at(size);
        Ok((
            StorageData {
                bytes: bytes.to_vec(),
            },
            rest,
        ))
    }
}

impl Drop for StorageData {
    fn drop(&mut self) {
        for b in self.bytes.iter_mut() {
            // SAFETY: `b` is a valid, exclusively borrowed byte.
            unsafe { ptr::write_volatile(b, 0) };
        }
        compiler_fence(Ordering::SeqCst);
    }
}

impl fmt::Debug for StorageData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StorageData")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_layout() {
        let data = StorageData::new(b"lock").unwrap();
        assert_eq!(data.serialize(), b"\x04\x00\x00\x00lock");
    }

    #[test]
    fn deserialize_leaves_trailing_bytes() {
        let (data, rest) = StorageData::deserialize(b"\x02\x00\x00\x00hiXYZ").unwrap();
        assert_eq!(data.as_bytes(), b"hi");
        assert_eq!(rest, b"XYZ");
    }

    #[test]
    fn deserialize_rejects_truncation() {
        assert!(StorageData::deserialize(b"\x01\x00").is_err());
        assert!(StorageData::deserialize(b"\x05\x00\x00\x00abc").is_err());
    }

    #[test]
    fn debug_hides_contents() {
        let data = StorageData::new(b"secret").unwrap();
        assert!(!format!("{:?}", data).contains("secret"));
    }
}
