// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Blocking read-exact / write-all / poll helpers over raw file descriptors.

use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::time::Duration;

use crate::handle_eintr_errno;

/// Reads exactly `buf.len()` bytes from `fd`.
///
/// Returns `UnexpectedEof` if the peer closes before the buffer is filled.
pub fn read_exact<F: AsRawFd + ?Sized>(fd: &F, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: the kernel writes at most `buf.len()` bytes into memory we exclusively borrow.
        let ret = handle_eintr_errno!(unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        });
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of file before buffer was filled",
            ));
        }
        buf = &mut buf[ret as usize..];
    }
    Ok(())
}

/// Writes all of `buf` to `fd`.
pub fn write_all<F: AsRawFd + ?Sized>(fd: &F, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: the kernel reads at most `buf.len()` bytes from a live slice.
        let ret = handle_eintr_errno!(unsafe {
            libc::write(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len())
        });
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote zero bytes"));
        }
        buf = &buf[ret as usize..];
    }
    Ok(())
}

/// Waits until `fd` is readable, hung up or in an error state.
///
/// `None` waits forever. Returns `false` only when the timeout expired.
pub fn poll_readable<F: AsRawFd + ?Sized>(fd: &F, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
    };
    // SAFETY: `pfd` is a single valid pollfd that outlives the call.
    let ret = handle_eintr_errno!(unsafe { libc::poll(&mut pfd, 1, timeout_ms) });
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret > 0)
}

/// Creates an anonymous pipe, returning `(read_end, write_end)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe2 writes.
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn read_exact_across_partial_writes() {
        let (rx, tx) = pipe().unwrap();
        let writer = thread::spawn(move || {
            write_all(&tx, b"hel").unwrap();
            thread::sleep(Duration::from_millis(10));
            write_all(&tx, b"lo").unwrap();
        });
        let mut buf = [0u8; 5];
        read_exact(&rx, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        writer.join().unwrap();
    }

    #[test]
    fn read_exact_eof() {
        let (rx, tx) = pipe().unwrap();
        write_all(&tx, b"ab").unwrap();
        drop(tx);
        let mut buf = [0u8; 4];
        let err = read_exact(&rx, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn poll_times_out_then_reports_data() {
        let (rx, tx) = pipe().unwrap();
        assert!(!poll_readable(&rx, Some(Duration::from_millis(5))).unwrap());
        write_all(&tx, b"x").unwrap();
        assert!(poll_readable(&rx, None).unwrap());
    }
}
