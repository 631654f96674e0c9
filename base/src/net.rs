// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::io;
use std::mem;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::ptr;
use std::time::Duration;

use crate::handle_eintr_errno;

// Return `sockaddr_un` for a given `path`.
fn sockaddr_un<P: AsRef<Path>>(path: P) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: all-zero is a valid sockaddr_un.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    // The path must fit in sun_path with its terminating nul, which the zeroed buffer provides.
    let bytes = path.as_ref().as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Input path size should be less than the length of sun_path.",
        ));
    };

    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let len = mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn new_seqpacket_socket() -> io::Result<OwnedFd> {
    // SAFETY: socket() has no memory side effects and the result is checked.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn check_len(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// A Unix `SOCK_SEQPACKET` socket.
#[derive(Debug)]
pub struct UnixSeqpacket {
    fd: OwnedFd,
}

impl UnixSeqpacket {
    /// Open a `SOCK_SEQPACKET` connection to socket named by `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let fd = new_seqpacket_socket()?;
        let (addr, len) = sockaddr_un(path.as_ref())?;
        // SAFETY: `addr` is a valid sockaddr_un of length `len`.
        let ret = handle_eintr_errno!(unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        });
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(UnixSeqpacket { fd })
    }

    /// Creates a pair of connected `SOCK_SEQPACKET` sockets.
    pub fn pair() -> io::Result<(UnixSeqpacket, UnixSeqpacket)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors socketpair writes.
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        unsafe {
            Ok((
                UnixSeqpacket::from_raw_fd(fds[0]),
                UnixSeqpacket::from_raw_fd(fds[1]),
            ))
        }
    }

    /// Clone the underlying FD.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(UnixSeqpacket {
            fd: self.fd.try_clone()?,
        })
    }

    fn send_flags(&self, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
        // SAFETY: the kernel reads at most `buf.len()` bytes from a live slice.
        let ret = handle_eintr_errno!(unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags | libc::MSG_NOSIGNAL,
            )
        });
        check_len(ret)
    }

    /// Sends one packet, blocking while the socket buffer is full.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.send_flags(buf, 0)
    }

    /// Sends one packet without blocking; fails with `WouldBlock` if the socket buffer is full.
    pub fn send_nonblocking(&self, buf: &[u8]) -> io::Result<usize> {
        self.send_flags(buf, libc::MSG_DONTWAIT)
    }

    /// Receives one packet. A return of 0 on a non-empty buffer means the peer hung up.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the kernel writes at most `buf.len()` bytes into memory we exclusively borrow.
        let ret = handle_eintr_errno!(unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        });
        check_len(ret)
    }

    /// Gets the size of the next packet without consuming it.
    pub fn next_packet_size(&self) -> io::Result<usize> {
        // SAFETY: a null buffer of length zero is never written to.
        let ret = handle_eintr_errno!(unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                ptr::null_mut(),
                0,
                libc::MSG_TRUNC | libc::MSG_PEEK,
            )
        });
        check_len(ret)
    }

    /// Sends one packet carrying `fds` as `SCM_RIGHTS` ancillary data.
    pub fn send_with_fds(&self, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let fd_bytes = mem::size_of_val(fds);
        // SAFETY: CMSG_SPACE only computes a length.
        let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
        // u64 elements keep the control buffer aligned for cmsghdr.
        let mut cmsg_buffer = vec![0u64; cmsg_space.div_ceil(mem::size_of::<u64>())];

        // SAFETY: all-zero is a valid msghdr.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if !fds.is_empty() {
            msg.msg_control = cmsg_buffer.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_space as _;
            // SAFETY: the control buffer is large enough for one header carrying `fds`.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
                ptr::copy_nonoverlapping(
                    fds.as_ptr() as *const u8,
                    libc::CMSG_DATA(cmsg),
                    fd_bytes,
                );
            }
        }

        // SAFETY: `msg` points at buffers that outlive the call.
        let ret = handle_eintr_errno!(unsafe {
            libc::sendmsg(self.fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL)
        });
        check_len(ret)
    }

    /// Receives one packet plus up to `max_fds` descriptors passed with it.
    pub fn recv_with_fds(
        &self,
        buf: &mut [u8],
        max_fds: usize,
    ) -> io::Result<(usize, Vec<OwnedFd>)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: CMSG_SPACE only computes a length.
        let cmsg_space =
            unsafe { libc::CMSG_SPACE((max_fds * mem::size_of::<RawFd>()) as u32) } as usize;
        let mut cmsg_buffer = vec![0u64; cmsg_space.div_ceil(mem::size_of::<u64>())];

        // SAFETY: all-zero is a valid msghdr.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if max_fds > 0 {
            msg.msg_control = cmsg_buffer.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_space as _;
        }

        // SAFETY: `msg` points at buffers that outlive the call.
        let ret = handle_eintr_errno!(unsafe {
            libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC)
        });
        let len = check_len(ret)?;

        let mut fds = Vec::new();
        // SAFETY: the kernel filled the control buffer with well formed cmsghdrs up to
        // `msg_controllen`, and each SCM_RIGHTS payload holds descriptors now owned by us.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                    let payload_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    for i in 0..payload_len / mem::size_of::<RawFd>() {
                        let fd = ptr::read_unaligned(data.add(i));
                        fds.push(OwnedFd::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        Ok((len, fds))
    }

    /// Sets the receive timeout; `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(t) => libc::timeval {
                tv_sec: t.as_secs() as libc::time_t,
                tv_usec: t.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        // SAFETY: `tv` is a valid timeval of the advertised size.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Shuts down both directions, waking any thread blocked in `recv`.
    pub fn shutdown(&self) -> io::Result<()> {
        // SAFETY: shutdown has no memory side effects.
        let ret = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl FromRawFd for UnixSeqpacket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }
}

impl AsRawFd for UnixSeqpacket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for UnixSeqpacket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<OwnedFd> for UnixSeqpacket {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<UnixSeqpacket> for OwnedFd {
    fn from(s: UnixSeqpacket) -> OwnedFd {
        s.fd
    }
}

/// A listening `SOCK_SEQPACKET` socket bound to a filesystem path, unlinked on drop.
#[derive(Debug)]
pub struct UnixSeqpacketListener {
    fd: OwnedFd,
    path: PathBuf,
}

impl UnixSeqpacketListener {
    /// Creates a socket bound to `path` and starts listening on it.
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let fd = new_seqpacket_socket()?;
        let (addr, len) = sockaddr_un(path.as_ref())?;
        // SAFETY: `addr` is a valid sockaddr_un of length `len`.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: listen has no memory side effects.
        let ret = unsafe { libc::listen(fd.as_raw_fd(), 128) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(UnixSeqpacketListener {
            fd,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Blocks until a client connects.
    pub fn accept(&self) -> io::Result<UnixSeqpacket> {
        // SAFETY: null address arguments are allowed and nothing else is written.
        let ret = handle_eintr_errno!(unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        });
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `ret` is a freshly accepted descriptor owned by nobody else.
        Ok(unsafe { UnixSeqpacket::from_raw_fd(ret) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for UnixSeqpacketListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for UnixSeqpacketListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::io::Seek;
    use std::io::Write;
    use std::thread;

    use super::*;

    #[test]
    fn sockaddr_un_zero_length_input() {
        let _res = sockaddr_un(Path::new("")).expect("sockaddr_un failed");
    }

    #[test]
    fn sockaddr_un_long_input_err() {
        let res = sockaddr_un(Path::new(&"a".repeat(108)));
        assert!(res.is_err());
    }

    #[test]
    fn sockaddr_un_len_check() {
        let (_addr, len) = sockaddr_un(Path::new(&"a".repeat(50))).expect("sockaddr_un failed");
        assert_eq!(
            len,
            (mem::offset_of!(libc::sockaddr_un, sun_path) + 50 + 1) as libc::socklen_t
        );
    }

    #[test]
    fn unix_seqpacket_path_not_exists() {
        let res = UnixSeqpacket::connect("/path/not/exists");
        assert!(res.is_err());
    }

    #[test]
    fn pair_preserves_packet_boundaries() {
        let (a, b) = UnixSeqpacket::pair().unwrap();
        a.send(b"first").unwrap();
        a.send(b"second packet").unwrap();
        assert_eq!(b.next_packet_size().unwrap(), 5);
        let mut buf = [0u8; 64];
        assert_eq!(b.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"first");
        assert_eq!(b.recv(&mut buf).unwrap(), 13);
        assert_eq!(&buf[..13], b"second packet");
    }

    #[test]
    fn recv_returns_zero_after_peer_close() {
        let (a, b) = UnixSeqpacket::pair().unwrap();
        drop(a);
        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn listener_accepts_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seqpacket");
        let listener = UnixSeqpacketListener::bind(&path).unwrap();
        let client_path = path.clone();
        let client = thread::spawn(move || {
            let s = UnixSeqpacket::connect(&client_path).unwrap();
            s.send(b"hello").unwrap();
        });
        let server = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf).unwrap(), 5);
        client.join().unwrap();
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn fds_survive_transfer() {
        let (a, b) = UnixSeqpacket::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared").unwrap();
        a.send_with_fds(b"msg", &[file.as_raw_fd()]).unwrap();

        let mut buf = [0u8; 8];
        let (len, fds) = b.recv_with_fds(&mut buf, 4).unwrap();
        assert_eq!(&buf[..len], b"msg");
        assert_eq!(fds.len(), 1);
        let mut received = File::from(fds.into_iter().next().unwrap());
        received.rewind().unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "shared");
    }

    #[test]
    fn nonblocking_send_reports_full_buffer() {
        let (a, _b) = UnixSeqpacket::pair().unwrap();
        let chunk = [0u8; 4096];
        let err = loop {
            if let Err(e) = a.send_nonblocking(&chunk) {
                break e;
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
