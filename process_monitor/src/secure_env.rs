// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Suspend/resume handshake with the secure_env worker.
//!
//! The monitor sends an empty request whose command is a [`SecureEnvRequest`]; the worker answers
//! with a one byte payload, `0` on success.

use std::sync::Arc;
use std::time::Duration;

use base::info;
use base::sync::Mutex;
use base::sync::MutexGuard;
use base::warn;
use enumn::N;
use transport::Channel;
use transport::ManagedMessage;

use crate::Error;
use crate::Result;

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum SecureEnvRequest {
    Suspend = 1,
    Resume = 2,
}

pub const RESPONSE_OK: u8 = 0;
pub const RESPONSE_FAILURE: u8 = 1;

/// Upper bound on the wait for the OEM lock when suspending.
pub const OEM_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends `request` and waits for a successful reply.
pub fn send_request(channel: &dyn Channel, request: SecureEnvRequest) -> Result<()> {
    let mut message = ManagedMessage::with_payload(request as u32, &[])?;
    channel.send_request(&mut message)?;
    let reply = channel.receive_message()?;
    let failure = |reason: String| Error::SecureEnv { request, reason };
    if !reply.is_response() || reply.command() != request as u32 {
        return Err(failure(format!(
            "unexpected reply to command {}",
            reply.command()
        )));
    }
    match reply.payload() {
        [RESPONSE_OK] => Ok(()),
        other => Err(failure(format!("replied {:?}", other))),
    }
}

/// Worker side of the handshake: holds the OEM lock from suspend until resume so no key
/// operation runs while the host is suspended.
pub struct SecureEnvSuspendResponder<T> {
    channel: Box<dyn Channel>,
    oem_lock: Arc<Mutex<T>>,
}

impl<T> SecureEnvSuspendResponder<T> {
    pub fn new(channel: Box<dyn Channel>, oem_lock: Arc<Mutex<T>>) -> Self {
        SecureEnvSuspendResponder { channel, oem_lock }
    }

    fn reply(&self, command: u32, status: u8) -> Result<()> {
        let mut message = ManagedMessage::with_payload(command, &[status])?;
        self.channel.send_response(&mut message)?;
        Ok(())
    }

    /// Answers requests until the channel is closed. The lock is released on return.
    pub fn run(&self) -> Result<()> {
        let mut held: Option<MutexGuard<T>> = None;
        loop {
            let request = match self.channel.receive_message() {
                Ok(request) => request,
                Err(transport::Error::Eof) => {
                    info!("secure_env suspend channel closed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            match SecureEnvRequest::n(request.command()) {
                Some(SecureEnvRequest::Suspend) => {
                    if held.is_none() {
                        held = self.oem_lock.try_lock_for(OEM_LOCK_TIMEOUT);
                        if held.is_none() {
                            warn!("{}, suspending anyway", Error::OemLockTimeout);
                        }
                    }
                    self.reply(request.command(), RESPONSE_OK)?;
                }
                Some(SecureEnvRequest::Resume) => {
                    held = None;
                    self.reply(request.command(), RESPONSE_OK)?;
                }
                None => {
                    warn!("secure_env: unknown request {}", request.command());
                    self.reply(request.command(), RESPONSE_FAILURE)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use transport::FdChannel;

    use super::*;

    fn responder() -> (FdChannel, Arc<Mutex<u32>>, thread::JoinHandle<Result<()>>) {
        let (host, worker) = FdChannel::pair().unwrap();
        let oem_lock = Arc::new(Mutex::new(0));
        let responder = SecureEnvSuspendResponder::new(Box::new(worker), oem_lock.clone());
        (host, oem_lock, thread::spawn(move || responder.run()))
    }

    #[test]
    fn suspend_holds_the_lock_until_resume() {
        let (host, oem_lock, worker) = responder();
        send_request(&host, SecureEnvRequest::Suspend).unwrap();
        assert!(oem_lock.try_lock().is_none());
        send_request(&host, SecureEnvRequest::Resume).unwrap();
        assert!(oem_lock.try_lock().is_some());
        drop(host);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn suspend_proceeds_after_lock_timeout() {
        let (host, oem_lock, worker) = responder();
        let guard = oem_lock.lock();
        let start = Instant::now();
        send_request(&host, SecureEnvRequest::Suspend).unwrap();
        assert!(start.elapsed() >= OEM_LOCK_TIMEOUT);
        drop(guard);
        send_request(&host, SecureEnvRequest::Resume).unwrap();
        drop(host);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn unknown_request_is_refused() {
        let (host, _oem_lock, worker) = responder();
        let mut message = ManagedMessage::with_payload(9, &[]).unwrap();
        host.send_request(&mut message).unwrap();
        let reply = host.receive_message().unwrap();
        assert_eq!(reply.payload(), [RESPONSE_FAILURE]);
        drop(host);
        worker.join().unwrap().unwrap();
    }
}
