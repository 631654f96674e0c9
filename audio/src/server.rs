// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::sync::Weak;
use std::thread;

use base::error;
use base::info;
use base::warn;
use base::MemoryMapping;
use base::SharedMemory;
use base::UnixSeqpacket;
use base::UnixSeqpacketListener;
use base::VolatileSlice;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::constants::*;
use crate::layout::*;
use crate::AudioStatus;
use crate::Error;
use crate::Result;

/// Parameters requested by the guest for one stream, as received in `PCM_SET_PARAMS`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamParams {
    pub stream_id: u32,
    pub buffer_bytes: u32,
    pub period_bytes: u32,
    pub features: u32,
    pub channels: u8,
    pub format: u8,
    pub rate: u8,
}

impl From<&virtio_snd_pcm_set_params> for StreamParams {
    fn from(p: &virtio_snd_pcm_set_params) -> Self {
        StreamParams {
            stream_id: p.hdr.stream_id.get(),
            buffer_bytes: p.buffer_bytes.get(),
            period_bytes: p.period_bytes.get(),
            features: p.features.get(),
            channels: p.channels,
            format: p.format,
            rate: p.rate,
        }
    }
}

/// Implemented by whatever backs the guest's streams. There is one method per virtio-snd
/// request; a non-OK status is returned as the error.
pub trait AudioServerExecutor: Send + Sync {
    fn jacks_info(
        &self,
        start_id: u32,
        count: u32,
    ) -> std::result::Result<Vec<virtio_snd_jack_info>, AudioStatus>;
    fn streams_info(
        &self,
        start_id: u32,
        count: u32,
    ) -> std::result::Result<Vec<virtio_snd_pcm_info>, AudioStatus>;
    fn chmaps_info(
        &self,
        start_id: u32,
        count: u32,
    ) -> std::result::Result<Vec<virtio_snd_chmap_info>, AudioStatus>;
    fn set_stream_parameters(&self, params: StreamParams) -> std::result::Result<(), AudioStatus>;
    fn prepare_stream(&self, stream_id: u32) -> std::result::Result<(), AudioStatus>;
    fn release_stream(&self, stream_id: u32) -> std::result::Result<(), AudioStatus>;
    fn start_stream(&self, stream_id: u32) -> std::result::Result<(), AudioStatus>;
    fn stop_stream(&self, stream_id: u32) -> std::result::Result<(), AudioStatus>;
    fn remap_jack(
        &self,
        _jack_id: u32,
        _association: u32,
        _sequence: u32,
    ) -> std::result::Result<(), AudioStatus> {
        Err(AudioStatus::NotSupported)
    }
    fn on_playback_buffer(&self, buffer: TxBuffer<'_>);
    fn on_capture_buffer(&self, buffer: RxBuffer<'_>);
}

// Sends the per-buffer status exactly once. Dropping it unsent aborts, since the guest would
// otherwise wait on that buffer forever.
struct StatusReplier {
    socket: Weak<UnixSeqpacket>,
    buffer_offset: u32,
    sent: bool,
}

impl StatusReplier {
    fn send(&mut self, status: AudioStatus, latency_bytes: u32, consumed_length: u32) {
        self.sent = true;
        let msg = IoStatusMsg {
            status: virtio_snd_pcm_status {
                status: (status as u32).into(),
                latency_bytes: latency_bytes.into(),
            },
            buffer_offset: self.buffer_offset,
            consumed_length,
        };
        let Some(socket) = self.socket.upgrade() else {
            error!("virtio-snd: queue socket is gone, dropping buffer status");
            return;
        };
        match socket.send_nonblocking(msg.as_bytes()) {
            Ok(n) if n == msg.as_bytes().len() => {}
            Ok(n) => error!("virtio-snd: short status message write: {} bytes", n),
            Err(e) => error!("virtio-snd: failed to send buffer status: {}", e),
        }
    }
}

impl Drop for StatusReplier {
    fn drop(&mut self) {
        if !self.sent && !thread::panicking() {
            error!(
                "virtio-snd: buffer at offset {} destroyed without a status reply",
                self.buffer_offset
            );
            process::abort();
        }
    }
}

/// A guest playback buffer in the TX queue.
pub struct TxBuffer<'a> {
    stream_id: u32,
    data: VolatileSlice<'a>,
    replier: StatusReplier,
}

impl TxBuffer<'_> {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies the PCM bytes out of shared memory.
    pub fn read_all(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.data.len()];
        self.data.copy_to(&mut buf);
        buf
    }

    pub fn send_status(mut self, status: AudioStatus, latency_bytes: u32, consumed_length: u32) {
        self.replier.send(status, latency_bytes, consumed_length);
    }
}

/// A guest capture buffer in the RX queue.
pub struct RxBuffer<'a> {
    stream_id: u32,
    data: VolatileSlice<'a>,
    replier: StatusReplier,
}

impl RxBuffer<'_> {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes `bytes` at `offset`, truncating at the end of the buffer. Returns the count written.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> usize {
        let Some(len) = self.data.len().checked_sub(offset) else {
            return 0;
        };
        match self.data.sub_slice(offset, len.min(bytes.len())) {
            Ok(window) => window.copy_from(bytes),
            Err(_) => 0,
        }
    }

    /// Zero-fills everything from `offset` to the end of the buffer.
    pub fn zero_from(&self, offset: usize) {
        if let Some(len) = self.data.len().checked_sub(offset) {
            if let Ok(window) = self.data.sub_slice(offset, len) {
                window.write_zeroes();
            }
        }
    }

    pub fn send_status(mut self, status: AudioStatus, latency_bytes: u32, consumed_length: u32) {
        self.replier.send(status, latency_bytes, consumed_length);
    }
}

/// The listening socket guests connect to.
pub struct AudioServer {
    listener: UnixSeqpacketListener,
}

impl AudioServer {
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<AudioServer> {
        let listener = UnixSeqpacketListener::bind(path).map_err(Error::Bind)?;
        Ok(AudioServer { listener })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Blocks until a guest connects, then sets up its queues.
    pub fn accept_client(
        &self,
        num_jacks: u32,
        num_streams: u32,
        num_chmaps: u32,
        ring_size: usize,
    ) -> Result<AudioClientConnection> {
        let client = self.listener.accept().map_err(Error::Accept)?;
        info!("virtio-snd: accepted audio client");
        AudioClientConnection::create(
            client, num_jacks, num_streams, num_chmaps, ring_size, ring_size,
        )
    }
}

struct IoQueue {
    socket: Arc<UnixSeqpacket>,
    mapping: MemoryMapping,
    // Keeps the memfd alive for the session.
    _shm: SharedMemory,
}

impl IoQueue {
    fn new(name: &str, size: usize) -> Result<(IoQueue, UnixSeqpacket)> {
        let shm = SharedMemory::new(name, size as u64).map_err(Error::CreateQueue)?;
        let mapping = MemoryMapping::from_shm(&shm).map_err(Error::MapQueue)?;
        let (ours, theirs) = UnixSeqpacket::pair().map_err(Error::CreateSocketPair)?;
        Ok((
            IoQueue {
                socket: Arc::new(ours),
                mapping,
                _shm: shm,
            },
            theirs,
        ))
    }

    // Returns None on EOF.
    fn recv_transfer(&self) -> Result<Option<IoTransferMsg>> {
        let mut msg = IoTransferMsg::default();
        loop {
            let len = self.socket.recv(msg.as_mut_bytes()).map_err(Error::Recv)?;
            if len == 0 {
                return Ok(None);
            }
            if len == std::mem::size_of::<IoTransferMsg>() {
                return Ok(Some(msg));
            }
            warn!("virtio-snd: ignoring {} byte transfer message", len);
        }
    }

    fn window(&self, msg: &IoTransferMsg) -> (u32, VolatileSlice<'_>, StatusReplier) {
        let offset = msg.buffer_offset as usize;
        let len = msg.buffer_len as usize;
        match self.mapping.slice(offset, len) {
            Ok(data) => (
                msg.io_xfer.stream_id.get(),
                data,
                StatusReplier {
                    socket: Arc::downgrade(&self.socket),
                    buffer_offset: msg.buffer_offset,
                    sent: false,
                },
            ),
            Err(e) => {
                error!("virtio-snd: guest sent an out of bounds buffer: {}", e);
                process::abort();
            }
        }
    }
}

/// One guest session: the control socket, the event socket and the two IO queues.
pub struct AudioClientConnection {
    control_socket: UnixSeqpacket,
    // Reserved for jack and period events; the guest expects the socket to exist.
    _event_socket: UnixSeqpacket,
    tx: IoQueue,
    rx: IoQueue,
}

impl AudioClientConnection {
    /// Allocates the queues and sends the welcome message with the client's descriptors.
    pub fn create(
        client_socket: UnixSeqpacket,
        num_jacks: u32,
        num_streams: u32,
        num_chmaps: u32,
        tx_shm_len: usize,
        rx_shm_len: usize,
    ) -> Result<AudioClientConnection> {
        let (event_socket, event_peer) =
            UnixSeqpacket::pair().map_err(Error::CreateSocketPair)?;
        let (tx, tx_peer) = IoQueue::new(TX_SHM_NAME, tx_shm_len)?;
        let (rx, rx_peer) = IoQueue::new(RX_SHM_NAME, rx_shm_len)?;

        let config = VioSConfig {
            version: VIOS_VERSION,
            jacks: num_jacks,
            streams: num_streams,
            chmaps: num_chmaps,
        };
        let tx_shm_fd = tx._shm.try_clone_fd().map_err(Error::DupFd)?;
        let rx_shm_fd = rx._shm.try_clone_fd().map_err(Error::DupFd)?;
        let fds = [
            event_peer.as_raw_fd(),
            tx_peer.as_raw_fd(),
            rx_peer.as_raw_fd(),
            tx_shm_fd.as_raw_fd(),
            rx_shm_fd.as_raw_fd(),
        ];
        client_socket
            .send_with_fds(config.as_bytes(), &fds)
            .map_err(Error::SendWelcome)?;

        Ok(AudioClientConnection {
            control_socket: client_socket,
            _event_socket: event_socket,
            tx,
            rx,
        })
    }

    /// Handles one control request. Returns `false` once the guest has hung up.
    pub fn receive_commands(&self, executor: &dyn AudioServerExecutor) -> Result<bool> {
        let size = self
            .control_socket
            .next_packet_size()
            .map_err(Error::Recv)?;
        let mut packet = vec![0u8; size.max(std::mem::size_of::<virtio_snd_hdr>())];
        let len = self.control_socket.recv(&mut packet).map_err(Error::Recv)?;
        if len == 0 {
            return Ok(false);
        }
        packet.truncate(len);
        let reply = dispatch_command(&packet, executor);
        self.control_socket.send(&reply).map_err(Error::Send)?;
        Ok(true)
    }

    /// Handles one playback buffer. Returns `false` once the guest has hung up.
    pub fn receive_playback(&self, executor: &dyn AudioServerExecutor) -> Result<bool> {
        let Some(msg) = self.tx.recv_transfer()? else {
            return Ok(false);
        };
        let (stream_id, data, replier) = self.tx.window(&msg);
        executor.on_playback_buffer(TxBuffer {
            stream_id,
            data,
            replier,
        });
        Ok(true)
    }

    /// Handles one capture buffer. Returns `false` once the guest has hung up.
    pub fn receive_capture(&self, executor: &dyn AudioServerExecutor) -> Result<bool> {
        let Some(msg) = self.rx.recv_transfer()? else {
            return Ok(false);
        };
        let (stream_id, data, replier) = self.rx.window(&msg);
        executor.on_capture_buffer(RxBuffer {
            stream_id,
            data,
            replier,
        });
        Ok(true)
    }

    /// Wakes the IO loops so they observe EOF, e.g. after the control loop has finished.
    pub fn shutdown(&self) {
        for socket in [&*self.tx.socket, &*self.rx.socket, &self.control_socket] {
            if let Err(e) = socket.shutdown() {
                warn!("virtio-snd: failed to shut down socket: {}", e);
            }
        }
    }
}

fn status_only(status: AudioStatus) -> Vec<u8> {
    let hdr = virtio_snd_hdr {
        code: (status as u32).into(),
    };
    hdr.as_bytes().to_vec()
}

fn info_reply<T: IntoBytes + zerocopy::Immutable>(
    result: std::result::Result<Vec<T>, AudioStatus>,
) -> Vec<u8> {
    match result {
        Ok(infos) => {
            let mut reply = status_only(AudioStatus::Ok);
            for info in &infos {
                reply.extend_from_slice(info.as_bytes());
            }
            reply
        }
        Err(status) => status_only(status),
    }
}

fn unit_reply(result: std::result::Result<(), AudioStatus>) -> Vec<u8> {
    status_only(result.err().unwrap_or(AudioStatus::Ok))
}

/// Decodes one control packet and produces the reply packet.
fn dispatch_command(packet: &[u8], executor: &dyn AudioServerExecutor) -> Vec<u8> {
    let Ok((hdr, _)) = virtio_snd_hdr::read_from_prefix(packet) else {
        return status_only(AudioStatus::BadMsg);
    };
    let code = hdr.code.get();
    match code {
        VIRTIO_SND_R_JACK_INFO | VIRTIO_SND_R_PCM_INFO | VIRTIO_SND_R_CHMAP_INFO => {
            let Ok((query, _)) = virtio_snd_query_info::read_from_prefix(packet) else {
                return status_only(AudioStatus::BadMsg);
            };
            let start_id = query.start_id.get();
            let count = query.count.get();
            match code {
                VIRTIO_SND_R_JACK_INFO => info_reply(executor.jacks_info(start_id, count)),
                VIRTIO_SND_R_PCM_INFO => info_reply(executor.streams_info(start_id, count)),
                _ => info_reply(executor.chmaps_info(start_id, count)),
            }
        }
        VIRTIO_SND_R_PCM_SET_PARAMS => {
            match virtio_snd_pcm_set_params::read_from_prefix(packet) {
                Ok((params, _)) => unit_reply(executor.set_stream_parameters((&params).into())),
                Err(_) => status_only(AudioStatus::BadMsg),
            }
        }
        VIRTIO_SND_R_PCM_PREPARE
        | VIRTIO_SND_R_PCM_RELEASE
        | VIRTIO_SND_R_PCM_START
        | VIRTIO_SND_R_PCM_STOP => {
            let Ok((pcm, _)) = virtio_snd_pcm_hdr::read_from_prefix(packet) else {
                return status_only(AudioStatus::BadMsg);
            };
            let stream_id = pcm.stream_id.get();
            unit_reply(match code {
                VIRTIO_SND_R_PCM_PREPARE => executor.prepare_stream(stream_id),
                VIRTIO_SND_R_PCM_RELEASE => executor.release_stream(stream_id),
                VIRTIO_SND_R_PCM_START => executor.start_stream(stream_id),
                _ => executor.stop_stream(stream_id),
            })
        }
        VIRTIO_SND_R_JACK_REMAP => match virtio_snd_jack_remap::read_from_prefix(packet) {
            Ok((remap, _)) => unit_reply(executor.remap_jack(
                remap.jack_id.get(),
                remap.association.get(),
                remap.sequence.get(),
            )),
            Err(_) => status_only(AudioStatus::BadMsg),
        },
        _ => {
            warn!("virtio-snd: unsupported control request {:#x}", code);
            status_only(AudioStatus::NotSupported)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_client {
    use std::fs::File;
    use std::os::fd::OwnedFd;

    use super::*;

    pub(crate) struct TestClient {
        pub control: UnixSeqpacket,
        pub tx: UnixSeqpacket,
        pub rx: UnixSeqpacket,
        pub tx_shm: File,
        pub rx_shm: File,
        pub config: VioSConfig,
    }

    pub(crate) fn connect(control: UnixSeqpacket) -> TestClient {
        let mut config = VioSConfig::default();
        let (len, fds) = control.recv_with_fds(config.as_mut_bytes(), 8).unwrap();
        assert_eq!(len, std::mem::size_of::<VioSConfig>());
        assert_eq!(fds.len(), 5);
        let mut fds = fds.into_iter();
        let mut next = || -> OwnedFd { fds.next().unwrap() };
        let _event = UnixSeqpacket::from(next());
        let tx = UnixSeqpacket::from(next());
        let rx = UnixSeqpacket::from(next());
        TestClient {
            control,
            tx,
            rx,
            tx_shm: File::from(next()),
            rx_shm: File::from(next()),
            config,
        }
    }

    pub(crate) fn request(client: &TestClient, bytes: &[u8]) -> Vec<u8> {
        client.control.send(bytes).unwrap();
        let mut reply = vec![0u8; 1024];
        let len = client.control.recv(&mut reply).unwrap();
        reply.truncate(len);
        reply
    }

    pub(crate) fn reply_status(reply: &[u8]) -> u32 {
        virtio_snd_hdr::read_from_prefix(reply).unwrap().0.code.get()
    }

    pub(crate) fn pcm_request(code: u32, stream_id: u32) -> virtio_snd_pcm_hdr {
        virtio_snd_pcm_hdr {
            hdr: virtio_snd_hdr { code: code.into() },
            stream_id: stream_id.into(),
        }
    }

    pub(crate) fn set_params_request(
        stream_id: u32,
        channels: u8,
        format: u8,
        rate: u8,
    ) -> virtio_snd_pcm_set_params {
        virtio_snd_pcm_set_params {
            hdr: pcm_request(VIRTIO_SND_R_PCM_SET_PARAMS, stream_id),
            buffer_bytes: 16384.into(),
            period_bytes: 4096.into(),
            channels,
            format,
            rate,
            ..Default::default()
        }
    }

    pub(crate) fn session() -> (AudioClientConnection, TestClient) {
        let (server_end, client_end) = UnixSeqpacket::pair().unwrap();
        let connection =
            AudioClientConnection::create(server_end, 0, 2, 2, 4096, 4096).unwrap();
        (connection, connect(client_end))
    }
}
