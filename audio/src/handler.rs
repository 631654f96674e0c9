// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::mem;
use std::sync::Arc;
use std::thread;

use base::error;
use base::info;
use base::sync::Mutex;
use base::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::common::bits_per_sample;
use crate::common::from_virtio_frame_rate;
use crate::common::ChannelLayout;
use crate::common::StreamDirection;
use crate::common::ALL_VIRTIO_RATES;
use crate::constants::*;
use crate::layout::*;
use crate::mixer::AudioMixer;
use crate::server::AudioClientConnection;
use crate::server::AudioServer;
use crate::server::AudioServerExecutor;
use crate::server::RxBuffer;
use crate::server::StreamParams;
use crate::server::TxBuffer;
use crate::AudioStatus;
use crate::Error;
use crate::Result;

/// Formats the mixer can decode. 24-bit samples are not offered.
const SUPPORTED_FORMATS: u64 =
    (1 << VIRTIO_SND_PCM_FMT_S8) | (1 << VIRTIO_SND_PCM_FMT_S16) | (1 << VIRTIO_SND_PCM_FMT_S32);

/// One guest-visible stream. Input and output streams are numbered independently from 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioStreamSettings {
    pub id: u32,
    pub direction: StreamDirection,
    pub channel_layout: ChannelLayout,
    /// Whether the client side carries audio for this stream. Streams without it are still
    /// advertised to the guest, but playback is discarded and capture is silent.
    #[serde(default = "default_has_audio")]
    pub has_audio: bool,
}

fn default_has_audio() -> bool {
    true
}

/// Result of pulling capture data from the client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceRead {
    /// This many bytes were written to the front of the buffer.
    Samples(usize),
    Muted,
}

/// Supplies capture audio, typically the streaming client's microphone.
pub trait AudioSource: Send + Sync {
    fn get_more_samples(
        &self,
        buf: &mut [u8],
        channels: u32,
        sample_rate: u32,
        bytes_per_sample: u32,
    ) -> io::Result<SourceRead>;
}

#[derive(Default)]
struct StreamDesc {
    active: bool,
    bits_per_sample: u32,
    sample_rate: u32,
    channels: u32,
    // Capture bytes pulled from the source that did not fit in the previous buffer.
    holding_buffer: Vec<u8>,
}

/// Serves guest audio: answers control requests from the stream settings, forwards playback to
/// the mixer and fills capture buffers from the audio source.
pub struct AudioHandler {
    streams: Vec<virtio_snd_pcm_info>,
    chmaps: Vec<virtio_snd_chmap_info>,
    has_audio: Vec<bool>,
    descs: Vec<Mutex<StreamDesc>>,
    source: Option<Arc<dyn AudioSource>>,
    mixer: AudioMixer,
}

fn pcm_info(id: u32, settings: &AudioStreamSettings) -> virtio_snd_pcm_info {
    virtio_snd_pcm_info {
        hdr: virtio_snd_info {
            hda_fn_nid: id.into(),
        },
        features: 0.into(),
        formats: SUPPORTED_FORMATS.into(),
        rates: ALL_VIRTIO_RATES.into(),
        direction: settings.direction.to_virtio(),
        channels_min: 1,
        channels_max: settings.channel_layout.channels() as u8,
        padding: [0; 5],
    }
}

fn chmap_info(id: u32, settings: &AudioStreamSettings) -> virtio_snd_chmap_info {
    let positions = settings.channel_layout.positions();
    let mut info = virtio_snd_chmap_info {
        hdr: virtio_snd_info {
            hda_fn_nid: id.into(),
        },
        direction: settings.direction.to_virtio(),
        channels: positions.len() as u8,
        positions: [VIRTIO_SND_CHMAP_NONE; VIRTIO_SND_CHMAP_MAX_SIZE],
    };
    info.positions[..positions.len()].copy_from_slice(positions);
    info
}

fn info_range<T: Copy>(
    infos: &[T],
    start_id: u32,
    count: u32,
) -> std::result::Result<Vec<T>, AudioStatus> {
    let start = start_id as usize;
    match start.checked_add(count as usize) {
        Some(end) if start < infos.len() && end <= infos.len() => Ok(infos[start..end].to_vec()),
        _ => Err(AudioStatus::BadMsg),
    }
}

impl AudioHandler {
    pub fn new(
        settings: &[AudioStreamSettings],
        mixer: AudioMixer,
        source: Option<Arc<dyn AudioSource>>,
    ) -> Result<AudioHandler> {
        let num_inputs = settings
            .iter()
            .filter(|s| s.direction == StreamDirection::Input)
            .count() as u32;
        let mut slots: Vec<Option<(virtio_snd_pcm_info, virtio_snd_chmap_info, bool)>> =
            vec![None; settings.len()];
        for s in settings {
            let id = match s.direction {
                StreamDirection::Input => s.id,
                StreamDirection::Output => s.id.saturating_add(num_inputs),
            };
            match slots.get_mut(id as usize) {
                Some(slot) if slot.is_none() => {
                    *slot = Some((pcm_info(id, s), chmap_info(id, s), s.has_audio))
                }
                _ => return Err(Error::InvalidStreamId(s.id)),
            }
        }

        let mut streams = Vec::with_capacity(slots.len());
        let mut chmaps = Vec::with_capacity(slots.len());
        let mut has_audio = Vec::with_capacity(slots.len());
        // Every slot is filled: there are as many settings as slots and ids are unique.
        for (stream, chmap, audio) in slots.into_iter().flatten() {
            streams.push(stream);
            chmaps.push(chmap);
            has_audio.push(audio);
        }
        let descs = streams.iter().map(|_| Mutex::default()).collect();
        Ok(AudioHandler {
            streams,
            chmaps,
            has_audio,
            descs,
            source,
            mixer,
        })
    }

    pub fn num_streams(&self) -> u32 {
        self.streams.len() as u32
    }

    fn desc(&self, stream_id: u32) -> std::result::Result<&Mutex<StreamDesc>, AudioStatus> {
        self.descs
            .get(stream_id as usize)
            .ok_or(AudioStatus::BadMsg)
    }

    fn is_capture(&self, stream_id: u32) -> bool {
        self.streams
            .get(stream_id as usize)
            .is_some_and(|s| s.direction == VIRTIO_SND_D_INPUT)
    }

    fn is_playback(&self, stream_id: u32) -> bool {
        self.streams
            .get(stream_id as usize)
            .is_some_and(|s| s.direction == VIRTIO_SND_D_OUTPUT)
    }

    /// Accepts guests one after another, serving each until it disconnects.
    pub fn serve(&self, server: &AudioServer, ring_size: usize) -> Result<()> {
        loop {
            let connection = server.accept_client(
                0,
                self.streams.len() as u32,
                self.chmaps.len() as u32,
                ring_size,
            )?;
            self.serve_client(&connection)?;
            info!("virtio-snd: audio client disconnected");
        }
    }

    /// Runs the control, playback and capture loops of one session until the guest hangs up.
    pub fn serve_client(&self, connection: &AudioClientConnection) -> Result<()> {
        thread::scope(|s| {
            let playback = thread::Builder::new()
                .name("vios_playback".to_string())
                .spawn_scoped(s, || -> Result<()> {
                    while connection.receive_playback(self)? {}
                    Ok(())
                });
            let capture = thread::Builder::new()
                .name("vios_capture".to_string())
                .spawn_scoped(s, || -> Result<()> {
                    while connection.receive_capture(self)? {}
                    Ok(())
                });

            let control = match (&playback, &capture) {
                (Ok(_), Ok(_)) => (|| -> Result<()> {
                    while connection.receive_commands(self)? {}
                    Ok(())
                })(),
                (Err(e), _) | (_, Err(e)) => Err(Error::SpawnThread(io::Error::new(
                    e.kind(),
                    e.to_string(),
                ))),
            };
            if let Err(e) = &control {
                error!("virtio-snd: control loop failed: {}", e);
            }
            connection.shutdown();

            for (name, handle) in [("playback", playback), ("capture", capture)] {
                match handle.map(|h| h.join()) {
                    Ok(Ok(Err(e))) => error!("virtio-snd: {} loop failed: {}", name, e),
                    Ok(Err(_)) => error!("virtio-snd: {} thread panicked", name),
                    _ => {}
                }
            }
            control
        })
    }

    /// Stops the mixer thread.
    pub fn stop(&mut self) {
        self.mixer.stop();
    }

    fn stream_control(
        &self,
        stream_id: u32,
        f: impl FnOnce(&mut StreamDesc),
    ) -> std::result::Result<(), AudioStatus> {
        let desc = self.desc(stream_id)?;
        f(&mut *desc.lock());
        Ok(())
    }

    fn fill_capture(&self, buffer: &RxBuffer<'_>, desc: &mut StreamDesc) {
        let len = buffer.len();
        let bytes_per_sample = desc.bits_per_sample / 8;
        let bytes_per_request =
            (desc.sample_rate / 100 * bytes_per_sample * desc.channels) as usize;
        let source = match &self.source {
            Some(source) if bytes_per_request > 0 && self.has_audio[buffer.stream_id() as usize] => {
                source
            }
            _ => {
                buffer.zero_from(0);
                return;
            }
        };

        let mut holding = mem::take(&mut desc.holding_buffer);
        let mut written = buffer.write_at(0, &holding);
        holding.drain(..written);
        let pull = |buf: &mut [u8]| {
            source.get_more_samples(buf, desc.channels, desc.sample_rate, bytes_per_sample)
        };

        let mut request = vec![0u8; bytes_per_request];
        let mut muted = false;
        while holding.is_empty() && len - written >= bytes_per_request {
            match pull(&mut request) {
                Ok(SourceRead::Samples(0)) => break,
                Ok(SourceRead::Samples(n)) => {
                    written += buffer.write_at(written, &request[..n.min(bytes_per_request)])
                }
                Ok(SourceRead::Muted) => {
                    muted = true;
                    break;
                }
                Err(e) => {
                    error!("virtio-snd: failed to receive audio data from client: {}", e);
                    break;
                }
            }
        }

        if !muted && holding.is_empty() && written < len {
            // Less than 10 ms left: pull a full request and keep what does not fit.
            match pull(&mut request) {
                Ok(SourceRead::Samples(n)) => {
                    let n = n.min(bytes_per_request);
                    let take = (len - written).min(n);
                    written += buffer.write_at(written, &request[..take]);
                    holding.extend_from_slice(&request[take..n]);
                }
                Ok(SourceRead::Muted) => muted = true,
                Err(e) => error!("virtio-snd: failed to receive audio data from client: {}", e),
            }
        }
        if muted || written < len {
            buffer.zero_from(written);
        }
        desc.holding_buffer = holding;
    }
}

impl AudioServerExecutor for AudioHandler {
    fn jacks_info(
        &self,
        start_id: u32,
        count: u32,
    ) -> std::result::Result<Vec<virtio_snd_jack_info>, AudioStatus> {
        // No jacks are exposed.
        if count != 0 {
            warn!("virtio-snd: jack info requested for {}+{}", start_id, count);
            return Err(AudioStatus::BadMsg);
        }
        Ok(Vec::new())
    }

    fn streams_info(
        &self,
        start_id: u32,
        count: u32,
    ) -> std::result::Result<Vec<virtio_snd_pcm_info>, AudioStatus> {
        info_range(&self.streams, start_id, count)
    }

    fn chmaps_info(
        &self,
        start_id: u32,
        count: u32,
    ) -> std::result::Result<Vec<virtio_snd_chmap_info>, AudioStatus> {
        info_range(&self.chmaps, start_id, count)
    }

    fn set_stream_parameters(&self, params: StreamParams) -> std::result::Result<(), AudioStatus> {
        let desc = self.desc(params.stream_id)?;
        let info = &self.streams[params.stream_id as usize];
        let format_ok = params.format < 64 && info.formats.get() & (1u64 << params.format) != 0;
        let rate_ok = params.rate < 64 && info.rates.get() & (1u64 << params.rate) != 0;
        let channels_ok =
            params.channels >= info.channels_min && params.channels <= info.channels_max;
        let (Some(bits), Some(rate), true, true, true) = (
            bits_per_sample(params.format),
            from_virtio_frame_rate(params.rate),
            format_ok,
            rate_ok,
            channels_ok,
        ) else {
            warn!("virtio-snd: rejecting stream parameters {:?}", params);
            return Err(AudioStatus::BadMsg);
        };

        let mut desc = desc.lock();
        desc.bits_per_sample = bits;
        desc.sample_rate = rate;
        desc.channels = params.channels as u32;
        Ok(())
    }

    fn prepare_stream(&self, stream_id: u32) -> std::result::Result<(), AudioStatus> {
        self.stream_control(stream_id, |_| {})
    }

    fn release_stream(&self, stream_id: u32) -> std::result::Result<(), AudioStatus> {
        self.stream_control(stream_id, |desc| {
            desc.active = false;
            desc.holding_buffer.clear();
        })
    }

    fn start_stream(&self, stream_id: u32) -> std::result::Result<(), AudioStatus> {
        self.stream_control(stream_id, |desc| desc.active = true)
    }

    fn stop_stream(&self, stream_id: u32) -> std::result::Result<(), AudioStatus> {
        self.stream_control(stream_id, |desc| desc.active = false)?;
        if self.is_playback(stream_id) {
            self.mixer.on_stream_stopped(stream_id);
        }
        Ok(())
    }

    fn on_playback_buffer(&self, buffer: TxBuffer<'_>) {
        let stream_id = buffer.stream_id();
        if !self.is_playback(stream_id) {
            error!("virtio-snd: tx buffer for invalid or capture stream {}", stream_id);
            buffer.send_status(AudioStatus::BadMsg, 0, 0);
            return;
        }
        let len = buffer.len() as u32;
        let (rate, channels, bits) = {
            let desc = self.descs[stream_id as usize].lock();
            // The guest may have stopped the stream while this buffer was in flight.
            if !desc.active || !self.has_audio[stream_id as usize] {
                drop(desc);
                buffer.send_status(AudioStatus::Ok, 0, len);
                return;
            }
            (desc.sample_rate, desc.channels, desc.bits_per_sample)
        };

        let data = buffer.read_all();
        match self.mixer.on_playback(stream_id, rate, channels, bits, &data) {
            Ok(()) => buffer.send_status(AudioStatus::Ok, 0, len),
            Err(e) => {
                error!("virtio-snd: failed to mix stream {}: {}", stream_id, e);
                buffer.send_status(AudioStatus::IoErr, 0, 0);
            }
        }
    }

    fn on_capture_buffer(&self, buffer: RxBuffer<'_>) {
        let stream_id = buffer.stream_id();
        if !self.is_capture(stream_id) {
            error!("virtio-snd: rx buffer for invalid or playback stream {}", stream_id);
            buffer.send_status(AudioStatus::BadMsg, 0, 0);
            return;
        }
        let len = buffer.len() as u32;
        {
            let mut desc = self.descs[stream_id as usize].lock();
            if desc.active {
                self.fill_capture(&buffer, &mut desc);
            }
        }
        buffer.send_status(AudioStatus::Ok, 0, len);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileExt;
    use std::sync::atomic::AtomicU8;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use base::sync::Condvar;
    use zerocopy::IntoBytes;

    use super::*;
    use crate::mixer::AudioSink;
    use crate::mixer::MixerSettings;
    use crate::server::test_client::*;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<Vec<i16>>>,
        arrived: Condvar,
    }

    impl AudioSink for CollectingSink {
        fn on_frame(&self, frame: &[i16], _timestamp_ms: i64) {
            self.frames.lock().push(frame.to_vec());
            self.arrived.notify_all();
        }
    }

    // Each request is filled with one byte value, incremented on every call.
    #[derive(Default)]
    struct CountingSource {
        calls: AtomicU8,
        muted: bool,
    }

    impl AudioSource for CountingSource {
        fn get_more_samples(
            &self,
            buf: &mut [u8],
            _channels: u32,
            _sample_rate: u32,
            _bytes_per_sample: u32,
        ) -> io::Result<SourceRead> {
            if self.muted {
                return Ok(SourceRead::Muted);
            }
            let value = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            buf.fill(value);
            Ok(SourceRead::Samples(buf.len()))
        }
    }

    fn settings() -> Vec<AudioStreamSettings> {
        vec![
            AudioStreamSettings {
                id: 0,
                direction: StreamDirection::Output,
                channel_layout: ChannelLayout::Stereo,
                has_audio: true,
            },
            AudioStreamSettings {
                id: 0,
                direction: StreamDirection::Input,
                channel_layout: ChannelLayout::Mono,
                has_audio: true,
            },
        ]
    }

    fn handler(sink: Arc<CollectingSink>, source: Option<Arc<dyn AudioSource>>) -> AudioHandler {
        let mixer = AudioMixer::start(MixerSettings::default(), sink).unwrap();
        AudioHandler::new(&settings(), mixer, source).unwrap()
    }

    fn params(stream_id: u32, channels: u8, format: u8, rate: u8) -> StreamParams {
        (&set_params_request(stream_id, channels, format, rate)).into()
    }

    #[test]
    fn inputs_are_numbered_first() {
        let handler = handler(Arc::new(CollectingSink::default()), None);
        let infos = handler.streams_info(0, 2).unwrap();
        assert_eq!(infos[0].direction, VIRTIO_SND_D_INPUT);
        assert_eq!(infos[0].channels_max, 1);
        assert_eq!(infos[1].direction, VIRTIO_SND_D_OUTPUT);
        assert_eq!(infos[1].hdr.hda_fn_nid.get(), 1);
        assert_eq!(infos[1].channels_max, 2);
        assert_eq!(infos[1].rates.get(), ALL_VIRTIO_RATES);

        let chmaps = handler.chmaps_info(1, 1).unwrap();
        assert_eq!(chmaps[0].channels, 2);
        assert_eq!(
            chmaps[0].positions[..3],
            [VIRTIO_SND_CHMAP_FL, VIRTIO_SND_CHMAP_FR, VIRTIO_SND_CHMAP_NONE]
        );

        assert_eq!(handler.streams_info(1, 2).unwrap_err(), AudioStatus::BadMsg);
        assert_eq!(handler.streams_info(2, 0).unwrap_err(), AudioStatus::BadMsg);
        assert_eq!(
            handler.chmaps_info(u32::MAX, 2).unwrap_err(),
            AudioStatus::BadMsg
        );
        assert!(handler.jacks_info(0, 0).unwrap().is_empty());
        assert_eq!(handler.jacks_info(0, 1).unwrap_err(), AudioStatus::BadMsg);
    }

    #[test]
    fn duplicate_stream_ids_are_rejected() {
        let mut dup = settings();
        dup[1].direction = StreamDirection::Output;
        let mixer = AudioMixer::start(MixerSettings::default(), Arc::new(CollectingSink::default()))
            .unwrap();
        assert!(matches!(
            AudioHandler::new(&dup, mixer, None),
            Err(Error::InvalidStreamId(0))
        ));
    }

    #[test]
    fn set_params_validation() {
        let handler = handler(Arc::new(CollectingSink::default()), None);
        for format in [
            VIRTIO_SND_PCM_FMT_S8,
            VIRTIO_SND_PCM_FMT_S32,
            VIRTIO_SND_PCM_FMT_S16,
        ] {
            let ok = params(1, 2, format, VIRTIO_SND_PCM_RATE_48000);
            assert_eq!(handler.set_stream_parameters(ok), Ok(()));
        }
        let info = handler.streams_info(0, 2).unwrap();
        assert!(info
            .iter()
            .all(|i| i.formats.get() & (1 << VIRTIO_SND_PCM_FMT_S24) == 0));

        let bad = [
            params(2, 2, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000),
            params(1, 3, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000),
            params(0, 2, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000),
            params(1, 0, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000),
            params(1, 2, VIRTIO_SND_PCM_FMT_U8, VIRTIO_SND_PCM_RATE_48000),
            params(1, 2, VIRTIO_SND_PCM_FMT_S24, VIRTIO_SND_PCM_RATE_48000),
            params(1, 2, VIRTIO_SND_PCM_FMT_S24_3, VIRTIO_SND_PCM_RATE_48000),
            params(1, 2, VIRTIO_SND_PCM_FMT_S16, 14),
            params(1, 2, 200, VIRTIO_SND_PCM_RATE_48000),
        ];
        for p in bad {
            assert_eq!(handler.set_stream_parameters(p), Err(AudioStatus::BadMsg), "{:?}", p);
        }
        assert_eq!(handler.start_stream(5), Err(AudioStatus::BadMsg));
        assert_eq!(handler.stop_stream(1), Ok(()));
        assert_eq!(handler.prepare_stream(0), Ok(()));
        assert_eq!(handler.release_stream(0), Ok(()));
    }

    fn wait_for_frame(sink: &CollectingSink) -> Vec<i16> {
        let (frames, _) = sink.arrived.wait_timeout_while(
            sink.frames.lock(),
            Duration::from_secs(1),
            |frames| frames.is_empty(),
        );
        frames[0].clone()
    }

    fn xfer(stream_id: u32, buffer_offset: u32, buffer_len: u32) -> IoTransferMsg {
        IoTransferMsg {
            io_xfer: virtio_snd_pcm_xfer {
                stream_id: stream_id.into(),
            },
            buffer_offset,
            buffer_len,
        }
    }

    fn status(socket: &base::UnixSeqpacket) -> IoStatusMsg {
        let mut msg = IoStatusMsg::default();
        socket.recv(msg.as_mut_bytes()).unwrap();
        msg
    }

    #[test]
    fn playback_reaches_the_sink() {
        let sink = Arc::new(CollectingSink::default());
        let handler = handler(sink.clone(), None);
        let (connection, client) = session();

        thread::scope(|s| {
            let server = s.spawn(|| handler.serve_client(&connection));

            let set = set_params_request(1, 2, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000);
            assert_eq!(reply_status(&request(&client, set.as_bytes())), VIRTIO_SND_S_OK);

            // Buffers for a stopped stream are consumed without reaching the mixer.
            client.tx_shm.write_all_at(&[0x00, 0x10].repeat(960), 0).unwrap();
            client.tx.send(xfer(1, 0, 1920).as_bytes()).unwrap();
            let msg = status(&client.tx);
            assert_eq!(msg.status.status.get(), VIRTIO_SND_S_OK);
            assert_eq!(msg.consumed_length, 1920);
            assert!(sink.frames.lock().is_empty());

            let start = pcm_request(VIRTIO_SND_R_PCM_START, 1);
            assert_eq!(reply_status(&request(&client, start.as_bytes())), VIRTIO_SND_S_OK);
            client.tx.send(xfer(1, 0, 1920).as_bytes()).unwrap();
            assert_eq!(status(&client.tx).consumed_length, 1920);
            let frame = wait_for_frame(&sink);
            assert_eq!(frame.len(), 960);
            assert!(frame.iter().all(|&s| s == 0x1000));

            // The capture stream cannot be played back.
            client.tx.send(xfer(0, 0, 64).as_bytes()).unwrap();
            let msg = status(&client.tx);
            assert_eq!(msg.status.status.get(), VIRTIO_SND_S_BAD_MSG);
            assert_eq!(msg.consumed_length, 0);

            drop(client);
            server.join().unwrap().unwrap();
        });
    }

    #[test]
    fn capture_keeps_leftover_in_holding_buffer() {
        let source = Arc::new(CountingSource::default());
        let handler = handler(Arc::new(CollectingSink::default()), Some(source.clone() as Arc<dyn AudioSource>));
        let (connection, client) = session();

        thread::scope(|s| {
            let server = s.spawn(|| handler.serve_client(&connection));

            // Mono 16-bit at 48 kHz: 960 bytes per 10 ms.
            let set = set_params_request(0, 1, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000);
            assert_eq!(reply_status(&request(&client, set.as_bytes())), VIRTIO_SND_S_OK);
            let start = pcm_request(VIRTIO_SND_R_PCM_START, 0);
            assert_eq!(reply_status(&request(&client, start.as_bytes())), VIRTIO_SND_S_OK);

            client.rx.send(xfer(0, 0, 1500).as_bytes()).unwrap();
            assert_eq!(status(&client.rx).consumed_length, 1500);
            let mut data = vec![0u8; 1500];
            client.rx_shm.read_exact_at(&mut data, 0).unwrap();
            assert!(data[..960].iter().all(|&b| b == 1));
            assert!(data[960..].iter().all(|&b| b == 2));

            // 420 bytes of the second request carry over to the next buffer.
            client.rx.send(xfer(0, 2000, 1500).as_bytes()).unwrap();
            status(&client.rx);
            client.rx_shm.read_exact_at(&mut data, 2000).unwrap();
            assert!(data[..420].iter().all(|&b| b == 2));
            assert!(data[420..1380].iter().all(|&b| b == 3));
            assert!(data[1380..].iter().all(|&b| b == 4));

            drop(client);
            server.join().unwrap().unwrap();
        });
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn muted_capture_is_silent() {
        let source = Arc::new(CountingSource {
            muted: true,
            ..Default::default()
        });
        let handler = handler(Arc::new(CollectingSink::default()), Some(source));
        let (connection, client) = session();
        client.rx_shm.write_all_at(&[0xaa; 512], 0).unwrap();

        thread::scope(|s| {
            let server = s.spawn(|| handler.serve_client(&connection));
            let set = set_params_request(0, 1, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_8000);
            assert_eq!(reply_status(&request(&client, set.as_bytes())), VIRTIO_SND_S_OK);
            let start = pcm_request(VIRTIO_SND_R_PCM_START, 0);
            assert_eq!(reply_status(&request(&client, start.as_bytes())), VIRTIO_SND_S_OK);

            client.rx.send(xfer(0, 0, 512).as_bytes()).unwrap();
            let msg = status(&client.rx);
            assert_eq!(msg.status.status.get(), VIRTIO_SND_S_OK);
            assert_eq!(msg.consumed_length, 512);
            let mut data = vec![0xffu8; 512];
            client.rx_shm.read_exact_at(&mut data, 0).unwrap();
            assert!(data.iter().all(|&b| b == 0));

            drop(client);
            server.join().unwrap().unwrap();
        });
    }
}
