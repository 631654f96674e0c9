// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Realtime mixer. Guest playback buffers are resampled into a shared 16-bit output buffer which
//! a dedicated thread drains in 10 ms chunks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use base::debug;
use base::error;
use base::sync::Condvar;
use base::sync::Mutex;

use crate::common::ChannelLayout;
use crate::Error;
use crate::Result;

const FRAME_PERIOD: Duration = Duration::from_millis(10);
const FRAME_PERIOD_MS: i64 = 10;
const MAX_SOURCE_CHANNELS: u32 = 6;

/// Receives the mixed output, one 10 ms frame at a time.
pub trait AudioSink: Send + Sync {
    /// `frame` holds `sample_rate / 100` interleaved frames of the mixer's channel layout.
    fn on_frame(&self, frame: &[i16], timestamp_ms: i64);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MixerSettings {
    pub channel_layout: ChannelLayout,
    pub sample_rate: u32,
}

impl Default for MixerSettings {
    fn default() -> Self {
        MixerSettings {
            channel_layout: ChannelLayout::Stereo,
            sample_rate: 48000,
        }
    }
}

impl MixerSettings {
    pub fn channels(&self) -> usize {
        self.channel_layout.channels() as usize
    }

    /// Size in bytes of one output frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels() * std::mem::size_of::<i16>()
    }

    pub fn chunk_frames(&self) -> usize {
        (self.sample_rate / 100) as usize
    }
}

fn decode_sample(bytes: &[u8], bits: u32) -> i16 {
    match bits {
        8 => (bytes[0] as i8 as i16) << 8,
        16 => i16::from_le_bytes([bytes[0], bytes[1]]),
        _ => (i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) >> 16) as i16,
    }
}

/// The output buffer and per-stream write positions, without any threading.
///
/// Frame 0 of the buffer is always the next frame to be emitted. Every sample past
/// `last_active_frame` is zero.
#[derive(Debug)]
pub struct MixBuffer {
    settings: MixerSettings,
    mixed: Vec<i16>,
    next_frame: BTreeMap<u32, usize>,
    last_active_frame: usize,
}

impl MixBuffer {
    pub fn new(settings: MixerSettings) -> MixBuffer {
        MixBuffer {
            settings,
            mixed: Vec::new(),
            next_frame: BTreeMap::new(),
            last_active_frame: 0,
        }
    }

    pub fn settings(&self) -> &MixerSettings {
        &self.settings
    }

    /// True when there is no active stream and nothing left to play out.
    pub fn is_idle(&self) -> bool {
        self.next_frame.is_empty() && self.last_active_frame == 0
    }

    pub fn has_stream(&self, stream_id: u32) -> bool {
        self.next_frame.contains_key(&stream_id)
    }

    pub fn last_active_frame(&self) -> usize {
        self.last_active_frame
    }

    /// Resamples `buffer` to the output rate and adds it at the stream's write position.
    pub fn mix(
        &mut self,
        stream_id: u32,
        src_rate: u32,
        src_channels: u32,
        src_bits: u32,
        buffer: &[u8],
    ) -> Result<()> {
        if !matches!(src_bits, 8 | 16 | 32) {
            return Err(Error::UnsupportedSampleWidth(src_bits));
        }
        if src_channels == 0 || src_channels > MAX_SOURCE_CHANNELS {
            return Err(Error::InvalidChannelCount(src_channels));
        }
        if src_rate == 0 {
            return Err(Error::InvalidSampleRate);
        }

        let dst_rate = self.settings.sample_rate as u64;
        let dst_channels = self.settings.channels();
        let src_rate = src_rate as u64;
        let sample_bytes = (src_bits / 8) as usize;
        let src_frame_bytes = sample_bytes * src_channels as usize;
        let src_frames = buffer.len() / src_frame_bytes;
        let start = *self.next_frame.entry(stream_id).or_insert(0);
        if src_frames == 0 {
            return Ok(());
        }

        let dst_frames = (src_frames as u64 * dst_rate).div_ceil(src_rate) as usize;
        let end = start + dst_frames;
        if self.mixed.len() < end * dst_channels {
            self.mixed.resize(end * dst_channels, 0);
        }

        let sample = |frame: usize, channel: usize| -> i32 {
            let offset = frame * src_frame_bytes + channel * sample_bytes;
            decode_sample(&buffer[offset..offset + sample_bytes], src_bits) as i32
        };

        for dst_frame in 0..dst_frames {
            let src_pos = dst_frame as u64 * src_rate;
            let index = ((src_pos / dst_rate) as usize).min(src_frames - 1);
            let next = (index + 1).min(src_frames - 1);
            let frac = (src_pos % dst_rate) as i64;
            let out = (start + dst_frame) * dst_channels;
            for channel in 0..dst_channels {
                let src_channel = if channel < src_channels as usize {
                    channel
                } else if src_channels == 1 {
                    0
                } else {
                    continue;
                };
                let s0 = sample(index, src_channel) as i64;
                let s1 = sample(next, src_channel) as i64;
                let value = s0 + (s1 - s0) * frac / dst_rate as i64;
                let slot = &mut self.mixed[out + channel];
                *slot = (*slot as i64 + value).clamp(i16::MIN as i64, i16::MAX as i64) as i16;
            }
        }

        self.next_frame.insert(stream_id, end);
        self.last_active_frame = self.last_active_frame.max(end);
        Ok(())
    }

    /// Removes the 10 ms chunk at the front of the buffer and shifts every position back.
    pub fn take_chunk(&mut self) -> Vec<i16> {
        let chunk_frames = self.settings.chunk_frames();
        let chunk_len = chunk_frames * self.settings.channels();
        let available = chunk_len.min(self.mixed.len());
        let mut chunk: Vec<i16> = self.mixed.drain(..available).collect();
        chunk.resize(chunk_len, 0);

        for frame in self.next_frame.values_mut() {
            *frame = frame.saturating_sub(chunk_frames);
        }
        self.last_active_frame = self.last_active_frame.saturating_sub(chunk_frames);
        chunk
    }

    /// Forgets the stream's write position. Audio it already mixed still plays out.
    pub fn remove_stream(&mut self, stream_id: u32) {
        self.next_frame.remove(&stream_id);
    }
}

struct MixerState {
    buffer: MixBuffer,
    stopped: bool,
}

struct Shared {
    state: Mutex<MixerState>,
    wake: Condvar,
}

/// Owns the mixer thread and the buffer it drains.
pub struct AudioMixer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl AudioMixer {
    /// Starts the mixer thread. It sleeps until the first playback buffer arrives.
    pub fn start(settings: MixerSettings, sink: Arc<dyn AudioSink>) -> Result<AudioMixer> {
        if settings.sample_rate < 100 {
            return Err(Error::InvalidSampleRate);
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(MixerState {
                buffer: MixBuffer::new(settings),
                stopped: false,
            }),
            wake: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("audio_mixer".to_string())
            .spawn(move || mixer_loop(&thread_shared, sink.as_ref()))
            .map_err(Error::SpawnThread)?;
        Ok(AudioMixer {
            shared,
            thread: Some(thread),
        })
    }

    pub fn settings(&self) -> MixerSettings {
        *self.shared.state.lock().buffer.settings()
    }

    pub fn on_playback(
        &self,
        stream_id: u32,
        src_rate: u32,
        src_channels: u32,
        src_bits: u32,
        buffer: &[u8],
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        let was_idle = state.buffer.is_idle();
        state
            .buffer
            .mix(stream_id, src_rate, src_channels, src_bits, buffer)?;
        if was_idle {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    pub fn on_stream_stopped(&self, stream_id: u32) {
        self.shared.state.lock().buffer.remove_stream(stream_id);
    }

    /// Stops and joins the mixer thread.
    pub fn stop(&mut self) {
        self.shared.state.lock().stopped = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("virtio-snd: audio mixer thread panicked");
            }
        }
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn mixer_loop(shared: &Shared, sink: &dyn AudioSink) {
    // Start of the current busy period: monotonic deadline base, wall clock base, frames emitted.
    let mut period: Option<(Instant, i64, u32)> = None;
    loop {
        let (chunk, timestamp_ms) = {
            let mut state = shared.state.lock();
            if state.buffer.is_idle() && !state.stopped {
                if period.take().is_some() {
                    debug!("virtio-snd: audio mixer idle");
                }
                state = shared
                    .wake
                    .wait_while(state, |s| s.buffer.is_idle() && !s.stopped);
            }
            if state.stopped {
                return;
            }

            let (base, base_ms, emitted) =
                *period.get_or_insert_with(|| (Instant::now(), wall_clock_ms(), 0));
            let deadline = base + FRAME_PERIOD * emitted;
            loop {
                let now = Instant::now();
                if now >= deadline || state.stopped {
                    break;
                }
                state = shared.wake.wait_timeout(state, deadline - now).0;
            }
            if state.stopped {
                return;
            }
            (
                state.buffer.take_chunk(),
                base_ms + emitted as i64 * FRAME_PERIOD_MS,
            )
        };
        if let Some((_, _, emitted)) = period.as_mut() {
            *emitted += 1;
        }
        sink.on_frame(&chunk, timestamp_ms);
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use super::*;

    fn stereo_48k() -> MixerSettings {
        MixerSettings {
            channel_layout: ChannelLayout::Stereo,
            sample_rate: 48000,
        }
    }

    fn to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<(Vec<i16>, i64)>>,
        arrived: Condvar,
    }

    impl AudioSink for CollectingSink {
        fn on_frame(&self, frame: &[i16], timestamp_ms: i64) {
            self.frames.lock().push((frame.to_vec(), timestamp_ms));
            self.arrived.notify_all();
        }
    }

    #[test]
    fn single_chunk_at_native_rate() {
        let mut mix = MixBuffer::new(stereo_48k());
        let buf: Vec<u8> = [0x00u8, 0x10].repeat(960);
        mix.mix(1, 48000, 2, 16, &buf).unwrap();
        assert_eq!(mix.last_active_frame(), 480);

        let chunk = mix.take_chunk();
        assert_eq!(chunk.len(), 960);
        assert!(chunk.iter().all(|&s| s == 0x1000));
        assert_eq!(mix.last_active_frame(), 0);
        assert!(mix.has_stream(1));
        assert!(mix.take_chunk().iter().all(|&s| s == 0));
    }

    #[test]
    fn saturating_sum_of_two_sines() {
        let (a, b) = (20000.0, 18000.0);
        let mut mix = MixBuffer::new(stereo_48k());
        let sine = |amplitude: f64| -> Vec<i16> {
            (0..480)
                .flat_map(|n| {
                    let v = (amplitude * (2.0 * PI * 440.0 * n as f64 / 48000.0).sin()) as i16;
                    [v, v]
                })
                .collect()
        };
        let sa = sine(a);
        let sb = sine(b);
        mix.mix(1, 48000, 2, 16, &to_bytes(&sa)).unwrap();
        mix.mix(2, 48000, 2, 16, &to_bytes(&sb)).unwrap();

        let chunk = mix.take_chunk();
        for (i, &out) in chunk.iter().enumerate() {
            let expected = (sa[i] as i32 + sb[i] as i32).clamp(i16::MIN as i32, i16::MAX as i32);
            assert_eq!(out as i32, expected, "sample {}", i);
        }
        assert!(chunk.contains(&i16::MAX));
        assert!(chunk.contains(&i16::MIN));
    }

    #[test]
    fn consecutive_buffers_append() {
        let mut mix = MixBuffer::new(stereo_48k());
        mix.mix(1, 48000, 2, 16, &to_bytes(&[100; 480])).unwrap();
        mix.mix(1, 48000, 2, 16, &to_bytes(&[200; 480])).unwrap();
        let chunk = mix.take_chunk();
        assert!(chunk[..480].iter().all(|&s| s == 100));
        assert!(chunk[480..].iter().all(|&s| s == 200));
    }

    #[test]
    fn upsamples_with_linear_interpolation() {
        let settings = MixerSettings {
            channel_layout: ChannelLayout::Mono,
            sample_rate: 200,
        };
        let mut mix = MixBuffer::new(settings);
        mix.mix(0, 100, 1, 16, &to_bytes(&[0, 1000])).unwrap();
        // Two source frames become four, the last clamped to the final source frame.
        assert_eq!(mix.last_active_frame(), 4);
        let chunk = mix.take_chunk();
        assert_eq!(chunk, vec![0, 500]);
        let chunk = mix.take_chunk();
        assert_eq!(chunk, vec![1000, 1000]);
    }

    #[test]
    fn downsample_rounds_up_frame_count() {
        let settings = MixerSettings {
            channel_layout: ChannelLayout::Mono,
            sample_rate: 32000,
        };
        let mut mix = MixBuffer::new(settings);
        mix.mix(0, 48000, 1, 16, &to_bytes(&[1; 481])).unwrap();
        assert_eq!(mix.last_active_frame(), 321);
    }

    #[test]
    fn mono_source_fills_every_channel() {
        let mut mix = MixBuffer::new(stereo_48k());
        mix.mix(0, 48000, 1, 16, &to_bytes(&[-300; 480])).unwrap();
        assert!(mix.take_chunk().iter().all(|&s| s == -300));
    }

    #[test]
    fn sample_widths() {
        let settings = MixerSettings {
            channel_layout: ChannelLayout::Mono,
            sample_rate: 100,
        };
        let mut mix = MixBuffer::new(settings);
        mix.mix(0, 100, 1, 8, &[0x80]).unwrap();
        assert_eq!(mix.take_chunk(), vec![i16::MIN]);
        mix.mix(0, 100, 1, 32, &0x1234_5678i32.to_le_bytes()).unwrap();
        assert_eq!(mix.take_chunk(), vec![0x1234]);
        assert!(matches!(
            mix.mix(0, 100, 1, 24, &[0, 0, 0]),
            Err(Error::UnsupportedSampleWidth(24))
        ));
        assert!(matches!(
            mix.mix(0, 100, 7, 16, &[0; 14]),
            Err(Error::InvalidChannelCount(7))
        ));
    }

    #[test]
    fn stopped_stream_plays_out_its_tail() {
        let mut mix = MixBuffer::new(stereo_48k());
        mix.mix(3, 48000, 2, 16, &to_bytes(&[7; 1920])).unwrap();
        mix.remove_stream(3);
        assert!(!mix.is_idle());
        assert!(mix.take_chunk().iter().all(|&s| s == 7));
        assert!(mix.take_chunk().iter().all(|&s| s == 7));
        assert!(mix.is_idle());
        mix.mix(3, 48000, 2, 16, &to_bytes(&[9; 2])).unwrap();
        assert_eq!(mix.take_chunk()[..2], [9i16, 9]);
    }

    #[test]
    fn first_buffer_is_emitted_promptly() {
        let sink = Arc::new(CollectingSink::default());
        let mut mixer = AudioMixer::start(stereo_48k(), sink.clone()).unwrap();
        let buf: Vec<u8> = [0x00u8, 0x10].repeat(960);
        mixer.on_playback(1, 48000, 2, 16, &buf).unwrap();

        let frames = sink.arrived.wait_timeout_while(
            sink.frames.lock(),
            Duration::from_millis(500),
            |frames| frames.is_empty(),
        );
        let (frame, _) = frames.0[0].clone();
        drop(frames);
        assert_eq!(frame.len(), 960);
        assert!(frame.iter().all(|&s| s == 0x1000));
        mixer.stop();
    }

    #[test]
    fn frames_are_spaced_by_ten_ms() {
        let sink = Arc::new(CollectingSink::default());
        let mut mixer = AudioMixer::start(stereo_48k(), sink.clone()).unwrap();
        let started = Instant::now();
        mixer.on_playback(0, 48000, 2, 16, &[0; 4]).unwrap();
        thread::sleep(Duration::from_millis(300));
        mixer.stop();
        let elapsed = started.elapsed();

        let frames = sink.frames.lock();
        let expected = (elapsed.as_millis() / 10) as usize;
        assert!(frames.len() <= expected + 1, "{} frames", frames.len());
        assert!(frames.len() + 5 >= expected, "{} frames", frames.len());
        for pair in frames.windows(2) {
            assert_eq!(pair[1].1 - pair[0].1, FRAME_PERIOD_MS);
        }
    }

    #[test]
    fn idle_mixer_emits_nothing() {
        let sink = Arc::new(CollectingSink::default());
        let mut mixer = AudioMixer::start(stereo_48k(), sink.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        mixer.stop();
        assert!(sink.frames.lock().is_empty());
    }
}
