// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use argh::FromArgs;
use audio::AudioHandler;
use audio::AudioMixer;
use audio::AudioServer;
use audio::AudioSink;
use audio::AudioSource;
use audio::MixerSettings;
use audio::SourceRead;
use base::error;
use base::info;
use base::sync::Mutex;

use crate::config::AudioConfig;

#[derive(FromArgs)]
#[argh(subcommand, name = "audio")]
/// Serve a guest virtio-snd device, mixing playback into a raw PCM file
pub struct Options {
    #[argh(option, arg_name = "PATH")]
    /// path to bind the audio server socket
    socket: Option<PathBuf>,
    #[argh(option, arg_name = "PATH")]
    /// file receiving the mixed s16le output
    output: Option<PathBuf>,
    #[argh(option, arg_name = "HZ")]
    /// sample rate of the mixed output
    rate: Option<u32>,
}

/// Appends every mixed frame to a file as little-endian samples.
struct RawPcmSink {
    file: Mutex<Option<File>>,
}

impl AudioSink for RawPcmSink {
    fn on_frame(&self, frame: &[i16], _timestamp_ms: i64) {
        let mut file = self.file.lock();
        let Some(out) = file.as_mut() else {
            return;
        };
        let bytes: Vec<u8> = frame.iter().flat_map(|s| s.to_le_bytes()).collect();
        if let Err(e) = out.write_all(&bytes) {
            error!("virtio-snd: failed to write output, discarding from now on: {}", e);
            *file = None;
        }
    }
}

/// Capture source with nothing to say.
struct MutedSource;

impl AudioSource for MutedSource {
    fn get_more_samples(
        &self,
        _buf: &mut [u8],
        _channels: u32,
        _sample_rate: u32,
        _bytes_per_sample: u32,
    ) -> io::Result<SourceRead> {
        Ok(SourceRead::Muted)
    }
}

pub fn run(opts: Options, mut cfg: AudioConfig) -> anyhow::Result<()> {
    if let Some(socket) = opts.socket {
        cfg.socket = socket;
    }
    if let Some(output) = opts.output {
        cfg.output_file = Some(output);
    }
    if let Some(rate) = opts.rate {
        cfg.output_rate = rate;
    }

    let file = match &cfg.output_file {
        Some(path) => Some(
            File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => None,
    };
    let settings = MixerSettings {
        channel_layout: cfg.output_layout,
        sample_rate: cfg.output_rate,
    };
    let sink = Arc::new(RawPcmSink {
        file: Mutex::new(file),
    });
    let mixer = AudioMixer::start(settings, sink).context("failed to start the audio mixer")?;
    let mut handler = AudioHandler::new(&cfg.streams, mixer, Some(Arc::new(MutedSource)))
        .context("invalid audio stream configuration")?;

    let server = AudioServer::bind(&cfg.socket)
        .with_context(|| format!("failed to bind {}", cfg.socket.display()))?;
    info!(
        "virtio-snd: serving {} streams on {}",
        handler.num_streams(),
        server.path().display()
    );
    let result = handler.serve(&server, cfg.ring_size);
    handler.stop();
    result.context("audio server failed")
}
