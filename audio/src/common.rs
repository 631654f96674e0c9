// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use serde::Deserialize;
use serde::Serialize;

use crate::constants::*;

/// Bitmask of every frame rate in the virtio-snd table.
pub const ALL_VIRTIO_RATES: u64 = (1 << (VIRTIO_SND_PCM_RATE_384000 as u64 + 1)) - 1;

/// Converts VIRTIO_SND_PCM_RATE_* enum to frame rate
pub fn from_virtio_frame_rate(virtio_frame_rate: u8) -> Option<u32> {
    Some(match virtio_frame_rate {
        VIRTIO_SND_PCM_RATE_5512 => 5512u32,
        VIRTIO_SND_PCM_RATE_8000 => 8000u32,
        VIRTIO_SND_PCM_RATE_11025 => 11025u32,
        VIRTIO_SND_PCM_RATE_16000 => 16000u32,
        VIRTIO_SND_PCM_RATE_22050 => 22050u32,
        VIRTIO_SND_PCM_RATE_32000 => 32000u32,
        VIRTIO_SND_PCM_RATE_44100 => 44100u32,
        VIRTIO_SND_PCM_RATE_48000 => 48000u32,
        VIRTIO_SND_PCM_RATE_64000 => 64000u32,
        VIRTIO_SND_PCM_RATE_88200 => 88200u32,
        VIRTIO_SND_PCM_RATE_96000 => 96000u32,
        VIRTIO_SND_PCM_RATE_176400 => 176400u32,
        VIRTIO_SND_PCM_RATE_192000 => 192000u32,
        VIRTIO_SND_PCM_RATE_384000 => 384000u32,
        _ => return None,
    })
}

/// Container width in bits of a VIRTIO_SND_PCM_FMT_* sample.
pub fn bits_per_sample(virtio_pcm_format: u8) -> Option<u32> {
    Some(match virtio_pcm_format {
        VIRTIO_SND_PCM_FMT_IMA_ADPCM => 4,
        VIRTIO_SND_PCM_FMT_MU_LAW | VIRTIO_SND_PCM_FMT_A_LAW => 8,
        VIRTIO_SND_PCM_FMT_S8 | VIRTIO_SND_PCM_FMT_U8 => 8,
        VIRTIO_SND_PCM_FMT_S16 | VIRTIO_SND_PCM_FMT_U16 => 16,
        VIRTIO_SND_PCM_FMT_S18_3
        | VIRTIO_SND_PCM_FMT_U18_3
        | VIRTIO_SND_PCM_FMT_S20_3
        | VIRTIO_SND_PCM_FMT_U20_3
        | VIRTIO_SND_PCM_FMT_S24_3
        | VIRTIO_SND_PCM_FMT_U24_3 => 24,
        VIRTIO_SND_PCM_FMT_S20
        | VIRTIO_SND_PCM_FMT_U20
        | VIRTIO_SND_PCM_FMT_S24
        | VIRTIO_SND_PCM_FMT_U24
        | VIRTIO_SND_PCM_FMT_S32
        | VIRTIO_SND_PCM_FMT_U32
        | VIRTIO_SND_PCM_FMT_FLOAT => 32,
        VIRTIO_SND_PCM_FMT_FLOAT64 => 64,
        VIRTIO_SND_PCM_FMT_DSD_U8 => 8,
        VIRTIO_SND_PCM_FMT_DSD_U16 => 16,
        VIRTIO_SND_PCM_FMT_DSD_U32 | VIRTIO_SND_PCM_FMT_IEC958_SUBFRAME => 32,
        _ => return None,
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamDirection {
    Output,
    Input,
}

impl StreamDirection {
    pub fn to_virtio(self) -> u8 {
        match self {
            StreamDirection::Output => VIRTIO_SND_D_OUTPUT,
            StreamDirection::Input => VIRTIO_SND_D_INPUT,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelLayout {
    Mono,
    Stereo,
    #[serde(rename = "5.1")]
    Surround51,
}

impl ChannelLayout {
    pub fn channels(self) -> u32 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Surround51 => 6,
        }
    }

    /// Channel positions in interleaving order.
    pub fn positions(self) -> &'static [u8] {
        match self {
            ChannelLayout::Mono => &[VIRTIO_SND_CHMAP_MONO],
            ChannelLayout::Stereo => &[VIRTIO_SND_CHMAP_FL, VIRTIO_SND_CHMAP_FR],
            ChannelLayout::Surround51 => &[
                VIRTIO_SND_CHMAP_FL,
                VIRTIO_SND_CHMAP_FR,
                VIRTIO_SND_CHMAP_FC,
                VIRTIO_SND_CHMAP_LFE,
                VIRTIO_SND_CHMAP_RL,
                VIRTIO_SND_CHMAP_RR,
            ],
        }
    }
}
