// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![allow(non_camel_case_types)]

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32 as Le32;
use zerocopy::byteorder::little_endian::U64 as Le64;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::constants::VIRTIO_SND_CHMAP_MAX_SIZE;

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_hdr {
    pub code: Le32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_query_info {
    pub hdr: virtio_snd_hdr,
    pub start_id: Le32,
    pub count: Le32,
    pub size: Le32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_info {
    pub hda_fn_nid: Le32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_pcm_info {
    pub hdr: virtio_snd_info,
    pub features: Le32, /* 1 << VIRTIO_SND_PCM_F_XXX */
    pub formats: Le64,  /* 1 << VIRTIO_SND_PCM_FMT_XXX */
    pub rates: Le64,    /* 1 << VIRTIO_SND_PCM_RATE_XXX */
    pub direction: u8,
    pub channels_min: u8,
    pub channels_max: u8,

    pub padding: [u8; 5],
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_pcm_hdr {
    pub hdr: virtio_snd_hdr,
    pub stream_id: Le32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_pcm_set_params {
    pub hdr: virtio_snd_pcm_hdr,
    pub buffer_bytes: Le32,
    pub period_bytes: Le32,
    pub features: Le32, /* 1 << VIRTIO_SND_PCM_F_XXX */
    pub channels: u8,
    pub format: u8,
    pub rate: u8,
    pub padding: u8,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_pcm_xfer {
    pub stream_id: Le32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_pcm_status {
    pub status: Le32,
    pub latency_bytes: Le32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_jack_info {
    pub hdr: virtio_snd_info,
    pub features: Le32, /* 1 << VIRTIO_SND_JACK_F_XXX */
    pub hda_reg_defconf: Le32,
    pub hda_reg_caps: Le32,
    pub connected: u8,
    pub padding: [u8; 7],
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_jack_remap {
    pub hdr: virtio_snd_hdr, /* .code = VIRTIO_SND_R_JACK_REMAP */
    pub jack_id: Le32,
    pub association: Le32,
    pub sequence: Le32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_snd_chmap_info {
    pub hdr: virtio_snd_info,
    pub direction: u8,
    pub channels: u8,
    pub positions: [u8; VIRTIO_SND_CHMAP_MAX_SIZE],
}

/// Welcome message sent to a newly accepted client, alongside the queue descriptors.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct VioSConfig {
    pub version: u32,
    pub jacks: u32,
    pub streams: u32,
    pub chmaps: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct IoTransferMsg {
    pub io_xfer: virtio_snd_pcm_xfer,
    pub buffer_offset: u32,
    pub buffer_len: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct IoStatusMsg {
    pub status: virtio_snd_pcm_status,
    pub buffer_offset: u32,
    pub consumed_length: u32,
}

const_assert_eq!(std::mem::size_of::<virtio_snd_hdr>(), 4);
const_assert_eq!(std::mem::size_of::<virtio_snd_query_info>(), 16);
const_assert_eq!(std::mem::size_of::<virtio_snd_pcm_info>(), 32);
const_assert_eq!(std::mem::size_of::<virtio_snd_pcm_hdr>(), 8);
const_assert_eq!(std::mem::size_of::<virtio_snd_pcm_set_params>(), 24);
const_assert_eq!(std::mem::size_of::<virtio_snd_pcm_xfer>(), 4);
const_assert_eq!(std::mem::size_of::<virtio_snd_pcm_status>(), 8);
const_assert_eq!(std::mem::size_of::<virtio_snd_jack_info>(), 24);
const_assert_eq!(std::mem::size_of::<virtio_snd_jack_remap>(), 16);
const_assert_eq!(std::mem::size_of::<virtio_snd_chmap_info>(), 24);
const_assert_eq!(std::mem::size_of::<VioSConfig>(), 16);
const_assert_eq!(std::mem::size_of::<IoTransferMsg>(), 12);
const_assert_eq!(std::mem::size_of::<IoStatusMsg>(), 16);
