// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! JSON configuration of the bridge, loaded with `--cfg`.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use audio::AudioStreamSettings;
use audio::ChannelLayout;
use audio::StreamDirection;
use base::syslog::LogConfig;
use sensors::DeviceType;
use serde::Deserialize;
use serde::Serialize;

fn default_audio_socket() -> PathBuf {
    PathBuf::from("/tmp/audio_server.sock")
}

fn default_ring_size() -> usize {
    262144
}

fn default_streams() -> Vec<AudioStreamSettings> {
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
            channel_layout: ChannelLayout::Stereo,
            has_audio: true,
        },
    ]
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AudioConfig {
    /// SEQPACKET socket the guest audio device connects to.
    pub socket: PathBuf,
    /// Size of each shared memory ring.
    pub ring_size: usize,
    pub streams: Vec<AudioStreamSettings>,
    pub output_rate: u32,
    pub output_layout: ChannelLayout,
    /// Raw interleaved s16le output of the mixer. Discarded when unset.
    pub output_file: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            socket: default_audio_socket(),
            ring_size: default_ring_size(),
            streams: default_streams(),
            output_rate: 48000,
            output_layout: ChannelLayout::Stereo,
            output_file: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SensorsConfig {
    pub device_type: DeviceType,
    pub report_interval_ms: Option<u64>,
    /// HAL control console (line based commands).
    pub control_console: Option<PathBuf>,
    /// HAL data console (framed reports).
    pub data_console: Option<PathBuf>,
    /// Framed kernel-log event stream used to detect guest reboots.
    pub kernel_log: Option<PathBuf>,
    /// Socket on which the streaming client sends orientation updates.
    pub client_socket: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoredCommand {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    #[serde(default)]
    pub critical: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProcessMonitorConfig {
    pub commands: Vec<MonitoredCommand>,
    pub restart_subprocesses: bool,
    pub strace_commands: Vec<String>,
    pub strace_log_dir: Option<PathBuf>,
    /// Socket connected to the secure_env suspend responder.
    pub secure_env_socket: Option<PathBuf>,
}

/// Top level configuration. Every section is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    pub audio: AudioConfig,
    pub sensors: SensorsConfig,
    pub process_monitor: ProcessMonitorConfig,
    pub log: LogConfig,
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> anyhow::Result<BridgeConfig> {
        serde_json::from_str(json).context("invalid bridge configuration")
    }

    #[cfg(feature = "config-file")]
    pub fn load(path: &Path) -> anyhow::Result<BridgeConfig> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("in {}", path.display()))
    }

    #[cfg(not(feature = "config-file"))]
    pub fn load(path: &Path) -> anyhow::Result<BridgeConfig> {
        anyhow::bail!(
            "cannot load {}: built without config file support",
            path.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        assert_eq!(BridgeConfig::from_json("{}").unwrap(), BridgeConfig::default());
        let audio = AudioConfig::default();
        assert_eq!(audio.streams.len(), 2);
        assert_eq!(audio.output_rate, 48000);
    }

    #[test]
    fn sections_are_parsed() {
        let config = BridgeConfig::from_json(
            r#"{
                "audio": {
                    "socket": "/run/snd.sock",
                    "streams": [
                        {"id": 0, "direction": "output", "channel_layout": "5.1"}
                    ],
                    "output_layout": "mono"
                },
                "sensors": {"device_type": "foldable", "report_interval_ms": 250},
                "process_monitor": {
                    "commands": [{"argv": ["crosvm", "run"], "critical": true}],
                    "restart_subprocesses": true
                },
                "log": {"filter": "debug"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.audio.socket, PathBuf::from("/run/snd.sock"));
        assert_eq!(
            config.audio.streams[0].channel_layout,
            ChannelLayout::Surround51
        );
        assert!(config.audio.streams[0].has_audio);
        assert_eq!(config.audio.output_layout, ChannelLayout::Mono);
        assert_eq!(config.audio.ring_size, default_ring_size());
        assert_eq!(config.sensors.device_type, DeviceType::Foldable);
        assert_eq!(config.sensors.report_interval_ms, Some(250));
        assert!(config.process_monitor.commands[0].critical);
        assert_eq!(config.log.filter, "debug");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(BridgeConfig::from_json(r#"{"video": {}}"#).is_err());
        assert!(BridgeConfig::from_json(r#"{"sensors": {"type": "phone"}}"#).is_err());
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn load_reads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, r#"{"sensors": {"device_type": "tv"}}"#).unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.sensors.device_type, DeviceType::Tv);
        assert!(BridgeConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
