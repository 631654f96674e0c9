// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;
use serde::Deserialize;
use serde::Serialize;

/// Bit `n` selects the sensor with id `n`.
pub type SensorsMask = u32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(u32)]
pub enum SensorId {
    Acceleration = 0,
    Gyroscope = 1,
    Magnetic = 2,
    Temperature = 3,
    Proximity = 4,
    Light = 5,
    Pressure = 6,
    Humidity = 7,
    MagneticUncalibrated = 8,
    GyroscopeUncalibrated = 9,
    HingeAngle0 = 10,
    AccelerationUncalibrated = 11,
    Rotation = 12,
}

pub const SENSOR_COUNT: usize = 13;

impl SensorId {
    pub const ALL: [SensorId; SENSOR_COUNT] = [
        SensorId::Acceleration,
        SensorId::Gyroscope,
        SensorId::Magnetic,
        SensorId::Temperature,
        SensorId::Proximity,
        SensorId::Light,
        SensorId::Pressure,
        SensorId::Humidity,
        SensorId::MagneticUncalibrated,
        SensorId::GyroscopeUncalibrated,
        SensorId::HingeAngle0,
        SensorId::AccelerationUncalibrated,
        SensorId::Rotation,
    ];

    /// Name used on the HAL console.
    pub fn name(self) -> &'static str {
        match self {
            SensorId::Acceleration => "acceleration",
            SensorId::Gyroscope => "gyroscope",
            SensorId::Magnetic => "magnetic",
            SensorId::Temperature => "temperature",
            SensorId::Proximity => "proximity",
            SensorId::Light => "light",
            SensorId::Pressure => "pressure",
            SensorId::Humidity => "humidity",
            SensorId::MagneticUncalibrated => "magnetic-uncalibrated",
            SensorId::GyroscopeUncalibrated => "gyroscope-uncalibrated",
            SensorId::HingeAngle0 => "hinge-angle0",
            SensorId::AccelerationUncalibrated => "acceleration-uncalibrated",
            SensorId::Rotation => "rotation",
        }
    }

    pub fn bit(self) -> SensorsMask {
        1 << self as u32
    }

    /// The sensors selected by `mask`, in ascending id order. Bits beyond the known sensors are
    /// ignored.
    pub fn iter_mask(mask: SensorsMask) -> impl Iterator<Item = SensorId> {
        SensorId::ALL
            .into_iter()
            .filter(move |id| mask & id.bit() != 0)
    }
}

pub fn mask_of(ids: &[SensorId]) -> SensorsMask {
    ids.iter().fold(0, |mask, id| mask | id.bit())
}

/// Sensors the HAL reports continuously rather than on change.
pub fn continuous_sensors_mask() -> SensorsMask {
    mask_of(&[
        SensorId::Acceleration,
        SensorId::Gyroscope,
        SensorId::Magnetic,
        SensorId::Pressure,
        SensorId::AccelerationUncalibrated,
        SensorId::GyroscopeUncalibrated,
    ])
}

/// Form factor of the guest, which decides the sensors it exposes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Phone,
    Wear,
    Auto,
    Foldable,
    Tv,
    Minidroid,
    Go,
    Unknown,
}

impl DeviceType {
    pub fn enabled_sensors(self) -> SensorsMask {
        let motion = [
            SensorId::Acceleration,
            SensorId::Gyroscope,
            SensorId::Magnetic,
            SensorId::AccelerationUncalibrated,
            SensorId::GyroscopeUncalibrated,
            SensorId::MagneticUncalibrated,
        ];
        match self {
            DeviceType::Phone | DeviceType::Go | DeviceType::Unknown => {
                mask_of(&SensorId::ALL) & !SensorId::HingeAngle0.bit()
            }
            DeviceType::Foldable => mask_of(&SensorId::ALL),
            DeviceType::Wear => {
                mask_of(&motion)
                    | mask_of(&[SensorId::Light, SensorId::Proximity, SensorId::Rotation])
            }
            DeviceType::Auto => {
                mask_of(&motion) | mask_of(&[SensorId::Temperature, SensorId::Pressure])
            }
            DeviceType::Tv => 0,
            DeviceType::Minidroid => SensorId::Acceleration.bit(),
        }
    }
}
