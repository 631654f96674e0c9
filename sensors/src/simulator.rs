// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Derives nine-axis readings from the device orientation reported by the client.
//!
//! Orientation arrives as Euler angles in degrees and is kept as a rotation matrix
//! `R = Rx(x) · Ry(y) · Rz(z)`. Acceleration and the magnetic field are the fixed world-frame
//! vectors rotated by `R`; the gyroscope is the axis-angle of `R · R_prev⁻¹` over the time since
//! the previous update.

use std::time::Instant;

use base::sync::Mutex;

use crate::common::SensorId;
use crate::common::SensorsMask;
use crate::common::SENSOR_COUNT;

pub const GRAVITY: f64 = 9.81;
/// World-frame magnetic field, in µT.
pub const MAGNETIC_NORTH: [f64; 3] = [0.0, 5.9, -48.4];
/// Lower bound on the time between orientation updates, in seconds.
pub const GYROSCOPE_EPSILON: f64 = 1e-9;

pub const DEFAULT_TEMPERATURE: f64 = 25.0;
pub const DEFAULT_PROXIMITY: f64 = 1.0;
pub const DEFAULT_LIGHT: f64 = 400.0;
pub const DEFAULT_PRESSURE: f64 = 1013.25;
pub const DEFAULT_HUMIDITY: f64 = 40.0;
pub const DEFAULT_HINGE_ANGLE: f64 = 180.0;

type Vector3 = [f64; 3];
type Matrix3 = [[f64; 3]; 3];

const IDENTITY: Matrix3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

fn mat_mul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn mat_vec(m: &Matrix3, v: &Vector3) -> Vector3 {
    let mut out = [0.0; 3];
    for (i, cell) in out.iter_mut().enumerate() {
        *cell = (0..3).map(|k| m[i][k] * v[k]).sum();
    }
    out
}

fn transpose(m: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = m[j][i];
        }
    }
    out
}

/// Builds `Rx(x) · Ry(y) · Rz(z)` from angles in degrees.
pub fn rotation_from_euler(x: f64, y: f64, z: f64) -> [[f64; 3]; 3] {
    let (sx, cx) = x.to_radians().sin_cos();
    let (sy, cy) = y.to_radians().sin_cos();
    let (sz, cz) = z.to_radians().sin_cos();
    let rx = [[1.0, 0.0, 0.0], [0.0, cx, -sx], [0.0, sx, cx]];
    let ry = [[cy, 0.0, sy], [0.0, 1.0, 0.0], [-sy, 0.0, cy]];
    let rz = [[cz, -sz, 0.0], [sz, cz, 0.0], [0.0, 0.0, 1.0]];
    mat_mul(&mat_mul(&rx, &ry), &rz)
}

/// Angular velocity in rad/s that takes `prev` to `current` over `dt` seconds.
fn angular_velocity(prev: &Matrix3, current: &Matrix3, dt: f64) -> Vector3 {
    let delta = mat_mul(current, &transpose(prev));
    let trace = delta[0][0] + delta[1][1] + delta[2][2];
    let angle = ((trace - 1.0) / 2.0).clamp(-1.0, 1.0).acos();
    let sin = angle.sin();
    if sin.abs() < 1e-12 {
        return [0.0; 3];
    }
    let scale = angle / (2.0 * sin * dt.max(GYROSCOPE_EPSILON));
    [
        (delta[2][1] - delta[1][2]) * scale,
        (delta[0][2] - delta[2][0]) * scale,
        (delta[1][0] - delta[0][1]) * scale,
    ]
}

fn format_triple(v: &Vector3) -> String {
    format!("{:.6}:{:.6}:{:.6}", v[0], v[1], v[2])
}

struct SensorState {
    values: [Vector3; SENSOR_COUNT],
    rotation: Matrix3,
    last_update: Instant,
    low_latency_off_body: f64,
}

impl SensorState {
    fn set(&mut self, id: SensorId, value: Vector3) {
        self.values[id as usize] = value;
    }

    fn get(&self, id: SensorId) -> &Vector3 {
        &self.values[id as usize]
    }
}

/// Current readings of every simulated sensor.
pub struct SensorsSimulator {
    state: Mutex<SensorState>,
}

impl Default for SensorsSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorsSimulator {
    /// Starts upright and at rest with the scalar sensors at their defaults.
    pub fn new() -> Self {
        let mut state = SensorState {
            values: [[0.0; 3]; SENSOR_COUNT],
            rotation: IDENTITY,
            last_update: Instant::now(),
            low_latency_off_body: 0.0,
        };
        for (id, value) in [
            (SensorId::Temperature, DEFAULT_TEMPERATURE),
            (SensorId::Proximity, DEFAULT_PROXIMITY),
            (SensorId::Light, DEFAULT_LIGHT),
            (SensorId::Pressure, DEFAULT_PRESSURE),
            (SensorId::Humidity, DEFAULT_HUMIDITY),
            (SensorId::HingeAngle0, DEFAULT_HINGE_ANGLE),
        ] {
            state.set(id, [value, 0.0, 0.0]);
        }
        let acceleration = [0.0, 0.0, GRAVITY];
        state.set(SensorId::Acceleration, acceleration);
        state.set(SensorId::AccelerationUncalibrated, acceleration);
        state.set(SensorId::Magnetic, MAGNETIC_NORTH);
        state.set(SensorId::MagneticUncalibrated, MAGNETIC_NORTH);
        SensorsSimulator {
            state: Mutex::new(state),
        }
    }

    /// Applies a new orientation given as Euler angles in degrees.
    pub fn update_rotation_vec(&self, x: f64, y: f64, z: f64) {
        let rotation = rotation_from_euler(x, y, z);
        let now = Instant::now();
        let mut state = self.state.lock();
        let dt = now.duration_since(state.last_update).as_secs_f64();
        let gyroscope = angular_velocity(&state.rotation, &rotation, dt);
        let acceleration = mat_vec(&rotation, &[0.0, 0.0, GRAVITY]);
        let magnetic = mat_vec(&rotation, &MAGNETIC_NORTH);

        state.set(SensorId::Acceleration, acceleration);
        state.set(SensorId::AccelerationUncalibrated, acceleration);
        state.set(SensorId::Gyroscope, gyroscope);
        state.set(SensorId::GyroscopeUncalibrated, gyroscope);
        state.set(SensorId::Magnetic, magnetic);
        state.set(SensorId::MagneticUncalibrated, magnetic);
        state.set(SensorId::Rotation, [x, y, z]);
        state.rotation = rotation;
        state.last_update = now;
    }

    pub fn set_scalar(&self, id: SensorId, value: f64) {
        self.state.lock().set(id, [value, 0.0, 0.0]);
    }

    pub fn sensor_value(&self, id: SensorId) -> [f64; 3] {
        *self.state.lock().get(id)
    }

    /// Space-separated `x:y:z` readings of the sensors in `mask`, in ascending id order.
    pub fn get_sensors_data(&self, mask: SensorsMask) -> String {
        let state = self.state.lock();
        SensorId::iter_mask(mask)
            .map(|id| format_triple(state.get(id)))
            .collect::<Vec<String>>()
            .join(" ")
    }

    /// One `<name>:<x:y:z>` line per sensor in `mask`, as pushed to the HAL.
    pub fn hal_report(&self, mask: SensorsMask) -> String {
        let state = self.state.lock();
        SensorId::iter_mask(mask)
            .map(|id| format!("{}:{}\n", id.name(), format_triple(state.get(id))))
            .collect()
    }

    pub fn set_low_latency_off_body(&self, value: f64) {
        self.state.lock().low_latency_off_body = value;
    }

    pub fn low_latency_off_body(&self) -> f64 {
        self.state.lock().low_latency_off_body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mask_of;

    fn assert_close(actual: [f64; 3], expected: [f64; 3]) {
        for i in 0..3 {
            assert!(
                (actual[i] - expected[i]).abs() < 1e-6,
                "{:?} != {:?}",
                actual,
                expected
            );
        }
    }

    #[test]
    fn upright_device_reads_gravity_on_z() {
        let sim = SensorsSimulator::new();
        sim.update_rotation_vec(0.0, 0.0, 0.0);
        assert_eq!(sim.get_sensors_data(1), "0.000000:0.000000:9.810000");
        assert_eq!(sim.sensor_value(SensorId::Gyroscope), [0.0; 3]);
    }

    #[test]
    fn tilting_rotates_gravity_and_field() {
        let sim = SensorsSimulator::new();
        sim.update_rotation_vec(90.0, 0.0, 0.0);
        assert_close(sim.sensor_value(SensorId::Acceleration), [0.0, -GRAVITY, 0.0]);
        assert_close(sim.sensor_value(SensorId::Magnetic), [0.0, 48.4, 5.9]);
        assert_eq!(
            sim.sensor_value(SensorId::AccelerationUncalibrated),
            sim.sensor_value(SensorId::Acceleration)
        );
        assert_eq!(sim.sensor_value(SensorId::Rotation), [90.0, 0.0, 0.0]);
    }

    #[test]
    fn euler_composition_order() {
        let r = rotation_from_euler(0.0, 90.0, 90.0);
        // Ry(90) · Rz(90) maps x to y and y to z.
        assert_close(mat_vec(&r, &[1.0, 0.0, 0.0]), [0.0, 1.0, 0.0]);
        assert_close(mat_vec(&r, &[0.0, 1.0, 0.0]), [0.0, 0.0, 1.0]);
    }

    #[test]
    fn gyroscope_follows_rotation_axis() {
        let prev = IDENTITY;
        let current = rotation_from_euler(0.0, 0.0, 90.0);
        let w = angular_velocity(&prev, &current, 0.5);
        assert_close(w, [0.0, 0.0, std::f64::consts::PI]);
        assert_close(angular_velocity(&current, &current, 0.0), [0.0; 3]);
    }

    #[test]
    fn mask_selects_popcount_triples_in_id_order() {
        let sim = SensorsSimulator::new();
        for mask in [0u32, 1, 0b101, 0x1fff, 0x1008, 0xffff_ffff] {
            let data = sim.get_sensors_data(mask);
            let triples: Vec<&str> = data.split(' ').filter(|t| !t.is_empty()).collect();
            let expected = (mask & 0x1fff).count_ones() as usize;
            assert_eq!(triples.len(), expected, "mask {:#x}", mask);
            let expected_values: Vec<String> = SensorId::iter_mask(mask)
                .map(|id| format_triple(&sim.sensor_value(id)))
                .collect();
            assert_eq!(triples, expected_values);
        }
        assert_eq!(
            sim.get_sensors_data(mask_of(&[SensorId::Light, SensorId::Temperature])),
            "25.000000:0.000000:0.000000 400.000000:0.000000:0.000000"
        );
    }

    #[test]
    fn hal_report_lines() {
        let sim = SensorsSimulator::new();
        let report = sim.hal_report(mask_of(&[SensorId::Acceleration, SensorId::Pressure]));
        assert_eq!(
            report,
            "acceleration:0.000000:0.000000:9.810000\npressure:1013.250000:0.000000:0.000000\n"
        );
    }

    #[test]
    fn low_latency_off_body_is_stored() {
        let sim = SensorsSimulator::new();
        sim.set_low_latency_off_body(1.0);
        assert_eq!(sim.low_latency_off_body(), 1.0);
    }
}
