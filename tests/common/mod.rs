// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// In-memory simulation of a guide camera, a pulse actuator that moves the
// simulated star, and a calibration store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, not_found_error};
use image::{GrayImage, Luma};

use starguide::abstract_device::{CalibrationStore, ExposureConfig,
                                 ExposureStatus, ImagingDevice,
                                 PulseActuator, TipTiltActuator};
use starguide::calibration::{Calibration, CalibrationPoint, DeviceKind,
                             Point};

pub const SIM_WIDTH: u32 = 128;
pub const SIM_HEIGHT: u32 = 128;

/// A single star; the actuators move it.
pub struct SimSky {
    pub star: Point,
}

pub fn render_star(star: Point, width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let dx = x as f64 - star.x;
        let dy = y as f64 - star.y;
        let v = 10.0 + 180.0 * (-(dx * dx + dy * dy) / 8.0).exp();
        Luma([v.min(255.0) as u8])
    })
}

pub struct SimCamera {
    sky: Arc<Mutex<SimSky>>,
    last_image: Option<Arc<GrayImage>>,
}

impl SimCamera {
    pub fn new(sky: Arc<Mutex<SimSky>>) -> Self {
        SimCamera { sky, last_image: None }
    }
}

impl ImagingDevice for SimCamera {
    fn start_exposure(&mut self, _config: &ExposureConfig)
                      -> Result<(), CanonicalError> {
        let star = self.sky.lock().unwrap().star;
        self.last_image =
            Some(Arc::new(render_star(star, SIM_WIDTH, SIM_HEIGHT)));
        Ok(())
    }

    fn exposure_status(&self) -> Result<ExposureStatus, CanonicalError> {
        Ok(if self.last_image.is_some() {
            ExposureStatus::Exposed
        } else {
            ExposureStatus::Idle
        })
    }

    fn get_image(&mut self) -> Result<Arc<GrayImage>, CanonicalError> {
        self.last_image.clone()
            .ok_or_else(|| failed_precondition_error("no exposure started"))
    }
}

/// Moves the simulated star `gain` pixels per commanded unit on each axis,
/// where one unit is `unit_ms` of activation.
pub struct SimPulseActuator {
    sky: Arc<Mutex<SimSky>>,
    pub gain: f64,
    pub unit_ms: f64,
}

impl SimPulseActuator {
    pub fn new(sky: Arc<Mutex<SimSky>>, gain: f64, unit_ms: f64) -> Self {
        SimPulseActuator { sky, gain, unit_ms }
    }
}

impl PulseActuator for SimPulseActuator {
    fn activate(&mut self, axis1_pos: Duration, axis1_neg: Duration,
                axis2_pos: Duration, axis2_neg: Duration)
                -> Result<(), CanonicalError> {
        let unit_secs = self.unit_ms / 1000.0;
        let u = (axis1_pos.as_secs_f64() - axis1_neg.as_secs_f64())
            / unit_secs;
        let v = (axis2_pos.as_secs_f64() - axis2_neg.as_secs_f64())
            / unit_secs;
        let mut sky = self.sky.lock().unwrap();
        sky.star.x += self.gain * u;
        sky.star.y += self.gain * v;
        Ok(())
    }
}

/// Absolute-position actuator with symmetric travel limits; clamps to its
/// range, like real hardware.
pub struct SimTipTiltActuator {
    pub position: Point,
    pub travel: f64,
}

impl TipTiltActuator for SimTipTiltActuator {
    fn position(&mut self) -> Result<Point, CanonicalError> {
        Ok(self.position)
    }

    fn set_position(&mut self, position: Point)
                    -> Result<(), CanonicalError> {
        let (min, max) = self.range();
        self.position = Point::new(position.x.clamp(min.x, max.x),
                                   position.y.clamp(min.y, max.y));
        Ok(())
    }

    fn range(&self) -> (Point, Point) {
        (Point::new(-self.travel, -self.travel),
         Point::new(self.travel, self.travel))
    }
}

/// Records activations without moving anything.
pub struct RecordingPulseActuator {
    pub activations: Vec<(Duration, Duration, Duration, Duration)>,
}

impl PulseActuator for RecordingPulseActuator {
    fn activate(&mut self, axis1_pos: Duration, axis1_neg: Duration,
                axis2_pos: Duration, axis2_neg: Duration)
                -> Result<(), CanonicalError> {
        self.activations.push((axis1_pos, axis1_neg, axis2_pos, axis2_neg));
        Ok(())
    }
}

pub struct MemoryCalibrationStore {
    next_id: i32,
    entries: HashMap<i32, (Calibration, Vec<CalibrationPoint>)>,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self {
        MemoryCalibrationStore { next_id: 1, entries: HashMap::new() }
    }

    pub fn point_count(&self, id: i32) -> usize {
        self.entries.get(&id).map(|(_, points)| points.len()).unwrap_or(0)
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn add(&mut self, calibration: &Calibration)
           -> Result<i32, CanonicalError> {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, (calibration.clone(), Vec::new()));
        Ok(id)
    }

    fn add_point(&mut self, id: i32, point: &CalibrationPoint)
                 -> Result<(), CanonicalError> {
        let (_, points) = self.entries.get_mut(&id).ok_or_else(|| {
            not_found_error(format!("no calibration {}", id).as_str())
        })?;
        points.push(*point);
        Ok(())
    }

    fn update(&mut self, id: i32, calibration: &Calibration)
              -> Result<(), CanonicalError> {
        let entry = self.entries.get_mut(&id).ok_or_else(|| {
            not_found_error(format!("no calibration {}", id).as_str())
        })?;
        entry.0 = calibration.clone();
        Ok(())
    }

    fn get(&self, id: i32, kind: Option<DeviceKind>)
           -> Result<Calibration, CanonicalError> {
        let (calibration, _) = self.entries.get(&id).ok_or_else(|| {
            not_found_error(format!("no calibration {}", id).as_str())
        })?;
        if let Some(kind) = kind {
            if calibration.kind != kind {
                return Err(invalid_argument_error(
                    format!("calibration {} is for a {} device",
                            id, calibration.kind).as_str()));
            }
        }
        Ok(calibration.clone())
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
