// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::CanonicalError;
use image::GrayImage;

use crate::calibration::{Calibration, CalibrationPoint, DeviceKind, Point};

/// Exposure settings for the guide imager.
#[derive(Clone, Copy, Debug)]
pub struct ExposureConfig {
    pub duration: Duration,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        ExposureConfig { duration: Duration::from_millis(500) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureStatus {
    Idle,
    Exposing,
    Exposed,
}

/// The guide camera, supplied by the surrounding system. Implementations
/// wrap concrete vendor drivers.
pub trait ImagingDevice: Send {
    fn start_exposure(&mut self, config: &ExposureConfig)
                      -> Result<(), CanonicalError>;

    fn exposure_status(&self) -> Result<ExposureStatus, CanonicalError>;

    /// Blocks until the in-flight exposure completes, then returns it.
    fn get_image(&mut self) -> Result<Arc<GrayImage>, CanonicalError>;
}

/// An actuator accepting only discrete timed per-axis activations, e.g. a
/// mount's guide port. No position feedback.
pub trait PulseActuator: Send {
    /// Activates the four directions for the given durations. Blocks until
    /// all activation windows have elapsed.
    fn activate(&mut self,
                axis1_pos: Duration, axis1_neg: Duration,
                axis2_pos: Duration, axis2_neg: Duration)
                -> Result<(), CanonicalError>;
}

/// A continuous, fast, limited-range positional actuator, e.g. a tip-tilt
/// corrector plate.
pub trait TipTiltActuator: Send {
    fn position(&mut self) -> Result<Point, CanonicalError>;

    /// The device clamps to its own travel range.
    fn set_position(&mut self, position: Point) -> Result<(), CanonicalError>;

    /// (min, max) travel per axis, device units.
    fn range(&self) -> (Point, Point);
}

/// Persistent storage of calibrations, supplied by the surrounding system.
pub trait CalibrationStore: Send {
    /// Registers a new (possibly still incomplete) calibration; returns its
    /// assigned id.
    fn add(&mut self, calibration: &Calibration) -> Result<i32, CanonicalError>;

    fn add_point(&mut self, id: i32, point: &CalibrationPoint)
                 -> Result<(), CanonicalError>;

    /// Replaces the stored calibration, e.g. once solved.
    fn update(&mut self, id: i32, calibration: &Calibration)
              -> Result<(), CanonicalError>;

    /// Fetches a stored calibration; if `kind` is given, fails unless the
    /// stored calibration matches it.
    fn get(&self, id: i32, kind: Option<DeviceKind>)
           -> Result<Calibration, CanonicalError>;
}

pub type SharedImagingDevice = Arc<Mutex<dyn ImagingDevice>>;
pub type SharedPulseActuator = Arc<Mutex<dyn PulseActuator>>;
pub type SharedTipTiltActuator = Arc<Mutex<dyn TipTiltActuator>>;
pub type SharedCalibrationStore = Arc<Mutex<dyn CalibrationStore>>;

/// Runs one exposure to completion and returns the image. Blocks for the
/// real exposure duration.
pub fn capture_frame(imager: &SharedImagingDevice, config: &ExposureConfig)
                     -> Result<Arc<GrayImage>, CanonicalError> {
    let mut locked_imager = imager.lock().unwrap();
    locked_imager.start_exposure(config)?;
    locked_imager.get_image()
}
