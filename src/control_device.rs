// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, not_found_error};
use log::debug;

use crate::abstract_device::{ExposureConfig, SharedCalibrationStore,
                             SharedImagingDevice, SharedPulseActuator,
                             SharedTipTiltActuator};
use crate::calibration::{Calibration, DeviceKind, Point};
use crate::calibration_run::{CalibrationEvent, CalibrationRun, GRID_CELLS};
use crate::events::ListenerRegistry;
use crate::tracker::Tracker;

pub const PARAM_FOCAL_LENGTH: &str = "focal_length";
pub const PARAM_PIXEL_SIZE: &str = "pixel_size";
pub const PARAM_UNIT_GAIN: &str = "unit_gain";
pub const PARAM_PULSE_UNIT_MS: &str = "pulse_unit_ms";
pub const PARAM_CALIBRATION_STEP: &str = "calibration_step";

/// A guiding actuator together with its correction policy, calibration, and
/// named parameters. Cheap to clone; clones share state.
pub struct ControlDevice {
    state: Arc<Mutex<DeviceState>>,

    // Signalled when a calibration run reaches its terminal state.
    run_done: Arc<Condvar>,
}

impl Clone for ControlDevice {
    fn clone(&self) -> Self {
        ControlDevice {
            state: self.state.clone(),
            run_done: self.run_done.clone(),
        }
    }
}

pub(crate) struct DeviceState {
    pub(crate) policy: CorrectionPolicy,
    pub(crate) calibration: Calibration,
    pub(crate) calibrating: bool,
    pub(crate) run: Option<CalibrationRun>,
    params: HashMap<String, f64>,
}

impl DeviceState {
    // Explicitly set value, or the built-in default for this device kind.
    pub(crate) fn parameter_or_default(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
            .or_else(|| default_parameter(self.policy.kind(), name))
    }
}

fn default_parameter(kind: DeviceKind, name: &str) -> Option<f64> {
    match name {
        PARAM_FOCAL_LENGTH => Some(400.0),  // mm
        PARAM_PIXEL_SIZE => Some(5.0),      // um
        PARAM_UNIT_GAIN => Some(1.0),       // px per command unit
        PARAM_PULSE_UNIT_MS if kind == DeviceKind::Pulse => Some(100.0),
        _ => None,
    }
}

/// Per-device-kind correction semantics. The kind set is closed, so an
/// enum-of-structs rather than a trait object.
#[derive(Clone)]
pub(crate) enum CorrectionPolicy {
    /// Open loop timed pulses; a pulse is assumed to fully cancel the error
    /// over the next interval.
    Pulse { actuator: SharedPulseActuator },

    /// Absolute position with limited travel; correction clamps to range and
    /// reports the uncorrected remainder.
    TipTilt { actuator: SharedTipTiltActuator },
}

impl CorrectionPolicy {
    pub(crate) fn kind(&self) -> DeviceKind {
        match self {
            CorrectionPolicy::Pulse { .. } => DeviceKind::Pulse,
            CorrectionPolicy::TipTilt { .. } => DeviceKind::TipTilt,
        }
    }

    /// Prepares grid-scan motion. For a tip-tilt device this reads the
    /// current position as the scan origin (actuator I/O).
    pub(crate) fn probe_driver(&self, pulse_unit: Duration)
                               -> Result<ProbeDriver, CanonicalError> {
        match self {
            CorrectionPolicy::Pulse { actuator } => Ok(ProbeDriver::Pulse {
                actuator: actuator.clone(),
                unit: pulse_unit,
                current: (0.0, 0.0),
            }),
            CorrectionPolicy::TipTilt { actuator } => {
                let origin = actuator.lock().unwrap().position()?;
                Ok(ProbeDriver::TipTilt { actuator: actuator.clone(), origin })
            }
        }
    }
}

/// Issues grid-scan moves in command units. A pulse device only supports
/// relative motion, so the driver tracks the commanded position; a tip-tilt
/// device sweeps absolute positions around the scan origin.
pub(crate) enum ProbeDriver {
    Pulse {
        actuator: SharedPulseActuator,
        unit: Duration,
        current: (f64, f64),
    },
    TipTilt {
        actuator: SharedTipTiltActuator,
        origin: Point,
    },
}

impl ProbeDriver {
    /// Moves to (u, v) command units from the scan origin. Blocks for the
    /// real actuation duration.
    pub(crate) fn move_to(&mut self, u: f64, v: f64)
                          -> Result<(), CanonicalError> {
        match self {
            ProbeDriver::Pulse { actuator, unit, current } => {
                let du = u - current.0;
                let dv = v - current.1;
                let (a1_pos, a1_neg) = split_pulse(du, *unit);
                let (a2_pos, a2_neg) = split_pulse(dv, *unit);
                actuator.lock().unwrap()
                    .activate(a1_pos, a1_neg, a2_pos, a2_neg)?;
                *current = (u, v);
                Ok(())
            }
            ProbeDriver::TipTilt { actuator, origin } => {
                actuator.lock().unwrap()
                    .set_position(*origin + Point::new(u, v))
            }
        }
    }
}

fn split_pulse(units: f64, unit: Duration) -> (Duration, Duration) {
    let magnitude = unit.mul_f64(units.abs());
    if units >= 0.0 {
        (magnitude, Duration::ZERO)
    } else {
        (Duration::ZERO, magnitude)
    }
}

impl ControlDevice {
    pub fn new_pulse(actuator: SharedPulseActuator) -> Self {
        Self::new(CorrectionPolicy::Pulse { actuator })
    }

    pub fn new_tip_tilt(actuator: SharedTipTiltActuator) -> Self {
        Self::new(CorrectionPolicy::TipTilt { actuator })
    }

    fn new(policy: CorrectionPolicy) -> Self {
        let kind = policy.kind();
        ControlDevice {
            state: Arc::new(Mutex::new(DeviceState {
                policy,
                calibration: Calibration::new(kind),
                calibrating: false,
                run: None,
                params: HashMap::new(),
            })),
            run_done: Arc::new(Condvar::new()),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.state.lock().unwrap().policy.kind()
    }

    pub fn calibration(&self) -> Calibration {
        self.state.lock().unwrap().calibration.clone()
    }

    pub fn is_calibrated(&self) -> bool {
        self.state.lock().unwrap().calibration.is_complete()
    }

    pub fn is_calibrating(&self) -> bool {
        self.state.lock().unwrap().calibrating
    }

    /// Installs a calibration obtained outside of a run, e.g. reloaded from
    /// the calibration store.
    pub fn install_calibration(&self, calibration: Calibration)
                               -> Result<(), CanonicalError> {
        let mut state = self.state.lock().unwrap();
        if state.calibrating {
            return Err(failed_precondition_error(
                "bad state: calibration in progress"));
        }
        if calibration.kind != state.policy.kind() {
            return Err(invalid_argument_error(
                format!("calibration is for a {} device, this is a {} device",
                        calibration.kind, state.policy.kind()).as_str()));
        }
        if !calibration.is_complete() {
            return Err(failed_precondition_error(
                "not calibrated: calibration is incomplete"));
        }
        state.calibration = calibration;
        Ok(())
    }

    pub fn parameter(&self, name: &str) -> Result<f64, CanonicalError> {
        self.state.lock().unwrap().parameter_or_default(name).ok_or_else(|| {
            not_found_error(format!("no parameter {:?}", name).as_str())
        })
    }

    pub fn set_parameter(&self, name: &str, value: f64) {
        self.state.lock().unwrap().params.insert(name.to_string(), value);
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.state.lock().unwrap().parameter_or_default(name).is_some()
    }

    /// Starts a calibration grid scan on a dedicated thread. If a store is
    /// attached the new calibration is registered with it up front, and its
    /// assigned id is returned. Fails `BadState` if a scan is already
    /// running.
    pub fn start_calibration(
        &self, tracker: Box<dyn Tracker>,
        imager: SharedImagingDevice, exposure: ExposureConfig,
        store: Option<SharedCalibrationStore>,
        events: Arc<ListenerRegistry<CalibrationEvent>>)
        -> Result<Option<i32>, CanonicalError> {
        let kind = {
            let state = self.state.lock().unwrap();
            if state.calibrating {
                return Err(failed_precondition_error(
                    "bad state: calibration already running"));
            }
            state.policy.kind()
        };
        // Store registration is external I/O; the device lock is not held
        // across it.
        let mut calibration = Calibration::new(kind);
        calibration.id = match &store {
            Some(s) => Some(s.lock().unwrap().add(&calibration)?),
            None => None,
        };
        let store_id = calibration.id;

        let mut state = self.state.lock().unwrap();
        if state.calibrating {
            return Err(failed_precondition_error(
                "bad state: calibration already running"));
        }
        state.calibrating = true;
        state.calibration = calibration;
        let run = CalibrationRun::start(
            self.state.clone(), self.run_done.clone(), tracker, imager,
            exposure, store, events);
        state.run = Some(run);
        Ok(store_id)
    }

    /// Requests cancellation of the in-flight calibration run, if any, and
    /// returns immediately. The run stops at its next cell boundary.
    /// Idempotent no-op when nothing is running.
    pub fn cancel_calibration(&self) {
        let state = self.state.lock().unwrap();
        if let Some(run) = &state.run {
            run.cancel();
        }
    }

    /// Blocks the calling thread until the calibration run reaches a
    /// terminal state, or `timeout` elapses. Never cancels the run; returns
    /// false on timeout. True immediately if no run is active.
    pub fn wait_calibration(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.calibrating {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.run_done
                .wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
        true
    }

    /// (cells done, total cells) of the in-flight grid scan.
    pub fn calibration_progress(&self) -> (i32, i32) {
        let state = self.state.lock().unwrap();
        match &state.run {
            Some(run) => run.progress(),
            None => (0, GRID_CELLS),
        }
    }

    /// Applies a correction cancelling `offset` (pixels) and returns the
    /// still-uncorrected residual for hand-off to a secondary device.
    /// `dt` is the time until the next correction opportunity; pulse
    /// durations are capped to it.
    pub fn correct(&self, offset: Point, dt: Duration)
                   -> Result<Point, CanonicalError> {
        self.correct_with_command(offset, dt).map(|(_, residual)| residual)
    }

    /// As correct(), but also returns the applied command (command units)
    /// for the tracking record.
    pub(crate) fn correct_with_command(&self, offset: Point, dt: Duration)
                                       -> Result<(Point, Point), CanonicalError> {
        // Snapshot what we need; the lock is never held across actuator I/O.
        let (policy, calibration, pulse_unit_ms) = {
            let state = self.state.lock().unwrap();
            if state.calibrating {
                return Err(failed_precondition_error(
                    "bad state: calibration in progress"));
            }
            (state.policy.clone(), state.calibration.clone(),
             state.parameter_or_default(PARAM_PULSE_UNIT_MS).unwrap_or(100.0))
        };
        let (u, v) = calibration.correct(offset)?;
        let command = Point::new(-u, -v);
        debug!("correcting offset {} with command {}", offset, command);
        match policy {
            CorrectionPolicy::Pulse { actuator } => {
                let unit = Duration::from_secs_f64(pulse_unit_ms / 1000.0);
                let (a1_pos, a1_neg) = split_pulse(command.x, unit);
                let (a2_pos, a2_neg) = split_pulse(command.y, unit);
                actuator.lock().unwrap().activate(
                    a1_pos.min(dt), a1_neg.min(dt),
                    a2_pos.min(dt), a2_neg.min(dt))?;
                // Open loop: the pulse is assumed to fully cancel the error
                // over the next interval.
                Ok((command, Point::zero()))
            }
            CorrectionPolicy::TipTilt { actuator } => {
                let mut locked_actuator = actuator.lock().unwrap();
                let current = locked_actuator.position()?;
                let desired = current + command;
                let (min, max) = locked_actuator.range();
                let clamped = Point::new(desired.x.clamp(min.x, max.x),
                                         desired.y.clamp(min.y, max.y));
                locked_actuator.set_position(clamped)?;
                let achieved = clamped - current;
                // The part of the offset the clamped move does not cancel.
                let cancelled = calibration.apply(achieved.x, achieved.y, 0.0);
                Ok((achieved, offset + cancelled))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;
    use super::*;

    struct RecordingPulseActuator {
        activations: Vec<(Duration, Duration, Duration, Duration)>,
    }
    impl crate::abstract_device::PulseActuator for RecordingPulseActuator {
        fn activate(&mut self, a1_pos: Duration, a1_neg: Duration,
                    a2_pos: Duration, a2_neg: Duration)
                    -> Result<(), CanonicalError> {
            self.activations.push((a1_pos, a1_neg, a2_pos, a2_neg));
            Ok(())
        }
    }

    struct FakeTipTilt {
        position: Point,
    }
    impl crate::abstract_device::TipTiltActuator for FakeTipTilt {
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
            (Point::new(-5.0, -5.0), Point::new(5.0, 5.0))
        }
    }

    fn identity_calibration(kind: DeviceKind) -> Calibration {
        Calibration::from_coefficients(
            kind, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap()
    }

    #[test]
    fn test_parameter_accessors() {
        let actuator = Arc::new(Mutex::new(
            RecordingPulseActuator { activations: Vec::new() }));
        let device = ControlDevice::new_pulse(actuator);

        // Built-in default.
        assert_eq!(device.parameter(PARAM_FOCAL_LENGTH).unwrap(), 400.0);
        assert!(device.has_parameter(PARAM_PULSE_UNIT_MS));

        device.set_parameter(PARAM_FOCAL_LENGTH, 1000.0);
        assert_eq!(device.parameter(PARAM_FOCAL_LENGTH).unwrap(), 1000.0);

        // Absent with no default.
        assert!(!device.has_parameter(PARAM_CALIBRATION_STEP));
        let e = device.parameter(PARAM_CALIBRATION_STEP).unwrap_err();
        assert_eq!(e.code, CanonicalErrorCode::NotFound);
        device.set_parameter(PARAM_CALIBRATION_STEP, 5.0);
        assert!(device.has_parameter(PARAM_CALIBRATION_STEP));
    }

    #[test]
    fn test_pulse_correct_zero_residual() {
        let actuator = Arc::new(Mutex::new(
            RecordingPulseActuator { activations: Vec::new() }));
        let device = ControlDevice::new_pulse(actuator.clone());
        device.install_calibration(
            identity_calibration(DeviceKind::Pulse)).unwrap();
        device.set_parameter(PARAM_PULSE_UNIT_MS, 100.0);

        let residual = device.correct(Point::new(2.0, -1.0),
                                      Duration::from_secs(10)).unwrap();
        assert_eq!(residual, Point::zero());

        // Identity calibration: command is the negated offset, so axis1
        // gets a negative pulse and axis2 a positive one.
        let activations = &actuator.lock().unwrap().activations;
        assert_eq!(activations.len(), 1);
        let (a1_pos, a1_neg, a2_pos, a2_neg) = activations[0];
        assert_eq!(a1_pos, Duration::ZERO);
        assert_eq!(a1_neg, Duration::from_millis(200));
        assert_eq!(a2_pos, Duration::from_millis(100));
        assert_eq!(a2_neg, Duration::ZERO);
    }

    #[test]
    fn test_correct_without_calibration_fails() {
        let actuator = Arc::new(Mutex::new(
            RecordingPulseActuator { activations: Vec::new() }));
        let device = ControlDevice::new_pulse(actuator);
        let e = device.correct(Point::new(1.0, 0.0),
                               Duration::from_secs(1)).unwrap_err();
        assert!(e.message.contains("not calibrated"));
    }

    #[test]
    fn test_tip_tilt_correct_and_clamped_residual() {
        let actuator = Arc::new(Mutex::new(FakeTipTilt {
            position: Point::new(0.0, 0.0),
        }));
        let device = ControlDevice::new_tip_tilt(actuator.clone());
        device.install_calibration(
            identity_calibration(DeviceKind::TipTilt)).unwrap();

        // Within range: fully corrected.
        let residual = device.correct(Point::new(2.0, 1.0),
                                      Duration::from_secs(1)).unwrap();
        assert_abs_diff_eq!(residual.magnitude(), 0.0, epsilon = 1e-9);
        let pos = actuator.lock().unwrap().position;
        assert_abs_diff_eq!(pos.x, -2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pos.y, -1.0, epsilon = 1e-9);

        // Beyond range: travel clamps at -5, the rest is handed onward.
        let residual = device.correct(Point::new(10.0, 0.0),
                                      Duration::from_secs(1)).unwrap();
        assert_abs_diff_eq!(residual.x, 7.0, epsilon = 1e-9);
        assert_abs_diff_eq!(residual.y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_install_calibration_kind_mismatch() {
        let actuator = Arc::new(Mutex::new(
            RecordingPulseActuator { activations: Vec::new() }));
        let device = ControlDevice::new_pulse(actuator);
        let e = device.install_calibration(
            identity_calibration(DeviceKind::TipTilt)).unwrap_err();
        assert_eq!(e.code, CanonicalErrorCode::InvalidArgument);
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let actuator = Arc::new(Mutex::new(
            RecordingPulseActuator { activations: Vec::new() }));
        let device = ControlDevice::new_pulse(actuator);
        device.cancel_calibration();
        assert!(!device.is_calibrating());
        assert!(device.wait_calibration(Duration::from_millis(1)));
    }
}  // mod tests.
