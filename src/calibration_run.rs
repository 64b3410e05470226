// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use canonical_error::{CanonicalError, CanonicalErrorCode, aborted_error,
                      failed_precondition_error};
use log::{info, warn};

use crate::abstract_device::{capture_frame, ExposureConfig,
                             SharedCalibrationStore, SharedImagingDevice};
use crate::calibration::{Calibration, CalibrationPoint};
use crate::control_device::{DeviceState, PARAM_CALIBRATION_STEP,
                            PARAM_FOCAL_LENGTH, PARAM_PIXEL_SIZE,
                            PARAM_PULSE_UNIT_MS, PARAM_UNIT_GAIN};
use crate::events::ListenerRegistry;
use crate::tracker::Tracker;

/// Number of non-origin cells in the 3x3 calibration grid.
pub const GRID_CELLS: i32 = 8;

// Grid scan order. Each cell is paired with a return-to-origin sample that
// anchors the regression.
const CELLS: [(i32, i32); 8] = [(-1, -1), (-1, 0), (-1, 1), (0, -1),
                                (0, 1), (1, -1), (1, 0), (1, 1)];

/// Minimum samples (origin plus surviving cell pairs) required before a
/// solve is attempted; a run with fewer, e.g. because the locator failed in
/// most cells, fails rather than producing a poorly-constrained fit.
pub const MIN_RUN_POINTS: usize = 7;

// Target probe amplitude on the sky, arcseconds. The grid step is derived
// from this so the star moves a usable number of pixels regardless of
// optics.
const PROBE_SKY_ARCSEC: f64 = 30.0;

// Bounds for the grid step, command units.
const MIN_GRID_STEP: f64 = 2.0;
const MAX_GRID_STEP: f64 = 10.0;

#[derive(Clone, Debug)]
pub enum RunOutcome {
    /// The grid scan completed and the solver produced a complete
    /// calibration (also installed on the owning device).
    Solved(Calibration),

    /// The run was cancelled; not an error. The device calibration is left
    /// incomplete.
    Cancelled,

    /// A device-layer failure or an unsolvable point set ended the run.
    Failed(String),
}

/// Events published synchronously from the run's worker thread. Each point
/// and the final outcome are delivered exactly once, in scan order.
#[derive(Clone, Debug)]
pub enum CalibrationEvent {
    Point(CalibrationPoint),
    Progress { cells_done: i32, total_cells: i32 },
    Completed(RunOutcome),
}

/// A cancellable grid-scan calibration in progress, on its own dedicated
/// thread. Actuator calls block that thread for the real probe duration.
pub struct CalibrationRun {
    cancel: Arc<Mutex<bool>>,
    progress: Arc<Mutex<(i32, i32)>>,
    _worker: Option<thread::JoinHandle<()>>,
}

impl CalibrationRun {
    pub(crate) fn start(
        device_state: Arc<Mutex<DeviceState>>, run_done: Arc<Condvar>,
        tracker: Box<dyn Tracker>, imager: SharedImagingDevice,
        exposure: ExposureConfig, store: Option<SharedCalibrationStore>,
        events: Arc<ListenerRegistry<CalibrationEvent>>)
        -> CalibrationRun {
        let cancel = Arc::new(Mutex::new(false));
        let progress = Arc::new(Mutex::new((0, GRID_CELLS)));
        let cancel_clone = cancel.clone();
        let progress_clone = progress.clone();
        let worker = thread::Builder::new()
            .name("calibration-run".to_string())
            .spawn(move || {
                Self::worker(device_state, run_done, tracker, imager,
                             exposure, store, events, cancel_clone,
                             progress_clone);
            })
            .expect("failed to spawn calibration thread");
        CalibrationRun {
            cancel,
            progress,
            _worker: Some(worker),
        }
    }

    /// Requests cooperative cancellation; the worker notices at its next
    /// cell boundary. An in-progress actuation completes regardless.
    pub fn cancel(&self) {
        *self.cancel.lock().unwrap() = true;
    }

    /// (cells done, total cells).
    pub fn progress(&self) -> (i32, i32) {
        *self.progress.lock().unwrap()
    }

    #[allow(clippy::too_many_arguments)]
    fn worker(device_state: Arc<Mutex<DeviceState>>, run_done: Arc<Condvar>,
              mut tracker: Box<dyn Tracker>, imager: SharedImagingDevice,
              exposure: ExposureConfig,
              store: Option<SharedCalibrationStore>,
              events: Arc<ListenerRegistry<CalibrationEvent>>,
              cancel: Arc<Mutex<bool>>, progress: Arc<Mutex<(i32, i32)>>) {
        // Device-layer failures are caught here, at the thread boundary,
        // and become a Failed outcome rather than a worker panic.
        let outcome = match Self::run_grid(
            &device_state, tracker.as_mut(), &imager, &exposure, &store,
            &events, &cancel, &progress) {
            Ok(calibration) => RunOutcome::Solved(calibration),
            Err(e) if e.code == CanonicalErrorCode::Aborted => {
                info!("calibration run cancelled");
                RunOutcome::Cancelled
            }
            Err(e) => {
                warn!("calibration run failed: {}", e.message);
                RunOutcome::Failed(e.message)
            }
        };
        {
            let mut state = device_state.lock().unwrap();
            if let RunOutcome::Solved(calibration) = &outcome {
                state.calibration = calibration.clone();
            }
            state.calibrating = false;
            state.run = None;
        }
        events.notify(&CalibrationEvent::Completed(outcome));
        run_done.notify_all();
    }

    #[allow(clippy::too_many_arguments)]
    fn run_grid(device_state: &Arc<Mutex<DeviceState>>,
                tracker: &mut dyn Tracker, imager: &SharedImagingDevice,
                exposure: &ExposureConfig,
                store: &Option<SharedCalibrationStore>,
                events: &Arc<ListenerRegistry<CalibrationEvent>>,
                cancel: &Arc<Mutex<bool>>, progress: &Arc<Mutex<(i32, i32)>>)
                -> Result<Calibration, CanonicalError> {
        // Snapshot the policy, step, and the freshly registered calibration;
        // the device lock is released before any device I/O below.
        let (policy, step, pulse_unit, mut calibration) = {
            let state = device_state.lock().unwrap();
            let pulse_unit_ms = state.parameter_or_default(PARAM_PULSE_UNIT_MS)
                .unwrap_or(100.0);
            (state.policy.clone(), grid_step(&state),
             std::time::Duration::from_secs_f64(pulse_unit_ms / 1000.0),
             state.calibration.clone())
        };
        let kind = policy.kind();
        let store_id = calibration.id;
        info!("starting {} calibration, grid step {:.2} units", kind, step);

        let mut driver = policy.probe_driver(pulse_unit)?;
        let t0 = Instant::now();

        // The origin is the first point.
        Self::sample(&mut calibration, tracker, imager, exposure, store,
                     store_id, events, t0, 0.0, 0.0)?;

        for (done, (i, j)) in CELLS.iter().enumerate() {
            let u = *i as f64 * step;
            let v = *j as f64 * step;
            driver.move_to(u, v)?;
            Self::sample(&mut calibration, tracker, imager, exposure, store,
                         store_id, events, t0, u, v)?;
            // Return to origin; the zero-offset sample anchors the
            // regression.
            driver.move_to(0.0, 0.0)?;
            Self::sample(&mut calibration, tracker, imager, exposure, store,
                         store_id, events, t0, 0.0, 0.0)?;

            let cells_done = done as i32 + 1;
            *progress.lock().unwrap() = (cells_done, GRID_CELLS);
            events.notify(&CalibrationEvent::Progress {
                cells_done,
                total_cells: GRID_CELLS,
            });
            if *cancel.lock().unwrap() {
                return Err(aborted_error("cancelled during grid scan"));
            }
        }

        if calibration.points().len() < MIN_RUN_POINTS {
            return Err(failed_precondition_error(
                format!("only {} of {} grid samples succeeded",
                        calibration.points().len(),
                        1 + 2 * GRID_CELLS).as_str()));
        }
        calibration.solve_from_points()?;
        info!("{} calibration solved: scale {:.2} px/unit, angle {:.1} deg, \
               rms {:.2} px",
              kind, calibration.pixel_scale, calibration.angle_deg,
              calibration.fit_rms);
        if let (Some(s), Some(id)) = (store, store_id) {
            s.lock().unwrap().update(id, &calibration)?;
        }
        Ok(calibration)
    }

    // Exposes, locates, and records one sample. A locator failure is
    // skipped (the sample is dropped, the scan continues); device failures
    // propagate.
    #[allow(clippy::too_many_arguments)]
    fn sample(calibration: &mut Calibration, tracker: &mut dyn Tracker,
              imager: &SharedImagingDevice, exposure: &ExposureConfig,
              store: &Option<SharedCalibrationStore>, store_id: Option<i32>,
              events: &Arc<ListenerRegistry<CalibrationEvent>>, t0: Instant,
              u: f64, v: f64) -> Result<(), CanonicalError> {
        let image = capture_frame(imager, exposure)?;
        let position = match tracker.locate(&image) {
            Ok(measured) => measured.position,
            Err(e) if e.code == CanonicalErrorCode::NotFound ||
                e.code == CanonicalErrorCode::OutOfRange => {
                warn!("skipping grid sample at ({:.1}, {:.1}): {}",
                      u, v, e.message);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let point = CalibrationPoint {
            t_secs: t0.elapsed().as_secs_f64(),
            commanded: (u, v),
            position,
        };
        calibration.add_point(point);
        if let (Some(s), Some(id)) = (store, store_id) {
            s.lock().unwrap().add_point(id, &point)?;
        }
        events.notify(&CalibrationEvent::Point(point));
        Ok(())
    }
}

// The grid step, in command units: the explicit `calibration_step`
// parameter if set, otherwise derived from the optics so the probe subtends
// PROBE_SKY_ARCSEC on the sky. Clamped to [MIN_GRID_STEP, MAX_GRID_STEP].
fn grid_step(state: &DeviceState) -> f64 {
    if let Some(step) = state.parameter_or_default(PARAM_CALIBRATION_STEP) {
        return step.clamp(MIN_GRID_STEP, MAX_GRID_STEP);
    }
    let focal_length_mm = state.parameter_or_default(PARAM_FOCAL_LENGTH)
        .unwrap_or(400.0);
    let pixel_size_um = state.parameter_or_default(PARAM_PIXEL_SIZE)
        .unwrap_or(5.0);
    let unit_gain = state.parameter_or_default(PARAM_UNIT_GAIN).unwrap_or(1.0);
    let arcsec_per_px = image_scale_arcsec_per_px(focal_length_mm,
                                                  pixel_size_um);
    let probe_px = PROBE_SKY_ARCSEC / arcsec_per_px;
    (probe_px / unit_gain).clamp(MIN_GRID_STEP, MAX_GRID_STEP)
}

/// Arcseconds of sky per pixel for the given optics; used to report
/// calibration pixel scale in physical units.
pub fn image_scale_arcsec_per_px(focal_length_mm: f64, pixel_size_um: f64)
                                 -> f64 {
    206.265 * pixel_size_um / focal_length_mm
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_image_scale() {
        // 400mm focal length, 5um pixels: ~2.58 arcsec/px.
        assert_abs_diff_eq!(image_scale_arcsec_per_px(400.0, 5.0), 2.578,
                            epsilon = 0.001);
    }
}  // mod tests.
