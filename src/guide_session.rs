// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, not_found_error};
use image::GrayImage;
use log::info;

use crate::abstract_device::{ExposureConfig, SharedCalibrationStore,
                             SharedImagingDevice};
use crate::calibration::{Calibration, DeviceKind, Point};
use crate::calibration_run::{CalibrationEvent, GRID_CELLS, RunOutcome};
use crate::control_device::ControlDevice;
use crate::events::ListenerRegistry;
use crate::guide_loop::{DEFAULT_GUIDE_INTERVAL, GuideEvent, GuideLoop,
                        TrackingPoint};
use crate::tracker::Tracker;
use crate::value_stats::ValueStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No devices attached yet.
    Unconfigured,

    /// Configured, no usable calibration.
    Idle,

    /// A calibration grid scan is running.
    Calibrating,

    /// At least one device holds a complete calibration.
    Calibrated,

    /// The guide loop is running.
    Guiding,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Top-level facade and state machine. Owns the control devices and
/// whichever background process (calibration run or guide loop) is active;
/// all queries remain callable concurrently with an active background
/// process.
///
/// Legal transitions; any other (state, operation) pair fails BadState:
///   Unconfigured -> Idle          configure()
///   Idle -> Calibrating           start_calibration()
///   Calibrating -> Calibrated     (run solved)
///   Calibrating -> Idle           (run cancelled or failed)
///   Calibrated -> Guiding         start_guiding()
///   Guiding -> Calibrated         stop_guiding()
///   Calibrated|Guiding -> Calibrating   start_calibration() (re-calibrate)
///   Idle|Calibrated -> Calibrated use_calibration()
pub struct GuidingSession {
    inner: Arc<Mutex<SessionInner>>,
    calibration_events: Arc<ListenerRegistry<CalibrationEvent>>,
    guide_events: Arc<ListenerRegistry<GuideEvent>>,
}

struct SessionInner {
    state: SessionState,
    imager: Option<SharedImagingDevice>,
    exposure: ExposureConfig,
    store: Option<SharedCalibrationStore>,

    // Fast/closed-loop devices first; guide corrections are applied in
    // this order, each device handing its residual to the next.
    devices: Vec<ControlDevice>,

    // Reference position the guide loop steers toward. Applied to the
    // tracker when a background process starts.
    target: Option<Point>,

    calibrating_kind: Option<DeviceKind>,

    // Retained after stop_guiding so history queries keep working until
    // the next start_guiding.
    guide_loop: Option<Arc<GuideLoop>>,
}

impl GuidingSession {
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(SessionInner {
            state: SessionState::Unconfigured,
            imager: None,
            exposure: ExposureConfig::default(),
            store: None,
            devices: Vec::new(),
            target: None,
            calibrating_kind: None,
            guide_loop: None,
        }));
        let calibration_events = Arc::new(ListenerRegistry::new());

        // The session observes run completion to drive the
        // Calibrating -> Calibrated/Idle transition. The worker delivers
        // Completed after the device has reached its terminal state.
        let inner_clone = inner.clone();
        calibration_events.register(Box::new(move |event: &CalibrationEvent| {
            if let CalibrationEvent::Completed(outcome) = event {
                let mut inner = inner_clone.lock().unwrap();
                if inner.state != SessionState::Calibrating {
                    return;
                }
                inner.state = match outcome {
                    RunOutcome::Solved(_) => SessionState::Calibrated,
                    RunOutcome::Cancelled | RunOutcome::Failed(_) => {
                        SessionState::Idle
                    }
                };
                inner.calibrating_kind = None;
                info!("calibration run finished; session now {}", inner.state);
            }
        }));

        GuidingSession {
            inner,
            calibration_events,
            guide_events: Arc::new(ListenerRegistry::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// Attaches the imaging device, at least one control device, and
    /// optionally a calibration store. Unconfigured -> Idle.
    pub fn configure(&self, imager: SharedImagingDevice,
                     devices: Vec<ControlDevice>,
                     store: Option<SharedCalibrationStore>)
                     -> Result<(), CanonicalError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Unconfigured {
            return Err(bad_state("configure", inner.state));
        }
        if devices.is_empty() {
            return Err(invalid_argument_error(
                "at least one control device is required"));
        }
        let mut devices = devices;
        // Fast/closed-loop devices take correction precedence.
        devices.sort_by_key(|d| d.kind() != DeviceKind::TipTilt);
        inner.imager = Some(imager);
        inner.devices = devices;
        inner.store = store;
        inner.state = SessionState::Idle;
        Ok(())
    }

    pub fn exposure(&self) -> ExposureConfig {
        self.inner.lock().unwrap().exposure
    }

    pub fn set_exposure(&self, exposure: ExposureConfig) {
        self.inner.lock().unwrap().exposure = exposure;
    }

    /// The reference position guiding steers toward. Applied to the
    /// tracker when the next background process starts.
    pub fn target(&self) -> Option<Point> {
        self.inner.lock().unwrap().target
    }

    pub fn set_target(&self, target: Point) {
        self.inner.lock().unwrap().target = Some(target);
    }

    /// Correction precedence: the order in which the attached devices are
    /// applied each guide cycle, fast/closed-loop devices first.
    pub fn device_order(&self) -> Vec<DeviceKind> {
        self.inner.lock().unwrap().devices.iter()
            .map(|d| d.kind())
            .collect()
    }

    /// The current calibration of the device of the given kind (possibly
    /// incomplete). Fails if no such device is attached.
    pub fn calibration(&self, kind: DeviceKind)
                       -> Result<Calibration, CanonicalError> {
        let device = self.device_of_kind(kind)?;
        Ok(device.calibration())
    }

    /// Loads a stored calibration and installs it on the matching device,
    /// bypassing the grid scan. Idle|Calibrated -> Calibrated.
    pub fn use_calibration(&self, id: i32) -> Result<(), CanonicalError> {
        let (store, devices) = {
            let inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::Idle | SessionState::Calibrated => {}
                state => return Err(bad_state("use_calibration", state)),
            }
            let store = inner.store.clone().ok_or_else(|| {
                failed_precondition_error("no calibration store attached")
            })?;
            (store, inner.devices.clone())
        };
        let calibration = store.lock().unwrap().get(id, None)?;
        let device = devices.iter()
            .find(|d| d.kind() == calibration.kind)
            .ok_or_else(|| not_found_error(
                format!("no {} device attached", calibration.kind).as_str()))?;
        device.install_calibration(calibration)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Idle {
            inner.state = SessionState::Calibrated;
        }
        Ok(())
    }

    /// Starts a calibration grid scan for the device of the given kind;
    /// returns the store-assigned id when a store is attached.
    /// Idle|Calibrated|Guiding -> Calibrating; guiding is stopped first.
    pub fn start_calibration(&self, kind: DeviceKind,
                             mut tracker: Box<dyn Tracker>)
                             -> Result<Option<i32>, CanonicalError> {
        let (device, imager, exposure, store, target, prev_state,
             loop_to_stop);
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::Idle | SessionState::Calibrated |
                SessionState::Guiding => {}
                state => return Err(bad_state("start_calibration", state)),
            }
            device = inner.find_device(kind)?;
            if device.is_calibrating() {
                return Err(failed_precondition_error(
                    format!("bad state: {} calibration already running",
                            kind).as_str()));
            }
            loop_to_stop = if inner.state == SessionState::Guiding {
                inner.guide_loop.take()
            } else {
                None
            };
            prev_state = inner.state;
            inner.state = SessionState::Calibrating;
            inner.calibrating_kind = Some(kind);
            imager = inner.imager.clone().unwrap();
            exposure = inner.exposure;
            store = inner.store.clone();
            target = inner.target;
        }
        // Blocking work happens outside the session lock.
        if let Some(guide_loop) = loop_to_stop {
            guide_loop.stop();
            guide_loop.wait(Duration::from_secs(60));
        }
        if let Some(target) = target {
            tracker.set_target(target);
        }
        let result = device.start_calibration(
            tracker, imager, exposure, store,
            self.calibration_events.clone());
        if result.is_err() {
            let mut inner = self.inner.lock().unwrap();
            // The guide loop, if one was running, has already been stopped
            // and cannot be resumed; the session falls back to Calibrated.
            inner.state = if prev_state == SessionState::Guiding {
                SessionState::Calibrated
            } else {
                prev_state
            };
            inner.calibrating_kind = None;
        }
        result
    }

    /// Requests cancellation of the active calibration run and returns
    /// immediately; the session transitions to Idle once the run has
    /// stopped. Idempotent no-op when nothing is calibrating.
    pub fn cancel_calibration(&self) {
        let device = {
            let inner = self.inner.lock().unwrap();
            match inner.calibrating_kind {
                Some(kind) => inner.devices.iter()
                    .find(|d| d.kind() == kind).cloned(),
                None => None,
            }
        };
        if let Some(device) = device {
            device.cancel_calibration();
        }
    }

    /// Blocks until the active calibration run reaches a terminal state or
    /// `timeout` elapses; never cancels on timeout. True immediately if
    /// nothing is calibrating.
    pub fn wait_calibration(&self, timeout: Duration) -> bool {
        let device = {
            let inner = self.inner.lock().unwrap();
            match inner.calibrating_kind {
                Some(kind) => inner.devices.iter()
                    .find(|d| d.kind() == kind).cloned(),
                None => None,
            }
        };
        match device {
            Some(device) => device.wait_calibration(timeout),
            None => true,
        }
    }

    /// (cells done, total cells) of the active grid scan.
    pub fn calibration_progress(&self) -> (i32, i32) {
        let device = {
            let inner = self.inner.lock().unwrap();
            match inner.calibrating_kind {
                Some(kind) => inner.devices.iter()
                    .find(|d| d.kind() == kind).cloned(),
                None => None,
            }
        };
        match device {
            Some(device) => device.calibration_progress(),
            None => (0, GRID_CELLS),
        }
    }

    /// Starts the guide loop over every device holding a complete
    /// calibration. Calibrated -> Guiding.
    pub fn start_guiding(&self, mut tracker: Box<dyn Tracker>,
                         interval: Option<Duration>)
                         -> Result<(), CanonicalError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Calibrated {
            return Err(bad_state("start_guiding", inner.state));
        }
        let calibrated: Vec<ControlDevice> = inner.devices.iter()
            .filter(|d| d.is_calibrated())
            .cloned()
            .collect();
        if calibrated.is_empty() {
            return Err(failed_precondition_error(
                "not calibrated: no device holds a complete calibration"));
        }
        if let Some(target) = inner.target {
            tracker.set_target(target);
        }
        let guide_loop = GuideLoop::start(
            calibrated, tracker, inner.imager.clone().unwrap(),
            inner.exposure, interval.unwrap_or(DEFAULT_GUIDE_INTERVAL),
            self.guide_events.clone());
        inner.guide_loop = Some(Arc::new(guide_loop));
        inner.state = SessionState::Guiding;
        Ok(())
    }

    /// Stops the guide loop and returns immediately; the worker exits at
    /// its next cycle boundary. Guiding -> Calibrated. Idempotent no-op
    /// when not guiding.
    pub fn stop_guiding(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Guiding {
            return;
        }
        if let Some(guide_loop) = &inner.guide_loop {
            guide_loop.stop();
        }
        inner.state = SessionState::Calibrated;
    }

    /// Blocks until the guide loop's worker has exited or `timeout`
    /// elapses; true immediately if no loop was ever started.
    pub fn wait_guiding(&self, timeout: Duration) -> bool {
        let guide_loop = self.inner.lock().unwrap().guide_loop.clone();
        match guide_loop {
            Some(guide_loop) => guide_loop.wait(timeout),
            None => true,
        }
    }

    pub fn guide_interval(&self) -> Duration {
        match self.inner.lock().unwrap().guide_loop.as_ref() {
            Some(guide_loop) => guide_loop.interval(),
            None => DEFAULT_GUIDE_INTERVAL,
        }
    }

    /// Takes effect at the guide loop's next cycle boundary.
    pub fn set_guide_interval(&self, interval: Duration) {
        if let Some(guide_loop) =
            self.inner.lock().unwrap().guide_loop.as_ref()
        {
            guide_loop.set_interval(interval);
        }
    }

    /// Cycles dropped by the guide loop due to exposure, localization, or
    /// device failures.
    pub fn guide_dropped_cycles(&self) -> i64 {
        self.inner.lock().unwrap().guide_loop.as_ref()
            .map(|l| l.dropped_cycles())
            .unwrap_or(0)
    }

    /// The most recently completed guide exposure, if any.
    pub fn most_recent_image(&self) -> Option<Arc<GrayImage>> {
        self.inner.lock().unwrap().guide_loop.as_ref()
            .and_then(|l| l.most_recent_image())
    }

    pub fn most_recent_tracking_point(&self) -> Option<TrackingPoint> {
        self.inner.lock().unwrap().guide_loop.as_ref()
            .and_then(|l| l.most_recent_tracking_point())
    }

    pub fn tracking_history(&self) -> Vec<TrackingPoint> {
        self.inner.lock().unwrap().guide_loop.as_ref()
            .map(|l| l.history())
            .unwrap_or_default()
    }

    /// Incremental summary (count, RMS, descriptive stats) of the guide
    /// run's raw offset magnitudes.
    pub fn tracking_stats(&self) -> ValueStats {
        self.inner.lock().unwrap().guide_loop.as_ref()
            .map(|l| l.stats())
            .unwrap_or_default()
    }

    pub fn register_calibration_callback(
        &self, callback: Box<dyn Fn(&CalibrationEvent) + Send>) -> i32 {
        self.calibration_events.register(callback)
    }

    pub fn unregister_calibration_callback(&self, id: i32) -> bool {
        self.calibration_events.unregister(id)
    }

    pub fn register_guide_callback(
        &self, callback: Box<dyn Fn(&GuideEvent) + Send>) -> i32 {
        self.guide_events.register(callback)
    }

    pub fn unregister_guide_callback(&self, id: i32) -> bool {
        self.guide_events.unregister(id)
    }

    fn device_of_kind(&self, kind: DeviceKind)
                      -> Result<ControlDevice, CanonicalError> {
        self.inner.lock().unwrap().find_device(kind)
    }
}

impl Default for GuidingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionInner {
    fn find_device(&self, kind: DeviceKind)
                   -> Result<ControlDevice, CanonicalError> {
        self.devices.iter()
            .find(|d| d.kind() == kind)
            .cloned()
            .ok_or_else(|| not_found_error(
                format!("no {} device attached", kind).as_str()))
    }
}

fn bad_state(operation: &str, state: SessionState) -> CanonicalError {
    failed_precondition_error(
        format!("bad state: {} not allowed in {}", operation, state).as_str())
}
