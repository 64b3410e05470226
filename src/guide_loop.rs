// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::GrayImage;
use log::{error, info, warn};

use crate::abstract_device::{capture_frame, ExposureConfig,
                             SharedImagingDevice};
use crate::calibration::Point;
use crate::control_device::ControlDevice;
use crate::events::ListenerRegistry;
use crate::tracker::Tracker;
use crate::value_stats::{ValueStats, ValueStatsAccumulator};

pub const DEFAULT_GUIDE_INTERVAL: Duration = Duration::from_secs(10);
pub const MIN_GUIDE_INTERVAL: Duration = Duration::from_secs(1);

// Size of the recent window for the incremental offset statistics.
const RECENT_STATS_WINDOW: usize = 100;

/// One completed guide cycle: elapsed time, the measured raw offset
/// (pixels), and the correction command that was applied (command units,
/// summed over the attached devices).
#[derive(Clone, Copy, Debug)]
pub struct TrackingPoint {
    pub t_secs: f64,
    pub raw_offset: Point,
    pub applied_correction: Point,
}

/// Events published synchronously from the guide loop's worker thread.
#[derive(Clone, Debug)]
pub enum GuideEvent {
    Cycle(TrackingPoint),

    /// The cycle's exposure or localization failed; counted, no correction
    /// emitted.
    CycleDropped { t_secs: f64, reason: String },

    /// The loop has exited (after stop_guiding or a fatal device failure).
    Stopped,
}

/// The periodic correction loop, on its own dedicated thread. Per cycle:
/// expose, locate via the tracker, apply corrections through the attached
/// devices in precedence order (fast/closed-loop device first, its residual
/// handed onward), record a TrackingPoint.
pub struct GuideLoop {
    state: Arc<Mutex<LoopState>>,

    // Signalled on stop requests (to cut the inter-cycle sleep short) and
    // when the worker exits.
    wakeup: Arc<Condvar>,
}

struct LoopState {
    interval: Duration,
    stop_request: bool,
    running: bool,
    history: Vec<TrackingPoint>,
    stats: ValueStatsAccumulator,
    dropped_cycles: i64,
    last_image: Option<Arc<GrayImage>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl GuideLoop {
    /// Starts guiding. `devices` are applied in the given order each cycle;
    /// the caller puts the fast/closed-loop device first. `interval` is
    /// floored to MIN_GUIDE_INTERVAL. The first cycle runs immediately.
    pub fn start(devices: Vec<ControlDevice>, tracker: Box<dyn Tracker>,
                 imager: SharedImagingDevice, exposure: ExposureConfig,
                 interval: Duration,
                 events: Arc<ListenerRegistry<GuideEvent>>) -> GuideLoop {
        let interval = interval.max(MIN_GUIDE_INTERVAL);
        let state = Arc::new(Mutex::new(LoopState {
            interval,
            stop_request: false,
            running: true,
            history: Vec::new(),
            stats: ValueStatsAccumulator::new(RECENT_STATS_WINDOW),
            dropped_cycles: 0,
            last_image: None,
            worker: None,
        }));
        let wakeup = Arc::new(Condvar::new());
        let cloned_state = state.clone();
        let cloned_wakeup = wakeup.clone();
        let worker = thread::Builder::new()
            .name("guide-loop".to_string())
            .spawn(move || {
                Self::worker(cloned_state, cloned_wakeup, devices, tracker,
                             imager, exposure, events);
            })
            .expect("failed to spawn guide thread");
        state.lock().unwrap().worker = Some(worker);
        GuideLoop { state, wakeup }
    }

    /// Requests the loop to stop and returns immediately; the worker exits
    /// at its next cycle boundary. An in-flight exposure is never
    /// pre-empted. Idempotent.
    pub fn stop(&self) {
        self.state.lock().unwrap().stop_request = true;
        self.wakeup.notify_all();
    }

    /// Blocks the calling thread until the worker has exited or `timeout`
    /// elapses; returns false on timeout. Never stops the loop itself.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.running {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.wakeup
                .wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().unwrap().interval
    }

    /// Takes effect at the next cycle boundary.
    pub fn set_interval(&self, interval: Duration) {
        self.state.lock().unwrap().interval =
            interval.max(MIN_GUIDE_INTERVAL);
    }

    pub fn most_recent_tracking_point(&self) -> Option<TrackingPoint> {
        self.state.lock().unwrap().history.last().copied()
    }

    pub fn history(&self) -> Vec<TrackingPoint> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn most_recent_image(&self) -> Option<Arc<GrayImage>> {
        self.state.lock().unwrap().last_image.clone()
    }

    /// Incremental summary of raw offset magnitudes.
    pub fn stats(&self) -> ValueStats {
        self.state.lock().unwrap().stats.value_stats.clone()
    }

    pub fn dropped_cycles(&self) -> i64 {
        self.state.lock().unwrap().dropped_cycles
    }

    fn worker(state: Arc<Mutex<LoopState>>, wakeup: Arc<Condvar>,
              devices: Vec<ControlDevice>, mut tracker: Box<dyn Tracker>,
              imager: SharedImagingDevice, exposure: ExposureConfig,
              events: Arc<ListenerRegistry<GuideEvent>>) {
        let t0 = Instant::now();
        let mut next_cycle = Instant::now();
        loop {
            // Idle until the next cycle is due. This is the loop's only
            // cancellation point.
            let interval;
            {
                let mut locked_state = state.lock().unwrap();
                loop {
                    if locked_state.stop_request {
                        break;
                    }
                    let now = Instant::now();
                    if now >= next_cycle {
                        break;
                    }
                    let (guard, _) = wakeup
                        .wait_timeout(locked_state, next_cycle - now).unwrap();
                    locked_state = guard;
                }
                if locked_state.stop_request {
                    info!("stopping guide loop");
                    break;
                }
                interval = locked_state.interval;
            }
            next_cycle = Instant::now() + interval;

            // The exposure runs to completion regardless of stop requests.
            let t_secs = t0.elapsed().as_secs_f64();
            let image = match capture_frame(&imager, &exposure) {
                Ok(image) => image,
                Err(e) => {
                    error!("exposure failed: {}", e.message);
                    Self::drop_cycle(&state, &events, t_secs, e.message);
                    continue;
                }
            };
            state.lock().unwrap().last_image = Some(image.clone());

            let measured = match tracker.locate(&image) {
                Ok(measured) => measured,
                Err(e) => {
                    warn!("tracker lost the star: {}", e.message);
                    Self::drop_cycle(&state, &events, t_secs, e.message);
                    continue;
                }
            };
            // First cycle with no reference target: adopt the current
            // position as the target.
            if tracker.target().is_none() {
                tracker.set_target(measured.position);
            }

            let raw_offset = measured.offset;
            let mut residual = raw_offset;
            let mut applied = Point::zero();
            let mut device_failure = None;
            for device in &devices {
                match device.correct_with_command(residual, interval) {
                    Ok((command, remaining)) => {
                        applied += command;
                        residual = remaining;
                    }
                    Err(e) => {
                        device_failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = device_failure {
                error!("correction failed: {}", e.message);
                Self::drop_cycle(&state, &events, t_secs, e.message);
                continue;
            }

            let point = TrackingPoint {
                t_secs,
                raw_offset,
                applied_correction: applied,
            };
            {
                let mut locked_state = state.lock().unwrap();
                locked_state.history.push(point);
                locked_state.stats.add_value(raw_offset.magnitude());
            }
            events.notify(&GuideEvent::Cycle(point));
        }

        {
            let mut locked_state = state.lock().unwrap();
            locked_state.running = false;
            locked_state.stop_request = false;
            locked_state.worker = None;
        }
        wakeup.notify_all();
        events.notify(&GuideEvent::Stopped);
    }

    fn drop_cycle(state: &Arc<Mutex<LoopState>>,
                  events: &Arc<ListenerRegistry<GuideEvent>>, t_secs: f64,
                  reason: String) {
        state.lock().unwrap().dropped_cycles += 1;
        events.notify(&GuideEvent::CycleDropped { t_secs, reason });
    }
}
