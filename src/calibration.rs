// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

use canonical_error::{CanonicalError, failed_precondition_error};
use nalgebra::{DMatrix, DVector};

/// A position in pixel coordinates, or a physical two-axis offset.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    pub fn zero() -> Self {
        Point { x: 0.0, y: 0.0 }
    }

    pub fn magnitude(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point {
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Point {
    type Output = Point;
    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;
    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// The kind of correction actuator a calibration was made for. The set is
/// closed; correction semantics differ materially between the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Timed per-axis activations, open loop, no position feedback.
    Pulse,
    /// Continuous absolute position, fast settle, limited travel.
    TipTilt,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceKind::Pulse => write!(f, "pulse"),
            DeviceKind::TipTilt => write!(f, "tip-tilt"),
        }
    }
}

/// One sample from a calibration grid scan: the commanded per-axis offset (in
/// command units), the elapsed time since the scan started, and where the
/// reference star was observed. Produced only by a calibration run.
#[derive(Clone, Copy, Debug)]
pub struct CalibrationPoint {
    /// Seconds since the start of the calibration run.
    pub t_secs: f64,

    /// Signed commanded offset per axis, in command units.
    pub commanded: (f64, f64),

    /// Observed star position, pixels.
    pub position: Point,
}

// The 2x2 linear submatrix is treated as singular below this determinant
// magnitude.
const DET_EPSILON: f64 = 1e-9;

/// Minimum number of calibration points needed to attempt a solve.
pub const MIN_SOLVE_POINTS: usize = 3;

/// Affine model of the command -> pixel-displacement relation:
///   dx = a0*u + a1*v + a2*t
///   dy = a3*u + a4*v + a5*t
/// where (u, v) is the commanded per-axis offset and t is elapsed seconds
/// (the drift term). Fitted from the points gathered by a calibration run.
#[derive(Clone, Debug)]
pub struct Calibration {
    /// Store-assigned identifier, if the calibration has been persisted.
    pub id: Option<i32>,

    /// The device kind this calibration was made for.
    pub kind: DeviceKind,

    // a0..a5.
    coeffs: [f64; 6],

    // True only after a successful solve with a non-singular 2x2 submatrix.
    complete: bool,

    /// Pixels of star motion per command unit, averaged over the two axes.
    pub pixel_scale: f64,

    /// Direction of the axis1 response on the sensor, degrees.
    pub angle_deg: f64,

    /// True if the axis responses are mirror-imaged (east/west flip).
    pub mirrored: bool,

    /// RMS residual of the fit, pixels. Lower is better.
    pub fit_rms: f64,

    // Audit trail: the points the solve was (or will be) computed from, in
    // the order they were gathered.
    points: Vec<CalibrationPoint>,
}

impl Calibration {
    /// A new empty (incomplete) calibration for `kind`.
    pub fn new(kind: DeviceKind) -> Self {
        Calibration {
            id: None,
            kind,
            coeffs: [0.0; 6],
            complete: false,
            pixel_scale: 0.0,
            angle_deg: 0.0,
            mirrored: false,
            fit_rms: 0.0,
            points: Vec::new(),
        }
    }

    /// A complete calibration from known coefficients, e.g. reloaded from a
    /// calibration store. Fails if the 2x2 submatrix is singular.
    pub fn from_coefficients(kind: DeviceKind, coeffs: [f64; 6])
                             -> Result<Self, CanonicalError> {
        let det = coeffs[0] * coeffs[4] - coeffs[1] * coeffs[3];
        if det.abs() <= DET_EPSILON {
            return Err(failed_precondition_error(
                format!("degenerate calibration: determinant {} too close to zero",
                        det).as_str()));
        }
        let mut cal = Calibration::new(kind);
        cal.coeffs = coeffs;
        cal.set_derived_metadata();
        cal.complete = true;
        Ok(cal)
    }

    pub fn coefficients(&self) -> &[f64; 6] {
        &self.coeffs
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// Appends a grid scan sample. Points arrive in strict scan order.
    pub fn add_point(&mut self, point: CalibrationPoint) {
        self.points.push(point);
    }

    /// Evaluates the affine map forward: the pixel displacement produced by
    /// commanding (u, v) with `t_secs` of elapsed drift.
    pub fn apply(&self, u: f64, v: f64, t_secs: f64) -> Point {
        let a = &self.coeffs;
        Point::new(a[0] * u + a[1] * v + a[2] * t_secs,
                   a[3] * u + a[4] * v + a[5] * t_secs)
    }

    /// Inverts the 2x2 linear subsystem: the command (u, v) that maps to the
    /// given pixel offset. The drift term is ignored at correction time.
    /// To cancel an observed error, command the negation of this result.
    pub fn correct(&self, offset: Point) -> Result<(f64, f64), CanonicalError> {
        if !self.complete {
            return Err(failed_precondition_error(
                "not calibrated: no complete calibration"));
        }
        let a = &self.coeffs;
        let det = a[0] * a[4] - a[1] * a[3];
        if det.abs() <= DET_EPSILON {
            return Err(failed_precondition_error(
                format!("degenerate calibration: determinant {} too close to zero",
                        det).as_str()));
        }
        let u = (a[4] * offset.x - a[1] * offset.y) / det;
        let v = (-a[3] * offset.x + a[0] * offset.y) / det;
        Ok((u, v))
    }

    /// Fits the six coefficients to the gathered points: two independent
    /// ordinary-least-squares regressions, dx ~ (u, v, t) and dy ~ (u, v, t).
    /// Displacements are measured relative to the first zero-offset point
    /// (the scan origin). On success the calibration becomes complete.
    pub fn solve_from_points(&mut self) -> Result<(), CanonicalError> {
        let n = self.points.len();
        if n < MIN_SOLVE_POINTS {
            return Err(failed_precondition_error(
                format!("need at least {} calibration points, have {}",
                        MIN_SOLVE_POINTS, n).as_str()));
        }
        let origin = self.points.iter()
            .find(|p| p.commanded == (0.0, 0.0))
            .unwrap_or(&self.points[0])
            .position;

        let design = DMatrix::from_fn(n, 3, |r, c| {
            let p = &self.points[r];
            match c {
                0 => p.commanded.0,
                1 => p.commanded.1,
                _ => p.t_secs,
            }
        });
        let dx = DVector::from_iterator(
            n, self.points.iter().map(|p| p.position.x - origin.x));
        let dy = DVector::from_iterator(
            n, self.points.iter().map(|p| p.position.y - origin.y));

        let svd = design.svd(true, true);
        let sol_x = svd.solve(&dx, 1e-12).map_err(|e| {
            failed_precondition_error(
                format!("calibration solve failed: {}", e).as_str())
        })?;
        let sol_y = svd.solve(&dy, 1e-12).map_err(|e| {
            failed_precondition_error(
                format!("calibration solve failed: {}", e).as_str())
        })?;

        let coeffs = [sol_x[0], sol_x[1], sol_x[2],
                      sol_y[0], sol_y[1], sol_y[2]];
        let det = coeffs[0] * coeffs[4] - coeffs[1] * coeffs[3];
        if det.abs() <= DET_EPSILON {
            return Err(failed_precondition_error(
                format!("degenerate calibration: determinant {} too close to zero",
                        det).as_str()));
        }
        self.coeffs = coeffs;
        self.set_derived_metadata();

        let mut sum_sq = 0.0;
        for p in &self.points {
            let predicted = self.apply(p.commanded.0, p.commanded.1, p.t_secs);
            let residual = (p.position - origin) - predicted;
            sum_sq += residual.magnitude() * residual.magnitude();
        }
        self.fit_rms = (sum_sq / n as f64).sqrt();
        self.complete = true;
        Ok(())
    }

    fn set_derived_metadata(&mut self) {
        let a = &self.coeffs;
        let scale1 = a[0].hypot(a[3]);
        let scale2 = a[1].hypot(a[4]);
        self.pixel_scale = 0.5 * (scale1 + scale2);
        self.angle_deg = a[3].atan2(a[0]).to_degrees();
        self.mirrored = a[0] * a[4] - a[1] * a[3] < 0.0;
    }
}

// mod tests.
