// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use image::GrayImage;
use imageproc::rect::Rect;

use crate::calibration::Point;
use crate::star_locator::StarLocator;

/// One per-cycle measurement of the reference feature.
#[derive(Clone, Copy, Debug)]
pub struct TrackedOffset {
    /// Located position, pixels.
    pub position: Point,

    /// Position minus the reference target; zero if no target is set.
    pub offset: Point,

    /// Locator confidence in [0, 1].
    pub weight: f64,
}

/// The per-cycle algorithm that locates the reference feature and reports
/// its offset from the remembered target.
pub trait Tracker: Send {
    fn locate(&mut self, image: &GrayImage)
              -> Result<TrackedOffset, CanonicalError>;

    fn target(&self) -> Option<Point>;

    fn set_target(&mut self, target: Point);

    /// Locates the feature and adopts its position as the reference target.
    fn acquire(&mut self, image: &GrayImage)
               -> Result<Point, CanonicalError> {
        let measured = self.locate(image)?;
        self.set_target(measured.position);
        Ok(measured.position)
    }
}

/// Standard tracker: a star locator plus a region of interest.
pub struct StarTracker {
    locator: Box<dyn StarLocator>,
    roi: Rect,
    target: Option<Point>,
}

impl StarTracker {
    pub fn new(locator: Box<dyn StarLocator>, roi: Rect) -> Self {
        StarTracker { locator, roi, target: None }
    }
}

impl Tracker for StarTracker {
    fn locate(&mut self, image: &GrayImage)
              -> Result<TrackedOffset, CanonicalError> {
        let fix = self.locator.locate(image, &self.roi)?;
        let offset = match self.target {
            Some(target) => fix.position - target,
            None => Point::zero(),
        };
        Ok(TrackedOffset { position: fix.position, offset, weight: fix.weight })
    }

    fn target(&self) -> Option<Point> {
        self.target
    }

    fn set_target(&mut self, target: Point) {
        self.target = Some(target);
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use crate::star_locator::CentroidLocator;
    use super::*;

    #[test]
    fn test_star_tracker_offset_from_target() {
        let image = GrayImage::from_fn(64, 64, |x, y| {
            let dx = x as f64 - 30.0;
            let dy = y as f64 - 28.0;
            let v = 10.0 + 200.0 * (-(dx * dx + dy * dy) / 8.0).exp();
            image::Luma([v.min(255.0) as u8])
        });
        let mut tracker = StarTracker::new(
            Box::new(CentroidLocator::new()), Rect::at(4, 4).of_size(56, 56));

        // No target yet; offset is zero.
        let measured = tracker.locate(&image).unwrap();
        assert_eq!(measured.offset, Point::zero());
        assert_abs_diff_eq!(measured.position.x, 30.0, epsilon = 0.1);

        tracker.set_target(Point::new(28.0, 28.0));
        let measured = tracker.locate(&image).unwrap();
        assert_abs_diff_eq!(measured.offset.x, 2.0, epsilon = 0.1);
        assert_abs_diff_eq!(measured.offset.y, 0.0, epsilon = 0.1);

        // acquire() re-adopts the current position as the target.
        let acquired = tracker.acquire(&image).unwrap();
        assert_eq!(tracker.target(), Some(acquired));
        let measured = tracker.locate(&image).unwrap();
        assert_eq!(measured.offset, Point::zero());
    }
}  // mod tests.
