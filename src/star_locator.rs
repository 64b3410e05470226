// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, invalid_argument_error, not_found_error,
                      out_of_range_error};
use image::GrayImage;
use imageproc::drawing::{draw_cross_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use log::debug;
use medians::Medianf64;
use rustfft::{FftPlanner, num_complex::Complex};

use crate::calibration::Point;

/// A located reference feature: subpixel position (full-image coordinates),
/// the estimated background level, and a confidence weight in [0, 1].
#[derive(Debug)]
pub struct StarFix {
    pub position: Point,
    pub background: f64,
    pub weight: f64,

    /// Optional diagnostic overlay (ROI crop with the fix marked). Produced
    /// only when the locator is configured to do so.
    pub diagnostic: Option<GrayImage>,
}

/// Locates a reference feature in a luminance image within a region of
/// interest.
pub trait StarLocator: Send {
    fn locate(&self, image: &GrayImage, roi: &Rect)
              -> Result<StarFix, CanonicalError>;
}

// A star closer than this to the image border cannot be measured.
const BORDER_MARGIN: i32 = 3;

/// Background-subtracted intensity-weighted centroiding. Good for point-like
/// stars with adequate SNR.
pub struct CentroidLocator {
    /// Neighborhood radius for the hot/defective pixel outlier test.
    pub hot_pixel_radius: i32,

    /// A pixel exceeding its neighborhood mean by this many standard
    /// deviations is treated as defective and interpolated away.
    pub hot_pixel_sigma: f64,

    /// Upper bound for the half-maximum ring scan, pixels.
    pub max_radius: i32,

    /// Floor for the estimated star radius, pixels.
    pub min_radius: i32,

    /// The centroid is computed over a window of half-size
    /// `window_multiplier * radius`.
    pub window_multiplier: f64,

    /// Minimum (peak - background) / noise for a detection.
    pub snr_threshold: f64,

    /// If true, each fix carries a diagnostic overlay image.
    pub make_diagnostic: bool,
}

impl Default for CentroidLocator {
    fn default() -> Self {
        CentroidLocator {
            hot_pixel_radius: 2,
            hot_pixel_sigma: 5.0,
            max_radius: 20,
            min_radius: 5,
            window_multiplier: 1.5,
            snr_threshold: 4.0,
            make_diagnostic: false,
        }
    }
}

impl CentroidLocator {
    pub fn new() -> Self {
        Default::default()
    }
}

// ROI pixel values copied out for processing. Pixels inside the ROI are read
// from the (hot-pixel-interpolated) buffer; pixels outside fall back to the
// raw image.
struct RoiBuffer<'a> {
    image: &'a GrayImage,
    roi: Rect,
    values: Vec<f64>,
}

impl<'a> RoiBuffer<'a> {
    fn new(image: &'a GrayImage, roi: Rect) -> Self {
        let w = roi.width() as usize;
        let h = roi.height() as usize;
        let mut values = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                let px = image.get_pixel(roi.left() as u32 + x as u32,
                                         roi.top() as u32 + y as u32);
                values.push(px.0[0] as f64);
            }
        }
        RoiBuffer { image, roi, values }
    }

    fn width(&self) -> i32 {
        self.roi.width() as i32
    }

    fn height(&self) -> i32 {
        self.roi.height() as i32
    }

    // (x, y) relative to the ROI origin; must be in bounds.
    fn at(&self, x: i32, y: i32) -> f64 {
        self.values[(y * self.width() + x) as usize]
    }

    // (x, y) in full-image coordinates; must be within the image.
    fn sample(&self, x: i32, y: i32) -> f64 {
        let rx = x - self.roi.left();
        let ry = y - self.roi.top();
        if rx >= 0 && rx < self.width() && ry >= 0 && ry < self.height() {
            self.at(rx, ry)
        } else {
            self.image.get_pixel(x as u32, y as u32).0[0] as f64
        }
    }

    // Replaces local outliers (hot/defective pixels) with their neighborhood
    // mean.
    fn interpolate_hot_pixels(&mut self, radius: i32, sigma: f64) {
        let (w, h) = (self.width(), self.height());
        let mut out = self.values.clone();
        for y in 0..h {
            for x in 0..w {
                let mut sum = 0.0;
                let mut sum_sq = 0.0;
                let mut count = 0;
                for ny in (y - radius).max(0)..=(y + radius).min(h - 1) {
                    for nx in (x - radius).max(0)..=(x + radius).min(w - 1) {
                        if nx == x && ny == y {
                            continue;
                        }
                        let v = self.at(nx, ny);
                        sum += v;
                        sum_sq += v * v;
                        count += 1;
                    }
                }
                if count < 2 {
                    continue;
                }
                let mean = sum / count as f64;
                let var = (sum_sq / count as f64 - mean * mean).max(0.0);
                let stddev = var.sqrt().max(1.0);
                if self.at(x, y) > mean + sigma * stddev {
                    out[(y * w + x) as usize] = mean;
                }
            }
        }
        self.values = out;
    }

    // Center-weighted 3x3 value; rejects single-pixel spikes during coarse
    // localization. (x, y) must be interior to the ROI.
    fn center_weighted(&self, x: i32, y: i32) -> f64 {
        let mut sum = 0.0;
        const KERNEL: [f64; 9] = [1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0];
        for dy in -1..=1_i32 {
            for dx in -1..=1_i32 {
                let k = KERNEL[((dy + 1) * 3 + dx + 1) as usize];
                sum += k * self.at(x + dx, y + dy);
            }
        }
        sum / 16.0
    }
}

impl StarLocator for CentroidLocator {
    fn locate(&self, image: &GrayImage, roi: &Rect)
              -> Result<StarFix, CanonicalError> {
        let (img_w, img_h) = image.dimensions();
        let image_rect = Rect::at(0, 0).of_size(img_w, img_h);
        let roi = roi.intersect(image_rect).ok_or_else(|| {
            invalid_argument_error("ROI does not intersect the image")
        })?;
        if roi.width() < 7 || roi.height() < 7 {
            return Err(invalid_argument_error(
                format!("ROI {}x{} too small", roi.width(), roi.height())
                    .as_str()));
        }

        let mut buffer = RoiBuffer::new(image, roi);
        buffer.interpolate_hot_pixels(self.hot_pixel_radius,
                                      self.hot_pixel_sigma);

        let background = buffer.values.medf_unchecked();
        let noise = (buffer.values.madf(background) * 1.4826).max(0.5);

        // Coarse localization: pixel of highest center-weighted value.
        let mut peak = f64::MIN;
        let mut peak_x = 1;
        let mut peak_y = 1;
        for y in 1..buffer.height() - 1 {
            for x in 1..buffer.width() - 1 {
                let v = buffer.center_weighted(x, y);
                if v > peak {
                    peak = v;
                    peak_x = x;
                    peak_y = y;
                }
            }
        }
        let snr = (peak - background) / noise;
        if snr < self.snr_threshold {
            return Err(not_found_error(
                format!("no star: peak SNR {:.1} below threshold {:.1}",
                        snr, self.snr_threshold).as_str()));
        }

        // Candidate in full-image coordinates.
        let cx = roi.left() + peak_x;
        let cy = roi.top() + peak_y;
        let border_distance = cx.min(cy)
            .min(img_w as i32 - 1 - cx)
            .min(img_h as i32 - 1 - cy);
        if border_distance < BORDER_MARGIN {
            return Err(out_of_range_error(
                format!("insufficient margin: star within {} px of image edge",
                        border_distance).as_str()));
        }

        // Estimate the star's half-maximum radius by scanning rings outward
        // from the candidate. The radius is the outermost ring still
        // exceeding half the peak value, bounded by `max_radius` and by the
        // distance to the image border.
        let half_max = background + 0.5 * (peak - background);
        let scan_limit = self.max_radius.min(border_distance);
        let mut radius = 1;
        for r in 1..=scan_limit {
            let mut ring_max = f64::MIN;
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx.abs() != r && dy.abs() != r {
                        continue;  // Interior, not on the ring.
                    }
                    ring_max = ring_max.max(buffer.sample(cx + dx, cy + dy));
                }
            }
            if ring_max > half_max {
                radius = r;
            }
        }
        radius = radius.max(self.min_radius);

        // Background-subtracted intensity-weighted centroid over
        // `window_multiplier * radius` around the candidate.
        let half_window = (self.window_multiplier * radius as f64).ceil() as i32;
        if cx - half_window < 0 || cy - half_window < 0 ||
            cx + half_window >= img_w as i32 || cy + half_window >= img_h as i32
        {
            return Err(out_of_range_error(
                format!("insufficient margin: {} px centroid window \
                         extends outside the image", half_window).as_str()));
        }
        let mut flux = 0.0;
        let mut moment_x = 0.0;
        let mut moment_y = 0.0;
        for y in cy - half_window..=cy + half_window {
            for x in cx - half_window..=cx + half_window {
                let v = (buffer.sample(x, y) - background).max(0.0);
                flux += v;
                moment_x += v * x as f64;
                moment_y += v * y as f64;
            }
        }
        if flux <= 0.0 {
            return Err(not_found_error("no star: zero flux above background"));
        }
        let position = Point::new(moment_x / flux, moment_y / flux);
        debug!("centroid at {} snr {:.1} radius {}", position, snr, radius);

        let diagnostic = if self.make_diagnostic {
            Some(draw_fix_overlay(image, &roi, position, half_window))
        } else {
            None
        };
        Ok(StarFix { position, background, weight: 1.0, diagnostic })
    }
}

// ROI crop with the centroid window and fix position marked.
fn draw_fix_overlay(image: &GrayImage, roi: &Rect, position: Point,
                    half_window: i32) -> GrayImage {
    let mut overlay = image::imageops::crop_imm(
        image, roi.left() as u32, roi.top() as u32,
        roi.width(), roi.height()).to_image();
    let fx = position.x as i32 - roi.left();
    let fy = position.y as i32 - roi.top();
    let window = Rect::at(fx - half_window, fy - half_window)
        .of_size((2 * half_window + 1) as u32, (2 * half_window + 1) as u32);
    draw_hollow_rect_mut(&mut overlay, window, image::Luma([255u8]));
    draw_cross_mut(&mut overlay, image::Luma([255u8]), fx, fy);
    overlay
}

/// Normalized frequency-domain cross-correlation against a stored reference
/// window. Preferred for extended or noisy targets where centroiding is
/// unreliable. The fix position is the reference position displaced by the
/// measured shift; the weight reflects correlation peak sharpness.
pub struct PhaseCorrelationLocator {
    width: usize,
    height: usize,
    reference_position: Point,
    // Precomputed forward FFT of the mean-subtracted reference window.
    reference_spectrum: Vec<Complex<f64>>,

    /// Minimum correlation peak sharpness, in standard deviations above the
    /// surface mean, for a detection.
    pub min_sharpness: f64,
}

impl PhaseCorrelationLocator {
    /// `reference_position` is the known subpixel position of the target
    /// feature within `reference` (full-image coordinates).
    pub fn new(reference: &GrayImage, roi: &Rect, reference_position: Point)
               -> Result<Self, CanonicalError> {
        let mut window = extract_window(reference, roi)?;
        let width = roi.width() as usize;
        let height = roi.height() as usize;
        let mut planner = FftPlanner::new();
        fft_2d(&mut window, width, height, &mut planner, /*inverse=*/false);
        Ok(PhaseCorrelationLocator {
            width,
            height,
            reference_position,
            reference_spectrum: window,
            min_sharpness: 5.0,
        })
    }
}

impl StarLocator for PhaseCorrelationLocator {
    fn locate(&self, image: &GrayImage, roi: &Rect)
              -> Result<StarFix, CanonicalError> {
        if roi.width() as usize != self.width ||
            roi.height() as usize != self.height
        {
            return Err(invalid_argument_error(
                format!("ROI {}x{} does not match reference window {}x{}",
                        roi.width(), roi.height(),
                        self.width, self.height).as_str()));
        }
        let mut window = extract_window(image, roi)?;
        let background = window_mean(image, roi);
        let mut planner = FftPlanner::new();
        fft_2d(&mut window, self.width, self.height, &mut planner,
               /*inverse=*/false);

        // Normalized cross-power spectrum; whitening makes the inverse
        // transform a sharp delta at the displacement.
        let mut cross: Vec<Complex<f64>> = self.reference_spectrum.iter()
            .zip(window.iter())
            .map(|(r, n)| {
                let c = r.conj() * n;
                let norm = c.norm();
                if norm > 1e-12 { c / norm } else { Complex::new(0.0, 0.0) }
            })
            .collect();
        fft_2d(&mut cross, self.width, self.height, &mut planner,
               /*inverse=*/true);
        let surface: Vec<f64> = cross.iter().map(|c| c.norm()).collect();

        let (mut peak_idx, mut peak_val) = (0, f64::MIN);
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for (i, &v) in surface.iter().enumerate() {
            if v > peak_val {
                peak_val = v;
                peak_idx = i;
            }
            sum += v;
            sum_sq += v * v;
        }
        let n = surface.len() as f64;
        let mean = sum / n;
        let stddev = (sum_sq / n - mean * mean).max(0.0).sqrt().max(1e-12);
        let sharpness = (peak_val - mean) / stddev;
        if sharpness < self.min_sharpness {
            return Err(not_found_error(
                format!("no star: correlation peak sharpness {:.1} below \
                         threshold {:.1}",
                        sharpness, self.min_sharpness).as_str()));
        }

        let px = peak_idx % self.width;
        let py = peak_idx / self.width;
        let sub_x = parabolic_offset(
            surface[py * self.width + (px + self.width - 1) % self.width],
            peak_val,
            surface[py * self.width + (px + 1) % self.width]);
        let sub_y = parabolic_offset(
            surface[((py + self.height - 1) % self.height) * self.width + px],
            peak_val,
            surface[((py + 1) % self.height) * self.width + px]);
        let shift_x = wrap_shift(px, self.width) + sub_x;
        let shift_y = wrap_shift(py, self.height) + sub_y;
        debug!("phase correlation shift ({:.2}, {:.2}) sharpness {:.1}",
               shift_x, shift_y, sharpness);

        let weight = (1.0 - self.min_sharpness / sharpness).clamp(0.0, 1.0);
        Ok(StarFix {
            position: self.reference_position + Point::new(shift_x, shift_y),
            background,
            weight,
            diagnostic: None,
        })
    }
}

// Mean-subtracted ROI pixels as complex values, row-major.
fn extract_window(image: &GrayImage, roi: &Rect)
                  -> Result<Vec<Complex<f64>>, CanonicalError> {
    let (img_w, img_h) = image.dimensions();
    if roi.left() < 0 || roi.top() < 0 ||
        roi.right() >= img_w as i32 || roi.bottom() >= img_h as i32
    {
        return Err(invalid_argument_error(
            "correlation ROI extends outside the image"));
    }
    let mean = window_mean(image, roi);
    let mut window = Vec::with_capacity(
        (roi.width() * roi.height()) as usize);
    for y in 0..roi.height() {
        for x in 0..roi.width() {
            let v = image.get_pixel(roi.left() as u32 + x,
                                    roi.top() as u32 + y).0[0] as f64;
            window.push(Complex::new(v - mean, 0.0));
        }
    }
    Ok(window)
}

fn window_mean(image: &GrayImage, roi: &Rect) -> f64 {
    let mut sum = 0.0;
    for y in 0..roi.height() {
        for x in 0..roi.width() {
            sum += image.get_pixel(roi.left() as u32 + x,
                                   roi.top() as u32 + y).0[0] as f64;
        }
    }
    sum / (roi.width() * roi.height()) as f64
}

// In-place 2-D FFT: rows, then columns via transpose.
fn fft_2d(data: &mut [Complex<f64>], width: usize, height: usize,
          planner: &mut FftPlanner<f64>, inverse: bool) {
    let row_fft = if inverse {
        planner.plan_fft_inverse(width)
    } else {
        planner.plan_fft_forward(width)
    };
    for row in data.chunks_exact_mut(width) {
        row_fft.process(row);
    }
    let mut transposed = vec![Complex::new(0.0, 0.0); data.len()];
    for y in 0..height {
        for x in 0..width {
            transposed[x * height + y] = data[y * width + x];
        }
    }
    let col_fft = if inverse {
        planner.plan_fft_inverse(height)
    } else {
        planner.plan_fft_forward(height)
    };
    for col in transposed.chunks_exact_mut(height) {
        col_fft.process(col);
    }
    for y in 0..height {
        for x in 0..width {
            data[y * width + x] = transposed[x * height + y];
        }
    }
}

// Subpixel vertex of the parabola through three samples centered on the peak.
fn parabolic_offset(left: f64, center: f64, right: f64) -> f64 {
    let denom = left - 2.0 * center + right;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

// Converts a correlation surface index to a signed shift.
fn wrap_shift(index: usize, size: usize) -> f64 {
    if index > size / 2 {
        index as f64 - size as f64
    } else {
        index as f64
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;
    use super::*;

    // Renders a Gaussian star onto a flat background.
    fn render_star(width: u32, height: u32, center: Point, amplitude: f64,
                   sigma: f64, background: u8) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let dx = x as f64 - center.x;
            let dy = y as f64 - center.y;
            let r_sq = dx * dx + dy * dy;
            let v = background as f64 +
                amplitude * (-r_sq / (2.0 * sigma * sigma)).exp();
            image::Luma([v.min(255.0) as u8])
        })
    }

    #[test]
    fn test_centroid_subpixel_accuracy() {
        let center = Point::new(32.4, 30.6);
        let image = render_star(64, 64, center, 200.0, 2.0, 10);
        let locator = CentroidLocator::new();
        let roi = Rect::at(8, 8).of_size(48, 48);
        let fix = locator.locate(&image, &roi).unwrap();
        assert_abs_diff_eq!(fix.position.x, center.x, epsilon = 0.1);
        assert_abs_diff_eq!(fix.position.y, center.y, epsilon = 0.1);
        assert_abs_diff_eq!(fix.background, 10.0, epsilon = 2.0);
    }

    #[test]
    fn test_centroid_tolerates_pixel_noise() {
        use rand::{Rng, SeedableRng};
        use rand::rngs::StdRng;

        let center = Point::new(32.4, 30.6);
        let mut image = render_star(64, 64, center, 200.0, 2.0, 10);
        let mut rng = StdRng::seed_from_u64(7);
        for pixel in image.pixels_mut() {
            let v = pixel.0[0] as i32 + rng.gen_range(-3..=3);
            pixel.0[0] = v.clamp(0, 255) as u8;
        }
        let locator = CentroidLocator::new();
        let roi = Rect::at(8, 8).of_size(48, 48);
        let fix = locator.locate(&image, &roi).unwrap();
        assert_abs_diff_eq!(fix.position.x, center.x, epsilon = 0.2);
        assert_abs_diff_eq!(fix.position.y, center.y, epsilon = 0.2);
    }

    #[test]
    fn test_centroid_insufficient_margin_near_edge() {
        let image = render_star(64, 64, Point::new(1.0, 32.0), 200.0, 2.0, 10);
        let locator = CentroidLocator::new();
        let roi = Rect::at(0, 0).of_size(64, 64);
        let e = locator.locate(&image, &roi).unwrap_err();
        assert_eq!(e.code, CanonicalErrorCode::OutOfRange);
        assert!(e.message.contains("insufficient margin"));
    }

    #[test]
    fn test_centroid_no_star_on_flat_image() {
        let image = GrayImage::from_pixel(64, 64, image::Luma([10u8]));
        let locator = CentroidLocator::new();
        let roi = Rect::at(0, 0).of_size(64, 64);
        let e = locator.locate(&image, &roi).unwrap_err();
        assert_eq!(e.code, CanonicalErrorCode::NotFound);
    }

    #[test]
    fn test_centroid_ignores_hot_pixel() {
        let center = Point::new(30.0, 34.0);
        let mut image = render_star(64, 64, center, 150.0, 2.0, 10);
        image.put_pixel(50, 12, image::Luma([255u8]));
        let locator = CentroidLocator::new();
        let roi = Rect::at(0, 0).of_size(64, 64);
        let fix = locator.locate(&image, &roi).unwrap();
        assert_abs_diff_eq!(fix.position.x, center.x, epsilon = 0.2);
        assert_abs_diff_eq!(fix.position.y, center.y, epsilon = 0.2);
    }

    #[test]
    fn test_centroid_diagnostic_overlay() {
        let image = render_star(64, 64, Point::new(32.0, 32.0), 200.0, 2.0, 10);
        let mut locator = CentroidLocator::new();
        locator.make_diagnostic = true;
        let roi = Rect::at(8, 8).of_size(48, 48);
        let fix = locator.locate(&image, &roi).unwrap();
        let overlay = fix.diagnostic.unwrap();
        assert_eq!(overlay.dimensions(), (48, 48));
    }

    #[test]
    fn test_phase_correlation_recovers_shift() {
        let reference_position = Point::new(40.3, 40.7);
        let reference = render_star(80, 80, reference_position, 180.0, 3.0, 12);
        // The same pattern translated by an integer (4, -3).
        let shifted = GrayImage::from_fn(80, 80, |x, y| {
            let sx = (x as i32 - 4).clamp(0, 79) as u32;
            let sy = (y as i32 + 3).clamp(0, 79) as u32;
            *reference.get_pixel(sx, sy)
        });
        let roi = Rect::at(8, 8).of_size(64, 64);
        let locator = PhaseCorrelationLocator::new(
            &reference, &roi, reference_position).unwrap();
        let fix = locator.locate(&shifted, &roi).unwrap();
        assert_abs_diff_eq!(fix.position.x, reference_position.x + 4.0,
                            epsilon = 0.1);
        assert_abs_diff_eq!(fix.position.y, reference_position.y - 3.0,
                            epsilon = 0.1);
        assert!(fix.weight > 0.0);
    }

    #[test]
    fn test_phase_correlation_rejects_mismatched_roi() {
        let reference = render_star(80, 80, Point::new(40.0, 40.0),
                                    180.0, 3.0, 12);
        let roi = Rect::at(8, 8).of_size(64, 64);
        let locator = PhaseCorrelationLocator::new(
            &reference, &roi, Point::new(40.0, 40.0)).unwrap();
        let wrong_roi = Rect::at(8, 8).of_size(32, 32);
        let e = locator.locate(&reference, &wrong_roi).unwrap_err();
        assert_eq!(e.code, CanonicalErrorCode::InvalidArgument);
    }

    #[test]
    fn test_phase_correlation_no_feature() {
        let reference = render_star(80, 80, Point::new(40.0, 40.0),
                                    180.0, 3.0, 12);
        let flat = GrayImage::from_pixel(80, 80, image::Luma([12u8]));
        let roi = Rect::at(8, 8).of_size(64, 64);
        let locator = PhaseCorrelationLocator::new(
            &reference, &roi, Point::new(40.0, 40.0)).unwrap();
        let e = locator.locate(&flat, &roi).unwrap_err();
        assert_eq!(e.code, CanonicalErrorCode::NotFound);
    }
}  // mod tests.
