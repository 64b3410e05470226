// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use medians::Medianf64;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

/// Incremental summary of a stream of values (e.g. per-cycle guide error
/// magnitudes): count and RMS over the whole run, descriptive statistics
/// over both the whole run and a recent window.
#[derive(Clone, Debug, Default)]
pub struct ValueStats {
    pub count: i64,
    pub rms: f64,
    pub recent: DescriptiveStats,
    pub session: DescriptiveStats,
}

pub struct ValueStatsAccumulator {
    pub value_stats: ValueStats,

    // State for `recent`.
    circular_buffer: CircularBuffer,

    // State for `session`.
    rolling_stats: rolling_stats::Stats<f64>,

    // State for `rms`.
    sum_squares: f64,
}

impl ValueStatsAccumulator {
    /// `capacity` is the size of the recent window.
    pub fn new(capacity: usize) -> Self {
        Self {
            value_stats: ValueStats::default(),
            circular_buffer: CircularBuffer::new(capacity),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
            sum_squares: 0.0,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.circular_buffer.push(value);
        self.rolling_stats.update(value);
        self.value_stats.count += 1;
        self.sum_squares += value * value;
        self.value_stats.rms =
            (self.sum_squares / self.value_stats.count as f64).sqrt();

        let recent_values = self.circular_buffer.unordered_contents();
        let recent_stats = &mut self.value_stats.recent;
        recent_stats.min =
            *recent_values.iter().min_by(|a, b| a.total_cmp(b)).unwrap();
        recent_stats.max =
            *recent_values.iter().max_by(|a, b| a.total_cmp(b)).unwrap();
        recent_stats.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent_stats.stddev = statistical::standard_deviation(
                recent_values, Some(recent_stats.mean));
        }
        recent_stats.median = Some(recent_values.medf_unchecked());
        recent_stats.median_absolute_deviation =
            Some(recent_values.madf(recent_stats.median.unwrap()));

        let session_stats = &mut self.value_stats.session;
        session_stats.min = self.rolling_stats.min;
        session_stats.max = self.rolling_stats.max;
        session_stats.mean = self.rolling_stats.mean;
        session_stats.stddev = self.rolling_stats.std_dev;
        // No median or median_absolute_deviation for session_stats.
    }

    pub fn reset_session(&mut self) {
        self.value_stats.session = DescriptiveStats::default();
        self.value_stats.count = 0;
        self.value_stats.rms = 0.0;
        self.sum_squares = 0.0;
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
    }
}

// We use a Vec<f64> to implement a ring buffer. We don't use VecDeque or
// similar because we want a view of all elements as a single slice, and we
// don't care about their order (VecDeque provides a slice view, but as two
// slices to represent ordering).
#[derive(Debug)]
struct CircularBuffer {
    start: usize,
    data: Vec<f64>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.data.len() < self.data.capacity() {
            self.data.push(value);
        } else {
            self.data[self.start] = value;
            self.start += 1;
            if self.start == self.data.capacity() {
                self.start = 0;
            }
        }
    }

    pub fn unordered_contents(&self) -> &[f64] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_circular_buffer() {
        let mut cb = CircularBuffer::new(3);
        assert_eq!(cb.unordered_contents(), &[] as &[f64]);

        cb.push(4.0);
        assert_eq!(cb.unordered_contents(), [4.0]);

        cb.push(5.0);
        cb.push(6.0);
        assert_eq!(cb.unordered_contents(), [4.0, 5.0, 6.0]);

        cb.push(7.0);
        assert_eq!(cb.unordered_contents(), [7.0, 5.0, 6.0]);
    }

    #[test]
    fn test_count_and_rms() {
        let mut vsa = ValueStatsAccumulator::new(10);
        assert_eq!(vsa.value_stats.count, 0);
        assert_eq!(vsa.value_stats.rms, 0.0);

        vsa.add_value(3.0);
        vsa.add_value(4.0);
        assert_eq!(vsa.value_stats.count, 2);
        // sqrt((9 + 16) / 2).
        assert_abs_diff_eq!(vsa.value_stats.rms, 3.5355, epsilon = 0.001);
    }

    #[test]
    fn test_recent_and_session_stats() {
        let mut vsa = ValueStatsAccumulator::new(3);

        vsa.add_value(1.5);
        vsa.add_value(3.5);
        let recent = &vsa.value_stats.recent;
        assert_eq!(recent.min, 1.5);
        assert_eq!(recent.max, 3.5);
        assert_eq!(recent.mean, 2.5);
        assert_abs_diff_eq!(recent.stddev, 1.41, epsilon = 0.01);
        assert_eq!(recent.median, Some(2.5));
        assert_eq!(recent.median_absolute_deviation, Some(1.0));
        let session = &vsa.value_stats.session;
        assert_eq!(session.min, 1.5);
        assert_eq!(session.max, 3.5);
        assert_eq!(session.mean, 2.5);

        // reset_session() clears session stats but not recent stats.
        vsa.reset_session();
        assert_eq!(vsa.value_stats.count, 0);
        assert_eq!(vsa.value_stats.rms, 0.0);
        assert_eq!(vsa.value_stats.recent.min, 1.5);
        assert_eq!(vsa.value_stats.session, DescriptiveStats::default());
    }
}  // mod tests.
