//! Pan-rate estimation from a short lookback window.

use std::collections::VecDeque;

/// Rolling window of recent pan targets used to estimate how fast the
/// camera needs to sweep.
///
/// The window only ever holds samples moving in one direction: a new sample
/// that breaks the trend (direction change, or a near-identical repeat from
/// a stalled target) clears the window and re-seeds it, so the estimate
/// never averages across a turnaround.
#[derive(Debug, Default)]
pub struct PanRateWindow {
    samples: VecDeque<(f64, f64)>,
}

impl PanRateWindow {
    const CAPACITY: usize = 3;
    /// Two samples closer than this are a stalled target, not motion.
    const IDENTICAL_EPS: f64 = 0.01;
    /// The estimate runs a touch hot so the camera leads the surfer
    /// slightly instead of trailing.
    const LEAD_FACTOR: f64 = 1.1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `(pan_deg, t)` sample and return the updated rate estimate in
    /// degrees/second.
    pub fn push(&mut self, pan_deg: f64, t: f64) -> f64 {
        if !self.follows_trend(pan_deg) {
            self.samples.clear();
        }
        if self.samples.len() == Self::CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back((pan_deg, t));
        self.rate()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether appending `value` would keep all consecutive diffs strictly
    /// same-signed.
    fn follows_trend(&self, value: f64) -> bool {
        if self.samples.len() < 2 {
            return true;
        }
        let last = self.samples.back().unwrap().0;
        if (value - last).abs() < Self::IDENTICAL_EPS {
            return false;
        }

        let diffs: Vec<f64> = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| b.0 - a.0)
            .collect();
        let trend = if diffs.iter().all(|d| *d > 0.0) {
            1
        } else if diffs.iter().all(|d| *d < 0.0) {
            -1
        } else {
            0
        };

        !((trend == 1 && value < last) || (trend == -1 && value > last))
    }

    /// Pairwise-averaged rate over the window, 0 with fewer than 2 samples.
    pub fn rate(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mut total_angle = 0.0;
        let mut total_time = 0.0;
        for (a, b) in self.samples.iter().zip(self.samples.iter().skip(1)) {
            total_angle += b.0 - a.0;
            total_time += b.1 - a.1;
        }
        if total_time <= 0.0 {
            return 0.0;
        }
        let rate = total_angle / total_time * Self::LEAD_FACTOR;
        (rate * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_is_zero_under_two_samples() {
        let mut window = PanRateWindow::new();
        assert_eq!(window.rate(), 0.0);
        assert_eq!(window.push(10.0, 1.0), 0.0);
    }

    #[test]
    fn test_steady_sweep_rate() {
        let mut window = PanRateWindow::new();
        window.push(10.0, 1.0);
        window.push(12.0, 2.0);
        let rate = window.push(14.0, 3.0);
        // 2 °/s with the 1.1 lead factor.
        assert!((rate - 2.2).abs() < 1e-9);
    }

    #[test]
    fn test_direction_change_reseeds_window() {
        let mut window = PanRateWindow::new();
        window.push(10.0, 1.0);
        window.push(12.0, 2.0);
        window.push(14.0, 3.0);
        // Turnaround: the window restarts from this sample alone.
        let rate = window.push(13.0, 4.0);
        assert_eq!(rate, 0.0);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_stalled_target_reseeds_window() {
        let mut window = PanRateWindow::new();
        window.push(10.0, 1.0);
        window.push(12.0, 2.0);
        let rate = window.push(12.001, 3.0);
        assert_eq!(rate, 0.0);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_no_sign_change_ever_stored() {
        let mut window = PanRateWindow::new();
        let inputs = [0.0, 2.0, 5.0, 3.0, 1.0, 4.0, 4.005, 8.0, -2.0];
        for (i, &pan) in inputs.iter().enumerate() {
            window.push(pan, i as f64);
            let samples: Vec<f64> = window.samples.iter().map(|s| s.0).collect();
            let diffs: Vec<f64> = samples.windows(2).map(|w| w[1] - w[0]).collect();
            assert!(
                diffs.iter().all(|d| *d > 0.0) || diffs.iter().all(|d| *d < 0.0),
                "mixed trend after sample {i}: {samples:?}"
            );
        }
    }

    #[test]
    fn test_capacity_is_three() {
        let mut window = PanRateWindow::new();
        for i in 0..10 {
            window.push(i as f64, i as f64);
        }
        assert_eq!(window.len(), 3);
        // Rate over the surviving span: 1 °/s × 1.1.
        assert!((window.rate() - 1.1).abs() < 1e-9);
    }
}
