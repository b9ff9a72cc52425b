//! Frame timing with a rolling average.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: usize = 120;

/// Measures the interval between successive frames.
///
/// Keeps the last `window` frame durations so callers can report a
/// smoothed frame time instead of a noisy per-frame value.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_tick: Instant,
    samples: VecDeque<Duration>,
    window: usize,
    frame_count: u64,
}

impl FrameTimer {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Create a timer averaging over the last `window` frames (at least one).
    pub fn with_window(window: usize) -> Self {
        let now = Instant::now();
        let window = window.max(1);
        Self {
            start: now,
            last_tick: now,
            samples: VecDeque::with_capacity(window),
            window,
            frame_count: 0,
        }
    }

    /// Total time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Mark the end of a frame and return its duration.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.record(delta);
        delta
    }

    /// Record a frame duration measured elsewhere.
    pub fn record(&mut self, delta: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(delta);
        self.frame_count += 1;
    }

    /// Mean duration over the sampled window, zero before the first frame.
    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    /// Frames per second derived from the average frame time.
    pub fn fps(&self) -> f32 {
        let avg = self.average().as_secs_f32();
        if avg > 0.0 { 1.0 / avg } else { 0.0 }
    }

    /// Number of frames recorded since creation or the last reset.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
        self.samples.clear();
        self.frame_count = 0;
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_empty() {
        let timer = FrameTimer::new();
        assert_eq!(timer.average(), Duration::ZERO);
        assert_eq!(timer.fps(), 0.0);
    }

    #[test]
    fn test_average_over_window() {
        let mut timer = FrameTimer::with_window(2);
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(20));
        timer.record(Duration::from_millis(30));

        // Only the last two samples remain
        assert_eq!(timer.average(), Duration::from_millis(25));
        assert_eq!(timer.frame_count(), 3);
    }

    #[test]
    fn test_fps() {
        let mut timer = FrameTimer::new();
        timer.record(Duration::from_millis(20));
        assert!((timer.fps() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_reset() {
        let mut timer = FrameTimer::new();
        timer.record(Duration::from_millis(5));
        timer.reset();
        assert_eq!(timer.frame_count(), 0);
        assert_eq!(timer.average(), Duration::ZERO);
    }
}
