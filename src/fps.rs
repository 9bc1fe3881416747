use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_SAMPLES: usize = 10;

/// Frames per second as a rolling mean over the last few frame intervals.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    sample_count: usize,
    intervals: VecDeque<Duration>,
    last: Option<Instant>,
}

impl FpsCounter {
    pub fn new(sample_count: usize) -> Self {
        let sample_count = sample_count.max(1);
        Self {
            sample_count,
            intervals: VecDeque::with_capacity(sample_count),
            last: None,
        }
    }

    /// Record a frame now and return the current rate.
    pub fn update(&mut self) -> f32 {
        self.update_at(Instant::now())
    }

    /// Record a frame observed at `now`. Returns 0 until two frames are seen.
    pub fn update_at(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last.replace(now) {
            if self.intervals.len() == self.sample_count {
                self.intervals.pop_front();
            }
            self.intervals.push_back(now.saturating_duration_since(last));
        }
        self.fps()
    }

    pub fn fps(&self) -> f32 {
        let total: Duration = self.intervals.iter().sum();
        if self.intervals.is_empty() || total.is_zero() {
            return 0.0;
        }
        self.intervals.len() as f32 / total.as_secs_f32()
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_rate() {
        let mut counter = FpsCounter::default();
        let start = Instant::now();
        assert_eq!(counter.update_at(start), 0.0);
        let mut fps = 0.0;
        for n in 1..=5 {
            fps = counter.update_at(start + Duration::from_millis(40 * n));
        }
        assert!((fps - 25.0).abs() < 0.01, "fps={}", fps);
    }

    #[test]
    fn old_samples_roll_off() {
        let mut counter = FpsCounter::new(2);
        let start = Instant::now();
        counter.update_at(start);
        counter.update_at(start + Duration::from_secs(1));
        counter.update_at(start + Duration::from_millis(1100));
        let fps = counter.update_at(start + Duration::from_millis(1200));
        assert!((fps - 10.0).abs() < 0.01, "fps={}", fps);
    }

    #[test]
    fn zero_samples_is_clamped() {
        let mut counter = FpsCounter::new(0);
        let start = Instant::now();
        counter.update_at(start);
        let fps = counter.update_at(start + Duration::from_millis(500));
        assert!((fps - 2.0).abs() < 0.01);
    }
}
