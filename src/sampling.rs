//! Rate limiter for the sampled path.
//!
//! The decision depends only on elapsed time, never on frame counts, so it
//! holds for any source rate and under jitter. Emissions are never closer
//! together than the target interval; gaps may be arbitrarily long.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct SamplingClock {
    target_interval: Duration,
    last_emission: Option<Instant>,
}

impl SamplingClock {
    pub fn new(target_interval: Duration) -> Self {
        Self {
            target_interval,
            last_emission: None,
        }
    }

    /// Clock emitting at most `rate` samples per second.
    pub fn from_rate(rate: f64) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(anyhow!("sampling rate must be positive, got {}", rate));
        }
        let interval = Duration::try_from_secs_f64(1.0 / rate)
            .map_err(|_| anyhow!("sampling rate {} is too small", rate))?;
        Ok(Self::new(interval))
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    pub fn last_emission(&self) -> Option<Instant> {
        self.last_emission
    }

    /// Whether a frame at `now` may be emitted. Does not consume the slot.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_emission {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.target_interval,
        }
    }

    /// Record an emission at `now`.
    pub fn mark_emitted(&mut self, now: Instant) {
        self.last_emission = Some(now);
    }

    /// Returns `true` iff at least the target interval has elapsed since the
    /// last emission (or nothing was emitted yet), recording `now` as the new
    /// emission time.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        let due = self.is_due(now);
        if due {
            self.mark_emitted(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(clock: &mut SamplingClock, start: Instant, fps: f64, seconds: f64) -> Vec<Instant> {
        let frames = (fps * seconds).round() as u64;
        (0..frames)
            .map(|i| start + Duration::from_secs_f64(i as f64 / fps))
            .filter(|&t| clock.should_emit(t))
            .collect()
    }

    #[test]
    fn first_frame_is_emitted() {
        let mut clock = SamplingClock::new(Duration::from_millis(200));
        assert!(clock.should_emit(Instant::now()));
    }

    #[test]
    fn sixty_fps_source_with_five_per_second_target_is_spaced() {
        let mut clock = SamplingClock::from_rate(5.0).unwrap();
        let emitted = feed(&mut clock, Instant::now(), 60.0, 3.0);
        for pair in emitted.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert!((14..=16).contains(&emitted.len()), "{}", emitted.len());
    }

    #[test]
    fn slow_source_emits_every_frame() {
        let mut clock = SamplingClock::from_rate(5.0).unwrap();
        let emitted = feed(&mut clock, Instant::now(), 2.0, 5.0);
        assert_eq!(emitted.len(), 10);
    }

    #[test]
    fn jittered_source_never_emits_early() {
        let mut clock = SamplingClock::from_rate(5.0).unwrap();
        let start = Instant::now();
        let offsets_ms = [0u64, 13, 31, 190, 199, 201, 260, 390, 402, 403, 610, 611, 799, 820];
        let emitted: Vec<Instant> = offsets_ms
            .iter()
            .map(|ms| start + Duration::from_millis(*ms))
            .filter(|&t| clock.should_emit(t))
            .collect();
        for pair in emitted.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert_eq!(emitted.len(), 5);
    }

    #[test]
    fn rejects_non_positive_rate() {
        assert!(SamplingClock::from_rate(0.0).is_err());
        assert!(SamplingClock::from_rate(-1.0).is_err());
        assert!(SamplingClock::from_rate(f64::INFINITY).is_err());
    }

    #[test]
    fn rejects_rate_too_small_for_interval() {
        let err = SamplingClock::from_rate(1e-30).unwrap_err();
        assert!(err.to_string().contains("too small"), "{err}");
    }

    #[test]
    fn unmarked_due_frame_keeps_the_slot_open() {
        let mut clock = SamplingClock::from_rate(5.0).unwrap();
        let start = Instant::now();
        assert!(clock.is_due(start));
        // Not marked (e.g. the sample could not be encoded).
        assert!(clock.is_due(start + Duration::from_millis(30)));
        clock.mark_emitted(start + Duration::from_millis(30));
        assert!(!clock.is_due(start + Duration::from_millis(200)));
        assert!(clock.is_due(start + Duration::from_millis(230)));
    }
}
