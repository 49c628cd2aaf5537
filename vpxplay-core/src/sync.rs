//! Presentation pacing
//!
//! Throttles presentation to the track's nominal frame rate. Pacing only
//! ever adds delay; a late frame is shown immediately and never skipped.

use std::time::{Duration, Instant};

/// Time left to wait once `elapsed` has passed since the last presentation.
pub fn pacing_delay(elapsed: Duration, interval: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Interval between frames at `fps`, zero for a zero rate.
pub fn frame_interval(fps: u32) -> Duration {
    if fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(1_000_000_000 / fps as u64)
    }
}

/// Sleeps between presentations to hold a target frame rate
pub struct FramePacer {
    interval: Duration,
    last: Option<Instant>,
    count: u64,
    slept: Duration,
}

impl FramePacer {
    pub fn new(fps: u32) -> Self {
        Self {
            interval: frame_interval(fps),
            last: None,
            count: 0,
            slept: Duration::ZERO,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Call right after presenting a frame. Sleeps for whatever is left of
    /// the frame interval since the previous call.
    pub fn frame_presented(&mut self) -> Duration {
        let delay = match self.last {
            Some(last) => pacing_delay(last.elapsed(), self.interval),
            None => Duration::ZERO,
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
            self.slept += delay;
        }
        self.last = Some(Instant::now());
        self.count += 1;
        delay
    }

    pub fn frames(&self) -> u64 {
        self.count
    }

    /// Total time spent sleeping.
    pub fn slept(&self) -> Duration {
        self.slept
    }

    /// Forget the previous presentation time.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_remainder_of_interval() {
        let interval = Duration::from_millis(40);
        assert_eq!(pacing_delay(Duration::from_millis(10), interval), Duration::from_millis(30));
        assert_eq!(pacing_delay(Duration::ZERO, interval), interval);
    }

    #[test]
    fn test_late_frames_are_not_delayed() {
        let interval = Duration::from_millis(40);
        assert_eq!(pacing_delay(Duration::from_millis(40), interval), Duration::ZERO);
        assert_eq!(pacing_delay(Duration::from_millis(90), interval), Duration::ZERO);
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(frame_interval(25), Duration::from_millis(40));
        assert_eq!(frame_interval(24), Duration::from_nanos(41_666_666));
        assert_eq!(frame_interval(0), Duration::ZERO);
    }

    #[test]
    fn test_pacer_holds_25_fps() {
        let mut pacer = FramePacer::new(25);
        let start = Instant::now();
        pacer.frame_presented();
        let first = Instant::now();
        pacer.frame_presented();
        assert!(first.elapsed() >= Duration::from_millis(40));
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(pacer.frames(), 2);
    }

    #[test]
    fn test_first_frame_does_not_sleep() {
        let mut pacer = FramePacer::new(1);
        assert_eq!(pacer.frame_presented(), Duration::ZERO);
        pacer.reset();
        assert_eq!(pacer.frame_presented(), Duration::ZERO);
        assert_eq!(pacer.slept(), Duration::ZERO);
    }

    #[test]
    fn test_slow_presentation_is_not_extended() {
        let mut pacer = FramePacer::new(100);
        pacer.frame_presented();
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(pacer.frame_presented(), Duration::ZERO);
    }
}
