use std::time::Instant;

/// Longest frame delta fed into the simulation; stalls (debugger, asset
/// load) would otherwise produce one wild exposure/camera step.
const MAX_FRAME_TIME: f32 = 0.1;
const SMOOTHING_FACTOR: f32 = 0.5;

/// Tracks per-frame delta time with clamping and exponential smoothing.
/// The smoothed value feeds the auto-exposure adaptation rate.
pub struct FrameTimer {
    last_frame: Instant,
    smoothed: f32,
}

impl FrameTimer {
    pub fn new() -> Self {
        Self {
            last_frame: Instant::now(),
            smoothed: 1.0 / 60.0,
        }
    }

    /// Advances the timer and returns the smoothed delta in seconds.
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        let raw = (now - self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.smoothed = Self::smooth(self.smoothed, raw);
        self.smoothed
    }

    fn smooth(previous: f32, raw: f32) -> f32 {
        let clamped = raw.min(MAX_FRAME_TIME);
        SMOOTHING_FACTOR * clamped + (1.0 - SMOOTHING_FACTOR) * previous
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
    fn smoothing_blends_towards_raw_value() {
        let smoothed = FrameTimer::smooth(0.016, 0.032);
        assert!(smoothed > 0.016 && smoothed < 0.032);
    }

    #[test]
    fn long_stalls_are_clamped() {
        let smoothed = FrameTimer::smooth(0.016, 5.0);
        assert!(smoothed <= SMOOTHING_FACTOR * MAX_FRAME_TIME + 0.016);
    }

    #[test]
    fn steady_state_converges() {
        let mut value = 0.016;
        for _ in 0..64 {
            value = FrameTimer::smooth(value, 0.008);
        }
        assert!((value - 0.008).abs() < 1e-4);
    }
}
