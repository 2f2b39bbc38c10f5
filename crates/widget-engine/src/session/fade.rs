use std::time::Duration;

use widget_types::FadeState;

/// Perceptual volume curve: `f(v) = 0.5v + 0.5v²`, with `v` clamped to `[0, 1]`.
pub fn perceptual_gain(volume: f32) -> f32 {
    let v = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
    0.5 * v + 0.5 * v * v
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RampDirection {
    In,
    Out,
}

/// What a ramp is for. Only a pause leaves the handle rewound once the fade-out ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadePurpose {
    Pause,
    Handoff,
}

/// Linear gain ramp advanced once per tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ramp {
    pub direction: RampDirection,
    /// Ceiling of the ramp, the perceptual gain of the configured volume.
    pub target: f32,
    pub purpose: FadePurpose,
    tick: Duration,
    length: Duration,
    compensation: f32,
    step: f32,
}

impl Ramp {
    pub fn new(direction: RampDirection, target: f32, tick: Duration, length: Duration, compensation: f32) -> Self {
        let mut ramp = Self {
            direction,
            target,
            purpose: FadePurpose::Handoff,
            tick,
            length,
            compensation,
            step: 0.0,
        };
        ramp.retarget(target);
        ramp
    }

    pub fn with_purpose(mut self, purpose: FadePurpose) -> Self {
        self.purpose = purpose;
        self
    }

    /// Recompute the step after the configured volume changed.
    pub fn retarget(&mut self, target: f32) {
        self.target = target.max(0.0);
        let ticks = if self.length.is_zero() {
            1.0
        } else {
            (self.length.as_secs_f32() / self.tick.as_secs_f32().max(f32::EPSILON)).max(1.0)
        };
        // A silent target still needs a non-zero step so fade-outs complete.
        self.step = (self.target.max(f32::EPSILON) * self.compensation.max(f32::EPSILON)) / ticks;
    }

    /// Advance `gain` by one tick. Returns the new gain and whether the ramp finished.
    pub fn advance(&self, gain: f32) -> (f32, bool) {
        match self.direction {
            RampDirection::In => {
                let next = (gain + self.step).clamp(0.0, self.target);
                (next, next >= self.target)
            }
            RampDirection::Out => {
                let next = (gain - self.step).clamp(0.0, self.target);
                (next, next <= 0.0)
            }
        }
    }

    pub fn state(&self) -> FadeState {
        match self.direction {
            RampDirection::In => FadeState::FadingIn,
            RampDirection::Out => FadeState::FadingOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_endpoints_and_monotonic() {
        assert_eq!(perceptual_gain(0.0), 0.0);
        assert_eq!(perceptual_gain(1.0), 1.0);
        let mut prev = 0.0;
        for i in 1..=1000 {
            let g = perceptual_gain(i as f32 / 1000.0);
            assert!(g > prev, "not increasing at step {i}");
            prev = g;
        }
        assert_eq!(perceptual_gain(1.5), 1.0);
        assert_eq!(perceptual_gain(-0.1), 0.0);
        assert_eq!(perceptual_gain(f32::NAN), 0.0);
    }

    #[test]
    fn ramp_in_reaches_target_in_expected_ticks() {
        let tick = Duration::from_millis(10);
        let ramp = Ramp::new(RampDirection::In, 0.5, tick, Duration::from_millis(100), 1.0);
        let mut gain = 0.0;
        let mut ticks = 0;
        loop {
            let (next, done) = ramp.advance(gain);
            assert!(next <= 0.5 && next >= 0.0);
            gain = next;
            ticks += 1;
            if done {
                break;
            }
        }
        assert!((9..=11).contains(&ticks), "took {ticks} ticks");
        assert_eq!(gain, 0.5);
    }

    #[test]
    fn ramp_out_finishes_at_zero() {
        let ramp = Ramp::new(
            RampDirection::Out,
            0.3,
            Duration::from_millis(10),
            Duration::from_millis(50),
            1.0,
        );
        let mut gain = 0.3;
        for _ in 0..100 {
            let (next, done) = ramp.advance(gain);
            gain = next;
            if done {
                break;
            }
        }
        assert_eq!(gain, 0.0);
    }

    #[test]
    fn silent_target_still_completes_fade_out() {
        let ramp = Ramp::new(RampDirection::Out, 0.0, Duration::from_millis(10), Duration::from_millis(300), 1.0);
        assert_eq!(ramp.advance(0.0), (0.0, true));
    }
}
