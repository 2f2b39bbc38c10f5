//! Sample-level building blocks for the in-process graph: RBJ biquads and a soft-knee
//! compressor.

use std::f32::consts::PI;

use crate::settings::CompressorSettings;

pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

pub fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.max(1e-9).log10()
}

/// Filter shapes used by the EQ stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BiquadKind {
    LowShelf,
    Peaking,
    HighShelf,
}

/// Normalised biquad coefficients (`a0 == 1`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coefficients {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Coefficients {
    pub const PASSTHROUGH: Coefficients = Coefficients {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        let inv = 1.0 / a0;
        Self {
            b0: b0 * inv,
            b1: b1 * inv,
            b2: b2 * inv,
            a1: a1 * inv,
            a2: a2 * inv,
        }
    }

    /// RBJ cookbook coefficients for `kind`.
    pub fn design(kind: BiquadKind, freq_hz: f32, q: f32, gain_db: f32, sample_rate: f32) -> Self {
        let nyquist = sample_rate * 0.5;
        let freq = freq_hz.clamp(1.0, nyquist * 0.99);
        let q = q.max(0.01);
        let a = 10f32.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);

        match kind {
            BiquadKind::Peaking => Self::normalized(
                1.0 + alpha * a,
                -2.0 * cos_w,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w,
                1.0 - alpha / a,
            ),
            BiquadKind::LowShelf => {
                let sqrt_a2 = 2.0 * a.sqrt() * alpha;
                Self::normalized(
                    a * ((a + 1.0) - (a - 1.0) * cos_w + sqrt_a2),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w),
                    a * ((a + 1.0) - (a - 1.0) * cos_w - sqrt_a2),
                    (a + 1.0) + (a - 1.0) * cos_w + sqrt_a2,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w),
                    (a + 1.0) + (a - 1.0) * cos_w - sqrt_a2,
                )
            }
            BiquadKind::HighShelf => {
                let sqrt_a2 = 2.0 * a.sqrt() * alpha;
                Self::normalized(
                    a * ((a + 1.0) + (a - 1.0) * cos_w + sqrt_a2),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w),
                    a * ((a + 1.0) + (a - 1.0) * cos_w - sqrt_a2),
                    (a + 1.0) - (a - 1.0) * cos_w + sqrt_a2,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w),
                    (a + 1.0) - (a - 1.0) * cos_w - sqrt_a2,
                )
            }
        }
    }

    /// Linear magnitude of the transfer function at `freq_hz`.
    pub fn magnitude_at(&self, freq_hz: f32, sample_rate: f32) -> f32 {
        let w = 2.0 * PI * freq_hz / sample_rate;
        let (s1, c1) = w.sin_cos();
        let (s2, c2) = (2.0 * w).sin_cos();
        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);
        let num = (num_re * num_re + num_im * num_im).sqrt();
        let den = (den_re * den_re + den_im * den_im).sqrt().max(1e-12);
        num / den
    }
}

/// Direct Form I biquad for one channel.
#[derive(Clone, Debug)]
pub struct Biquad {
    coeffs: Coefficients,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    pub fn new(coeffs: Coefficients) -> Self {
        Self {
            coeffs,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn coefficients(&self) -> Coefficients {
        self.coeffs
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let c = &self.coeffs;
        let output = c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;
        output
    }

    pub fn clear(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

impl Default for Biquad {
    fn default() -> Self {
        Self::new(Coefficients::PASSTHROUGH)
    }
}

/// Stereo-linked feed-forward compressor with a quadratic soft knee.
#[derive(Clone, Debug)]
pub struct Compressor {
    threshold_db: f32,
    knee_db: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

fn smoothing_coeff(ms: f32, sample_rate: f32) -> f32 {
    if ms <= 0.0 {
        0.0
    } else {
        (-1.0 / (ms * 0.001 * sample_rate)).exp()
    }
}

impl Compressor {
    pub fn new(params: &CompressorSettings, sample_rate: f32) -> Self {
        Self {
            threshold_db: params.threshold_db,
            knee_db: params.knee_db.max(0.0),
            ratio: params.ratio.max(1.0),
            attack_coeff: smoothing_coeff(params.attack_ms, sample_rate),
            release_coeff: smoothing_coeff(params.release_ms, sample_rate),
            envelope: 0.0,
        }
    }

    /// Static curve: gain change in dB for an input level in dB.
    pub fn gain_db(&self, input_db: f32) -> f32 {
        let overshoot = input_db - self.threshold_db;
        let half_knee = self.knee_db / 2.0;
        let slope = 1.0 / self.ratio - 1.0;
        if overshoot <= -half_knee {
            0.0
        } else if overshoot >= half_knee || self.knee_db == 0.0 {
            slope * overshoot
        } else {
            let x = overshoot + half_knee;
            slope * x * x / (2.0 * self.knee_db)
        }
    }

    #[inline]
    pub fn process_stereo(&mut self, frame: [f32; 2]) -> [f32; 2] {
        let level = frame[0].abs().max(frame[1].abs());
        let coeff = if level > self.envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope = coeff * self.envelope + (1.0 - coeff) * level;
        let gain = db_to_linear(self.gain_db(linear_to_db(self.envelope)));
        [frame[0] * gain, frame[1] * gain]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 48_000.0;

    #[test]
    fn peaking_hits_gain_at_center() {
        let c = Coefficients::design(BiquadKind::Peaking, 1000.0, 1.0, 6.0, RATE);
        let db = linear_to_db(c.magnitude_at(1000.0, RATE));
        assert!((db - 6.0).abs() < 0.05, "got {db}");
        let far = linear_to_db(c.magnitude_at(20.0, RATE));
        assert!(far.abs() < 0.1, "got {far}");
    }

    #[test]
    fn shelves_boost_their_side() {
        let low = Coefficients::design(BiquadKind::LowShelf, 100.0, 0.707, 9.0, RATE);
        assert!((linear_to_db(low.magnitude_at(10.0, RATE)) - 9.0).abs() < 0.2);
        assert!(linear_to_db(low.magnitude_at(10_000.0, RATE)).abs() < 0.2);

        let high = Coefficients::design(BiquadKind::HighShelf, 8000.0, 0.707, -9.0, RATE);
        assert!((linear_to_db(high.magnitude_at(20_000.0, RATE)) + 9.0).abs() < 0.5);
        assert!(linear_to_db(high.magnitude_at(100.0, RATE)).abs() < 0.2);
    }

    #[test]
    fn zero_gain_is_flat() {
        for kind in [BiquadKind::LowShelf, BiquadKind::Peaking, BiquadKind::HighShelf] {
            let c = Coefficients::design(kind, 500.0, 1.0, 0.0, RATE);
            for f in [50.0, 500.0, 5000.0] {
                assert!((c.magnitude_at(f, RATE) - 1.0).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn biquad_passthrough_is_identity() {
        let mut bq = Biquad::default();
        for x in [0.5, -0.25, 1.0] {
            assert_eq!(bq.process(x), x);
        }
    }

    #[test]
    fn compressor_curve_has_soft_knee() {
        let comp = Compressor::new(
            &CompressorSettings {
                threshold_db: -20.0,
                knee_db: 10.0,
                ratio: 4.0,
                attack_ms: 1.0,
                release_ms: 50.0,
            },
            RATE,
        );
        assert_eq!(comp.gain_db(-40.0), 0.0);
        let in_knee = comp.gain_db(-20.0);
        assert!(in_knee < 0.0 && in_knee > -5.0 * 0.75);
        assert!((comp.gain_db(0.0) - (-15.0)).abs() < 1e-4);
    }

    #[test]
    fn compressor_reduces_loud_signal() {
        let mut comp = Compressor::new(&CompressorSettings::default(), RATE);
        let mut out = [0.0; 2];
        for _ in 0..4800 {
            out = comp.process_stereo([0.9, -0.9]);
        }
        assert!(out[0] < 0.9 * 0.5);
        assert_eq!(out[0], -out[1]);
    }
}
