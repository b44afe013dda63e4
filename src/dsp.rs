//! DSP building blocks for the shaker engine: a second-order IIR section with
//! explicit state, the two coefficient designs the engine uses, a feedback
//! echo for the output stage, and a seedable xorshift noise source.
//!
//! Nothing here allocates or locks, so every type is safe to drive from an
//! audio callback.

use std::f32::consts::PI;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lowest friction band-pass centre frequency, in Hz.
pub const MIN_BAND_PASS_HZ: f32 = 50.0;

/// Lowest roll resonator frequency, in Hz.
pub const MIN_RESONATOR_HZ: f32 = 40.0;

/// Centre frequencies are capped at this fraction of the sample rate.
pub const MAX_FREQ_RATIO: f32 = 0.45;

/// Band-pass Q at resonance 1.0 and 0.0 respectively; resonance is mapped
/// inversely through this range.
pub const BAND_PASS_Q_RANGE: (f32, f32) = (0.05, 10.0);

/// Allowed pole radius for the roll resonator.
pub const RESONATOR_RADIUS_RANGE: (f32, f32) = (0.85, 0.999);

/// Linear interpolation from `a` to `b`, with `t` clamped to `[0, 1]`.
pub(crate) fn lerp(a: f32, b: f32, t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    a + (b - a) * t
}

/// Clamp `hz` into `[min, fs * MAX_FREQ_RATIO]`, never panicking when the
/// sample rate is so low that the range is empty.
fn clamp_freq(hz: f32, min: f32, sample_rate: f32) -> f32 {
    hz.min(sample_rate * MAX_FREQ_RATIO).max(min)
}

// ── Coefficients ─────────────────────────────────────────────────────────────

/// Normalised biquad coefficients (`a0 == 1`).
///
/// Difference equation:
/// `y[n] = b0·x[n] + b1·x[n−1] + b2·x[n−2] − a1·y[n−1] − a2·y[n−2]`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BiquadCoefficients {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl BiquadCoefficients {
    /// Band-pass with constant 0 dB peak gain (RBJ cookbook).
    ///
    /// `resonance` in `[0, 1]` is mapped inversely onto Q through
    /// [`BAND_PASS_Q_RANGE`]: higher resonance gives a *wider* band and
    /// therefore a noisier, brighter friction texture.
    pub fn band_pass(center_hz: f32, resonance: f32, sample_rate: f32) -> Self {
        let fs = sample_rate;
        let w0 = 2.0 * PI * clamp_freq(center_hz, MIN_BAND_PASS_HZ, fs) / fs;
        let cos_w0 = w0.cos();
        let q = lerp(BAND_PASS_Q_RANGE.0, BAND_PASS_Q_RANGE.1, 1.0 - resonance);
        let alpha = w0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        Self {
            b0: alpha / a0,
            b1: 0.0,
            b2: -alpha / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Two-pole resonator with poles at `radius · e^{±jω}`.
    ///
    /// The excitation gain is `1 − radius`, so longer rings (radius → 1) are
    /// excited more gently.  Radius is clamped into [`RESONATOR_RADIUS_RANGE`].
    pub fn resonator(freq_hz: f32, radius: f32, sample_rate: f32) -> Self {
        let fs = sample_rate;
        let w = 2.0 * PI * clamp_freq(freq_hz, MIN_RESONATOR_HZ, fs) / fs;
        let r = radius.clamp(RESONATOR_RADIUS_RANGE.0, RESONATOR_RADIUS_RANGE.1);
        Self {
            b0: 1.0 - r,
            b1: 0.0,
            b2: 0.0,
            a1: -2.0 * r * w.cos(),
            a2: r * r,
        }
    }

    /// Pole radius `√a2`; strictly below 1 means the section is stable.
    pub fn pole_radius(&self) -> f32 {
        self.a2.abs().sqrt()
    }
}

// ── Biquad ───────────────────────────────────────────────────────────────────

/// A Direct Form I second-order section with its own two-input/two-output
/// history.
///
/// Updating coefficients keeps the history, so parameter changes do not
/// click.  History is only cleared by [`Biquad::reset`].
#[derive(Debug, Clone, Default)]
pub struct Biquad {
    coeffs: BiquadCoefficients,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    pub fn new(coeffs: BiquadCoefficients) -> Self {
        Self {
            coeffs,
            ..Self::default()
        }
    }

    pub fn coefficients(&self) -> &BiquadCoefficients {
        &self.coeffs
    }

    pub fn set_coefficients(&mut self, coeffs: BiquadCoefficients) {
        self.coeffs = coeffs;
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let c = &self.coeffs;
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

// ── Echo ─────────────────────────────────────────────────────────────────────

/// Feedback delay over interleaved audio.
///
/// For every sample `x` with delayed value `d`, the output is
/// `dry·x + wet·d` and `x + decay·d` is written back into the line.  The line
/// holds `delay_frames · channels` samples, so each channel echoes onto itself.
/// It is allocated in [`Echo::new`] and never resized.
#[derive(Debug, Clone)]
pub struct Echo {
    line: Vec<f32>,
    pos: usize,
    decay: f32,
    wet: f32,
    dry: f32,
}

impl Echo {
    pub fn new(delay_ms: f32, decay: f32, wet: f32, dry: f32, sample_rate: f32, channels: usize) -> Self {
        let frames = (delay_ms.max(0.0) * sample_rate / 1000.0).round().max(1.0) as usize;
        Self {
            line: vec![0.0; frames * channels.max(1)],
            pos: 0,
            decay,
            wet,
            dry,
        }
    }

    /// Delay length in samples across all channels.
    pub fn len(&self) -> usize {
        self.line.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line.is_empty()
    }

    /// Apply the echo to `data` in place.
    pub fn process(&mut self, data: &mut [f32]) {
        for s in data {
            let d = self.line[self.pos];
            self.line[self.pos] = *s + d * self.decay;
            *s = *s * self.dry + d * self.wet;
            self.pos += 1;
            if self.pos == self.line.len() {
                self.pos = 0;
            }
        }
    }
}

// ── Noise ────────────────────────────────────────────────────────────────────

/// Marsaglia xorshift32 generator.
///
/// Cheap and deterministic; a zero seed (the generator's fixed point) is
/// replaced with a non-zero constant.
#[derive(Debug, Clone)]
pub struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    const ZERO_SEED_REPLACEMENT: u32 = 0x9E37_79B9;

    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 {
                Self::ZERO_SEED_REPLACEMENT
            } else {
                seed
            },
        }
    }

    /// Seed from the wall clock, for sessions that need no reproducibility.
    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(0);
        Self::new(nanos)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform in `[0, 1]`.
    #[inline]
    pub fn next_unit(&mut self) -> f32 {
        self.next_u32() as f32 / u32::MAX as f32
    }

    /// Uniform in `[-1, 1]`.
    #[inline]
    pub fn next_bipolar(&mut self) -> f32 {
        self.next_unit() * 2.0 - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f32 = 48_000.0;

    #[test]
    fn coefficient_derivation_is_deterministic() {
        assert_eq!(
            BiquadCoefficients::band_pass(2500.0, 0.96, FS),
            BiquadCoefficients::band_pass(2500.0, 0.96, FS)
        );
        assert_eq!(
            BiquadCoefficients::resonator(128.0, 0.9869, FS),
            BiquadCoefficients::resonator(128.0, 0.9869, FS)
        );
    }

    #[test]
    fn band_pass_clamps_centre_frequency() {
        let low = BiquadCoefficients::band_pass(1.0, 0.9, FS);
        assert_eq!(low, BiquadCoefficients::band_pass(MIN_BAND_PASS_HZ, 0.9, FS));
        let high = BiquadCoefficients::band_pass(40_000.0, 0.9, FS);
        assert_eq!(high, BiquadCoefficients::band_pass(FS * MAX_FREQ_RATIO, 0.9, FS));
    }

    #[test]
    fn tiny_sample_rate_does_not_panic() {
        let c = BiquadCoefficients::band_pass(2500.0, 0.9, 10.0);
        assert!(c.b0.is_finite());
        let r = BiquadCoefficients::resonator(128.0, 0.95, 10.0);
        assert!(r.a1.is_finite());
    }

    #[test]
    fn resonator_radius_is_clamped() {
        let c = BiquadCoefficients::resonator(128.0, 1.5, FS);
        assert!((c.pole_radius() - RESONATOR_RADIUS_RANGE.1).abs() < 1e-6);
        assert!((c.b0 - (1.0 - RESONATOR_RADIUS_RANGE.1)).abs() < 1e-6);
        let c = BiquadCoefficients::resonator(128.0, 0.1, FS);
        assert!((c.pole_radius() - RESONATOR_RADIUS_RANGE.0).abs() < 1e-6);
    }

    #[test]
    fn band_pass_rejects_dc() {
        let mut f = Biquad::new(BiquadCoefficients::band_pass(2500.0, 0.9, FS));
        let mut y = 0.0;
        for _ in 0..20_000 {
            y = f.process(1.0);
        }
        assert!(y.abs() < 1e-3, "dc leak {y}");
    }

    #[test]
    fn resonator_rings_and_decays() {
        let mut f = Biquad::new(BiquadCoefficients::resonator(128.0, 0.99, FS));
        let first = f.process(1.0);
        assert!(first > 0.0);
        let mut peak_late: f32 = 0.0;
        for i in 0..20_000 {
            let y = f.process(0.0);
            if i > 15_000 {
                peak_late = peak_late.max(y.abs());
            }
        }
        assert!(peak_late < 1e-6, "ring did not decay: {peak_late}");
    }

    #[test]
    fn filters_stay_bounded_for_a_million_samples() {
        let mut rng = XorShift32::new(7);
        for (res, radius) in [(0.80, 0.85), (0.96, 0.9869), (0.999, 0.999)] {
            let mut bp = Biquad::new(BiquadCoefficients::band_pass(2500.0, res, FS));
            let mut rs = Biquad::new(BiquadCoefficients::resonator(128.0, radius, FS));
            for _ in 0..1_000_000 {
                let x = rng.next_bipolar();
                let a = bp.process(x);
                let b = rs.process(x);
                assert!(a.is_finite() && a.abs() < 100.0);
                assert!(b.is_finite() && b.abs() < 100.0);
            }
        }
    }

    #[test]
    fn reset_clears_history_but_keeps_coefficients() {
        let coeffs = BiquadCoefficients::resonator(200.0, 0.95, FS);
        let mut f = Biquad::new(coeffs);
        let first = f.process(1.0);
        f.process(0.3);
        f.reset();
        assert_eq!(f.coefficients(), &coeffs);
        assert_eq!(f.process(1.0), first);
    }

    #[test]
    fn xorshift_is_reproducible_and_in_range() {
        let mut a = XorShift32::new(12345);
        let mut b = XorShift32::new(12345);
        for _ in 0..10_000 {
            let u = a.next_unit();
            assert_eq!(u, b.next_unit());
            assert!((0.0..=1.0).contains(&u));
        }
    }

    #[test]
    fn xorshift_zero_seed_is_not_stuck() {
        let mut r = XorShift32::new(0);
        assert_ne!(r.next_u32(), 0);
    }

    #[test]
    fn xorshift_known_sequence() {
        // Reference values for seed 1 (Marsaglia 13/17/5).
        let mut r = XorShift32::new(1);
        assert_eq!(r.next_u32(), 270_369);
        assert_eq!(r.next_u32(), 67_634_689);
    }

    #[test]
    fn echo_repeats_an_impulse_after_the_delay() {
        // 10 ms at 1 kHz is 10 frames; stereo doubles the line.
        let mut echo = Echo::new(10.0, 0.5, 0.5, 1.0, 1000.0, 2);
        assert_eq!(echo.len(), 20);

        let mut buf = vec![0.0f32; 2 * 40];
        buf[0] = 1.0;
        echo.process(&mut buf);

        assert_eq!(buf[0], 1.0);
        assert_eq!(buf[20], 0.5);
        assert_eq!(buf[40], 0.25);
        assert_eq!(buf[60], 0.125);
        for (i, &s) in buf.iter().enumerate() {
            if i % 20 != 0 {
                assert_eq!(s, 0.0, "sample {i}");
            }
        }
    }

    #[test]
    fn echo_state_carries_across_buffers() {
        let mut whole = Echo::new(3.0, 0.272, 0.5, 1.0, 1000.0, 1);
        let mut split = whole.clone();
        let input: Vec<f32> = (0..17).map(|i| (i as f32 * 0.37).sin()).collect();

        let mut a = input.clone();
        whole.process(&mut a);
        let mut b = input;
        let (head, tail) = b.split_at_mut(5);
        split.process(head);
        split.process(tail);
        assert_eq!(a, b);
    }

    #[test]
    fn dry_only_echo_is_transparent() {
        let mut echo = Echo::new(470.0, 0.272, 0.0, 1.0, 48_000.0, 2);
        let mut buf = vec![0.3f32; 2 * 48_000];
        echo.process(&mut buf);
        assert!(buf.iter().all(|&s| s == 0.3));
    }
}
