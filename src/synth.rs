//! The shaker synthesis engine.
//!
//! Two textures are generated per sample and mixed:
//!
//! * **friction**: white noise scaled by energy, shaped by a band-pass
//!   ([`BiquadCoefficients::band_pass`]); a continuous rattle.
//! * **roll**: a sparse random impulse train whose density grows with
//!   energy, ringing a low resonator ([`BiquadCoefficients::resonator`]);
//!   discrete impacts of beads against the shell.
//!
//! The engine is driven by the audio backend.  [`ShakerEngine::process`]
//! never allocates, blocks, or locks: energy is read once from
//! [`DriveState`], decayed in a local, and committed once at the end, and
//! parameter updates arrive through a bounded channel drained with
//! `try_recv`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::drive::DriveState;
use crate::dsp::{lerp, Biquad, BiquadCoefficients, XorShift32};

/// Impacts per second at zero energy.
pub const MIN_IMPACTS_PER_SEC: f32 = 2.0;

/// Impacts per second at full energy.
pub const MAX_IMPACTS_PER_SEC: f32 = 45.0;

/// Capacity of the live parameter channel.
pub const PARAM_CHANNEL_CAPACITY: usize = 16;

// ── Parameters ───────────────────────────────────────────────────────────────

/// Live-tunable synthesis parameters.
///
/// Ranges are enforced by [`SynthParams::clamped`], which the engine applies
/// to every parameter set it receives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthParams {
    /// Friction output level, 0–1.
    pub level: f32,
    /// Friction band-pass centre, 200–6000 Hz.
    pub center_hz: f32,
    /// Friction resonance, 0.80–0.999.  Higher is wider.
    pub resonance: f32,
    /// Per-sample energy multiplier, 0.90–0.9999.
    pub energy_decay: f32,
    /// Roll output gain, 0–2.
    pub roll_level: f32,
    /// Roll resonator frequency, 40–600 Hz.
    pub roll_freq_hz: f32,
    /// Roll resonator pole radius, 0.85–0.999.
    pub roll_resonance: f32,
    /// Mute the friction texture and play only the roll.
    pub only_roll: bool,
}

impl Default for SynthParams {
    fn default() -> Self {
        Self {
            level: 0.0,
            center_hz: 2500.0,
            resonance: 0.96,
            energy_decay: 0.995,
            roll_level: 2.0,
            roll_freq_hz: 128.0,
            roll_resonance: 0.9869,
            only_roll: true,
        }
    }
}

impl SynthParams {
    pub fn clamped(&self) -> Self {
        Self {
            level: self.level.clamp(0.0, 1.0),
            center_hz: self.center_hz.clamp(200.0, 6000.0),
            resonance: self.resonance.clamp(0.80, 0.999),
            energy_decay: self.energy_decay.clamp(0.90, 0.9999),
            roll_level: self.roll_level.clamp(0.0, 2.0),
            roll_freq_hz: self.roll_freq_hz.clamp(40.0, 600.0),
            roll_resonance: self.roll_resonance.clamp(0.85, 0.999),
            only_roll: self.only_roll,
        }
    }

    /// `true` if switching from `self` to `other` requires new coefficients.
    fn filters_differ(&self, other: &SynthParams) -> bool {
        self.center_hz != other.center_hz
            || self.resonance != other.resonance
            || self.roll_freq_hz != other.roll_freq_hz
            || self.roll_resonance != other.roll_resonance
    }
}

/// Create the bounded channel used to push [`SynthParams`] into a running
/// engine.  Senders should use `try_send`; if the engine falls behind the
/// newest set wins once it catches up.
pub fn param_channel() -> (mpsc::Sender<SynthParams>, mpsc::Receiver<SynthParams>) {
    mpsc::channel(PARAM_CHANNEL_CAPACITY)
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct ShakerEngine {
    params: SynthParams,
    sample_rate: f32,
    friction: Biquad,
    roll: Biquad,
    rng: XorShift32,
    drive: Arc<DriveState>,
    updates: Option<mpsc::Receiver<SynthParams>>,
}

impl ShakerEngine {
    /// Build an engine for `sample_rate` with a reproducible noise `seed`.
    ///
    /// Filter history starts at zero and is never cleared afterwards.
    pub fn new(params: SynthParams, sample_rate: f32, seed: u32, drive: Arc<DriveState>) -> Self {
        let params = params.clamped();
        let sample_rate = sample_rate.max(1.0);
        let (friction, roll) = Self::design(&params, sample_rate);
        Self {
            params,
            sample_rate,
            friction: Biquad::new(friction),
            roll: Biquad::new(roll),
            rng: XorShift32::new(seed),
            drive,
            updates: None,
        }
    }

    /// Attach the receiving end of [`param_channel`].
    pub fn with_param_updates(mut self, rx: mpsc::Receiver<SynthParams>) -> Self {
        self.updates = Some(rx);
        self
    }

    pub fn params(&self) -> &SynthParams {
        &self.params
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Current `(friction, roll)` coefficient sets.
    pub fn coefficients(&self) -> (BiquadCoefficients, BiquadCoefficients) {
        (*self.friction.coefficients(), *self.roll.coefficients())
    }

    /// Replace the parameters, redesigning the filters only when a
    /// filter-relevant field changed.
    pub fn set_params(&mut self, params: SynthParams) {
        let params = params.clamped();
        let redesign = self.params.filters_differ(&params);
        self.params = params;
        if redesign {
            self.recompute_coefficients();
        }
    }

    /// Change the output sample rate and redesign both filters.
    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        let sample_rate = sample_rate.max(1.0);
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.recompute_coefficients();
        }
    }

    fn recompute_coefficients(&mut self) {
        let (friction, roll) = Self::design(&self.params, self.sample_rate);
        self.friction.set_coefficients(friction);
        self.roll.set_coefficients(roll);
    }

    fn design(params: &SynthParams, sample_rate: f32) -> (BiquadCoefficients, BiquadCoefficients) {
        (
            BiquadCoefficients::band_pass(params.center_hz, params.resonance, sample_rate),
            BiquadCoefficients::resonator(params.roll_freq_hz, params.roll_resonance, sample_rate),
        )
    }

    fn apply_pending_params(&mut self) {
        let mut latest = None;
        if let Some(rx) = self.updates.as_mut() {
            while let Ok(p) = rx.try_recv() {
                latest = Some(p);
            }
        }
        if let Some(p) = latest {
            self.set_params(p);
        }
    }

    /// Add one buffer of shaker signal into `data`.
    ///
    /// `data` is interleaved with `channels` samples per frame; the same mono
    /// value is *added* to every channel of a frame.  A trailing partial frame
    /// is filled as well.
    ///
    /// Each frame draws two values from the generator: the friction noise,
    /// then the roll variate `u`.  `u` comes from a full xorshift step, so a
    /// given seed does not reproduce sequences from generators that take it
    /// after the first shift stage only.
    pub fn process(&mut self, data: &mut [f32], channels: usize) {
        self.apply_pending_params();
        if channels == 0 || data.is_empty() {
            return;
        }

        let SynthParams {
            level,
            energy_decay,
            roll_level,
            only_roll,
            ..
        } = self.params;
        let inv_sr = 1.0 / self.sample_rate;

        let start = self.drive.energy();
        let mut e = start;

        for frame in data.chunks_mut(channels) {
            e *= energy_decay;

            let white = self.rng.next_bipolar() * e * level;
            let friction = self.friction.process(white);

            let u = self.rng.next_unit();
            let impacts_per_sec = lerp(MIN_IMPACTS_PER_SEC, MAX_IMPACTS_PER_SEC, e);
            let impulse = if u < impacts_per_sec * inv_sr {
                (u * 2.0 - 1.0) * e
            } else {
                0.0
            };
            let roll = self.roll.process(impulse);

            let sample = if only_roll { 0.0 } else { friction } + roll * roll_level;
            for out in frame {
                *out += sample;
            }
        }

        self.drive.commit_energy(start, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f32 = 48_000.0;

    fn engine(params: SynthParams, energy: f32) -> (ShakerEngine, Arc<DriveState>) {
        let drive = Arc::new(DriveState::new());
        drive.set_energy(energy);
        (ShakerEngine::new(params, FS, 42, Arc::clone(&drive)), drive)
    }

    fn loud() -> SynthParams {
        SynthParams {
            level: 1.0,
            only_roll: false,
            ..SynthParams::default()
        }
    }

    #[test]
    fn silence_at_zero_energy() {
        let (mut eng, _) = engine(loud(), 0.0);
        let mut buf = vec![0.0f32; 1024];
        eng.process(&mut buf, 2);
        assert!(buf.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn output_is_added_not_overwritten_and_identical_per_channel() {
        let (mut eng, _) = engine(loud(), 1.0);
        let mut buf = vec![0.25f32; 2 * 512];
        eng.process(&mut buf, 2);
        assert!(buf.iter().any(|&s| s != 0.25));
        for frame in buf.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }

        let (mut a, _) = engine(loud(), 1.0);
        let (mut b, _) = engine(loud(), 1.0);
        let mut zeros = vec![0.0f32; 1024];
        let mut offset = vec![0.5f32; 1024];
        a.process(&mut zeros, 2);
        b.process(&mut offset, 2);
        for (z, o) in zeros.iter().zip(&offset) {
            assert!((o - 0.5 - z).abs() < 1e-6);
        }
    }

    #[test]
    fn energy_decays_per_frame_and_is_committed() {
        let params = SynthParams {
            energy_decay: 0.99,
            ..SynthParams::default()
        };
        let (mut eng, drive) = engine(params, 1.0);
        let mut buf = vec![0.0f32; 3 * 100];
        eng.process(&mut buf, 3);
        let expected = 0.99f32.powi(100);
        assert!((drive.energy() - expected).abs() < 1e-4, "{}", drive.energy());
    }

    #[test]
    fn only_roll_mutes_friction() {
        let roll_only = SynthParams {
            level: 1.0,
            roll_level: 0.0,
            only_roll: true,
            ..SynthParams::default()
        };
        let (mut eng, _) = engine(roll_only, 1.0);
        let mut buf = vec![0.0f32; 4096];
        eng.process(&mut buf, 1);
        assert!(buf.iter().all(|&s| s == 0.0));

        let friction_only = SynthParams {
            only_roll: false,
            ..roll_only
        };
        let (mut eng, _) = engine(friction_only, 1.0);
        let mut buf = vec![0.0f32; 4096];
        eng.process(&mut buf, 1);
        assert!(buf.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn same_seed_same_output() {
        let (mut a, _) = engine(loud(), 0.8);
        let (mut b, _) = engine(loud(), 0.8);
        let mut x = vec![0.0f32; 2048];
        let mut y = vec![0.0f32; 2048];
        a.process(&mut x, 2);
        b.process(&mut y, 2);
        assert_eq!(x, y);
    }

    #[test]
    fn partial_trailing_frame_is_filled() {
        let (mut eng, _) = engine(loud(), 1.0);
        let mut buf = vec![0.0f32; 7];
        eng.process(&mut buf, 2);
        assert_eq!(buf[4], buf[5]);
        assert_ne!(buf[6], 0.0);
    }

    #[test]
    fn zero_channels_is_a_no_op() {
        let (mut eng, drive) = engine(loud(), 0.7);
        let mut buf = vec![0.0f32; 16];
        eng.process(&mut buf, 0);
        assert!(buf.iter().all(|&s| s == 0.0));
        assert_eq!(drive.energy(), 0.7);
    }

    #[test]
    fn unrelated_param_change_keeps_coefficients() {
        let (mut eng, _) = engine(SynthParams::default(), 0.0);
        let before = eng.coefficients();
        eng.set_params(SynthParams {
            level: 0.5,
            roll_level: 1.0,
            ..SynthParams::default()
        });
        assert_eq!(eng.coefficients(), before);

        eng.set_params(SynthParams {
            center_hz: 1000.0,
            ..SynthParams::default()
        });
        assert_ne!(eng.coefficients().0, before.0);
        assert_eq!(eng.coefficients().1, before.1);
    }

    #[test]
    fn params_are_clamped_on_entry() {
        let (mut eng, _) = engine(SynthParams::default(), 0.0);
        eng.set_params(SynthParams {
            level: 5.0,
            roll_resonance: 2.0,
            energy_decay: 1.5,
            ..SynthParams::default()
        });
        assert_eq!(eng.params().level, 1.0);
        assert_eq!(eng.params().roll_resonance, 0.999);
        assert_eq!(eng.params().energy_decay, 0.9999);
    }

    #[test]
    fn live_updates_apply_on_next_callback() {
        let (tx, rx) = param_channel();
        let (eng, _) = engine(SynthParams::default(), 0.0);
        let mut eng = eng.with_param_updates(rx);
        tx.try_send(SynthParams {
            level: 0.3,
            ..SynthParams::default()
        })
        .unwrap();
        tx.try_send(SynthParams {
            level: 0.6,
            ..SynthParams::default()
        })
        .unwrap();
        let mut buf = vec![0.0f32; 8];
        eng.process(&mut buf, 2);
        assert_eq!(eng.params().level, 0.6);
    }

    #[test]
    fn sample_rate_change_redesigns_filters() {
        let (mut eng, _) = engine(SynthParams::default(), 0.0);
        let before = eng.coefficients();
        eng.set_sample_rate(44_100.0);
        assert_ne!(eng.coefficients(), before);
        assert_eq!(eng.sample_rate(), 44_100.0);
    }

    #[test]
    fn sustained_output_stays_bounded() {
        let (mut eng, drive) = engine(loud(), 1.0);
        let mut buf = vec![0.0f32; 2 * 480];
        for _ in 0..2_000 {
            drive.set_energy(1.0);
            buf.fill(0.0);
            eng.process(&mut buf, 2);
            assert!(buf.iter().all(|s| s.is_finite() && s.abs() < 50.0));
        }
    }

    fn roll_only() -> SynthParams {
        SynthParams {
            roll_level: 1.0,
            only_roll: true,
            energy_decay: 0.9999,
            ..SynthParams::default()
        }
    }

    /// Play `secs` of mono roll one frame per callback with the stored energy
    /// held at `energy`, and count the frames that carried an impulse.  The
    /// resonator input is recovered by inverting its recurrence.
    fn count_impacts(energy: f32, secs: f32) -> usize {
        let params = roll_only();
        let (mut eng, drive) = engine(params, energy);
        let roll = eng.coefficients().1;
        let e = energy * params.energy_decay;

        let (mut y1, mut y2) = (0.0f32, 0.0f32);
        let mut frame = [0.0f32; 1];
        let mut impacts = 0;
        for _ in 0..(secs * FS) as usize {
            drive.set_energy(energy);
            frame[0] = 0.0;
            eng.process(&mut frame, 1);
            let y = frame[0];
            let x = (y + roll.a1 * y1 + roll.a2 * y2) / roll.b0;
            if x.abs() > 0.5 * e {
                impacts += 1;
            }
            y2 = y1;
            y1 = y;
        }
        impacts
    }

    #[test]
    fn full_energy_rolls_about_45_impacts_per_second() {
        let n = count_impacts(1.0, 10.0);
        assert!((380..=520).contains(&n), "{n} impacts in 10 s");
    }

    #[test]
    fn near_zero_energy_rolls_about_2_impacts_per_second() {
        let n = count_impacts(1e-3, 30.0);
        assert!((35..=90).contains(&n), "{n} impacts in 30 s");
    }

    #[test]
    fn first_roll_output_is_the_scaled_impulse() {
        let params = roll_only();
        let energy = 0.8;
        let (mut eng, drive) = engine(params, energy);
        let e = energy * params.energy_decay;
        let p = (2.0 + 43.0 * e) * (1.0 / FS);

        // Mirror of the engine's generator: friction draw, then `u`.
        let mut rng = XorShift32::new(42);
        let mut frame = [0.0f32; 1];
        for _ in 0..(10.0 * FS) as usize {
            drive.set_energy(energy);
            frame[0] = 0.0;
            eng.process(&mut frame, 1);
            rng.next_u32();
            let u = rng.next_unit();
            if u < p {
                let expected = (1.0 - params.roll_resonance) * ((u * 2.0 - 1.0) * e);
                assert!(
                    (frame[0] - expected).abs() <= 1e-6 * expected.abs(),
                    "{} vs {expected}",
                    frame[0]
                );
                return;
            }
            assert_eq!(frame[0], 0.0);
        }
        panic!("no impact within 10 s");
    }
}
