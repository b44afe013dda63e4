//! Shared drive state and the motion-to-drive bridge.
//!
//! [`DriveState`] is the only data that crosses from the ingestion thread
//! into the audio callback.  Every field is a lock-free atomic so neither
//! side can ever block the other; races between the bridge adding energy
//! and the callback decaying it are resolved with compare-and-swap rather
//! than a mutex.
//!
//! [`MotionBridge`] turns each decoded [`MotionSample`] into an energy
//! increment using per-axis noise gating, a global threshold, and a jerk
//! (rate-of-change) term.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::{LinkState, MotionSample};

/// Energy gained per unit of thresholded magnitude.
pub const ENERGY_PER_MAGNITUDE: f32 = 0.002;

/// Energy gained per unit of absolute jerk (magnitude change per second).
pub const ENERGY_PER_JERK: f32 = 0.0002;

/// Lower bound on the bridge time step, in seconds.
pub const MIN_DELTA_SECS: f32 = 1e-4;

/// Per-axis thresholds are configured in thousands of sensor units.
pub const AXIS_THRESHOLD_SCALE: f32 = 1000.0;

/// Orientation delta scale: degrees of rotation per sensor unit per second.
pub const ORIENTATION_SCALE: f32 = 0.001;

// ── AtomicF32 ────────────────────────────────────────────────────────────────

/// An `f32` stored bit-for-bit in an [`AtomicU32`].
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(v: f32) -> Self {
        Self(AtomicU32::new(v.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, v: f32) {
        self.0.store(v.to_bits(), Ordering::Release);
    }

    /// Apply `f` atomically, retrying on contention.  Returns the new value.
    pub fn update(&self, mut f: impl FnMut(f32) -> f32) -> f32 {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let new = f(f32::from_bits(cur)).to_bits();
            match self
                .0
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return f32::from_bits(new),
                Err(actual) => cur = actual,
            }
        }
    }
}

// ── DriveState ───────────────────────────────────────────────────────────────

/// State shared between the ingestion worker, the audio callback, and the
/// render side.
///
/// | Field | Writer | Readers |
/// |---|---|---|
/// | energy | bridge (add), audio callback (decay) | audio, monitor |
/// | orientation | ingestion worker | render loop |
/// | link state, counters | ingestion worker | render loop, monitor |
///
/// Energy is always kept inside `[0, 1]`.
#[derive(Debug, Default)]
pub struct DriveState {
    energy: AtomicF32,
    orientation: [AtomicF32; 3],
    link_state: AtomicU8,
    payloads: AtomicU64,
    rejected: AtomicU64,
    reconnects: AtomicU64,
}

impl DriveState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Energy ───────────────────────────────────────────────────────────────

    pub fn energy(&self) -> f32 {
        self.energy.load()
    }

    /// Overwrite the energy, clamped to `[0, 1]`.
    pub fn set_energy(&self, e: f32) {
        self.energy.store(clamp_unit(e));
    }

    /// Add `delta` to the energy and clamp.  Returns the new value.
    pub fn add_energy(&self, delta: f32) -> f32 {
        self.energy.update(|e| clamp_unit(e + delta))
    }

    /// Commit the result of one audio callback.
    ///
    /// `start` is the value the callback read before decaying it and `end`
    /// is its decayed local copy.  Anything the bridge added in between is
    /// carried over instead of being overwritten.
    pub fn commit_energy(&self, start: f32, end: f32) -> f32 {
        self.energy.update(|cur| clamp_unit(end + (cur - start)))
    }

    // ── Orientation ──────────────────────────────────────────────────────────

    /// Latest decoded angular-rate vector.
    pub fn orientation(&self) -> MotionSample {
        MotionSample::new(
            self.orientation[0].load(),
            self.orientation[1].load(),
            self.orientation[2].load(),
        )
    }

    pub fn set_orientation(&self, s: MotionSample) {
        self.orientation[0].store(s.x);
        self.orientation[1].store(s.y);
        self.orientation[2].store(s.z);
    }

    /// Zero the orientation input so the render side stops rotating.
    pub fn clear_orientation(&self) {
        self.set_orientation(MotionSample::ZERO);
    }

    /// Rotation (in degrees per axis) to apply for a frame lasting `dt_secs`.
    pub fn orientation_delta(&self, dt_secs: f32) -> [f32; 3] {
        self.orientation()
            .scaled(dt_secs * ORIENTATION_SCALE)
            .to_array()
    }

    // ── Link bookkeeping ─────────────────────────────────────────────────────

    pub fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link_state.load(Ordering::Acquire))
    }

    pub fn set_link_state(&self, s: LinkState) {
        self.link_state.store(s.as_u8(), Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    pub(crate) fn note_payload(&self) {
        self.payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Payloads received since start (decoded or not).
    pub fn payload_count(&self) -> u64 {
        self.payloads.load(Ordering::Relaxed)
    }

    /// Payloads discarded as malformed.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Link losses (timeouts) since start.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

// ── DriveConfig ──────────────────────────────────────────────────────────────

/// Tuning for [`MotionBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Gain applied to the raw vector before any threshold.  Range 0.01–200.
    pub input_gain: f32,
    /// Global threshold subtracted from the (gated) magnitude.  Range 0–500.
    pub start_threshold: f32,
    /// Gate each axis individually before taking the magnitude.
    pub use_axis_thresholds: bool,
    /// Per-axis gate, in thousands of sensor units (see [`AXIS_THRESHOLD_SCALE`]).
    pub axis_threshold: [f32; 3],
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            input_gain: 1.0,
            start_threshold: 25.0,
            use_axis_thresholds: true,
            axis_threshold: [80.0, 80.0, 80.0],
        }
    }
}

impl DriveConfig {
    /// Copy with every field forced into its documented range.
    pub fn clamped(&self) -> Self {
        Self {
            input_gain: self.input_gain.clamp(0.01, 200.0),
            start_threshold: self.start_threshold.clamp(0.0, 500.0),
            use_axis_thresholds: self.use_axis_thresholds,
            axis_threshold: self.axis_threshold.map(|t| t.max(0.0)),
        }
    }

    /// Magnitude after input gain and (optional) per-axis gating, before the
    /// global threshold.
    pub fn base_magnitude(&self, sample: MotionSample) -> f32 {
        let v = sample.scaled(self.input_gain);
        if self.use_axis_thresholds {
            let gate = |value: f32, threshold: f32| {
                (value.abs() - threshold * AXIS_THRESHOLD_SCALE).max(0.0)
            };
            MotionSample::new(
                gate(v.x, self.axis_threshold[0]),
                gate(v.y, self.axis_threshold[1]),
                gate(v.z, self.axis_threshold[2]),
            )
            .magnitude()
        } else {
            v.magnitude()
        }
    }
}

// ── MotionBridge ─────────────────────────────────────────────────────────────

/// Intermediate values from one bridge step, mostly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeStep {
    /// Magnitude after gain, gating, and the global threshold.
    pub filtered: f32,
    /// `(filtered − previous filtered) / dt`.
    pub jerk: f32,
    /// Energy after this step.
    pub energy: f32,
}

/// Converts motion samples into energy increments on [`DriveState`].
#[derive(Debug, Clone)]
pub struct MotionBridge {
    config: DriveConfig,
    prev_filtered: f32,
}

impl MotionBridge {
    pub fn new(config: DriveConfig) -> Self {
        Self {
            config,
            prev_filtered: 0.0,
        }
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: DriveConfig) {
        self.config = config;
    }

    /// Thresholded magnitude from the previous step.
    pub fn prev_filtered(&self) -> f32 {
        self.prev_filtered
    }

    /// Forget the jerk history, e.g. after the link drops.
    pub fn reset(&mut self) {
        self.prev_filtered = 0.0;
    }

    /// Run one step for `sample`, `dt_secs` after the previous one.
    ///
    /// Energy only ever grows here; decay happens in the audio callback.
    pub fn drive(&mut self, sample: MotionSample, dt_secs: f32, state: &DriveState) -> BridgeStep {
        let base = self.config.base_magnitude(sample);
        let filtered = (base - self.config.start_threshold).max(0.0);
        let jerk = (filtered - self.prev_filtered) / dt_secs.max(MIN_DELTA_SECS);
        self.prev_filtered = filtered;

        let energy = if filtered > 0.0 {
            state.add_energy(filtered * ENERGY_PER_MAGNITUDE + jerk.abs() * ENERGY_PER_JERK)
        } else {
            state.energy()
        };

        BridgeStep {
            filtered,
            jerk,
            energy,
        }
    }
}
