//! # gyro-shaker
//!
//! Turn the angular-rate stream of a Bluetooth LE gyroscope sensor into a
//! real-time procedural shaker sound.
//!
//! ## Pipeline
//!
//! ```text
//!  BLE transport ─▶ LinkStateMachine ─▶ decode_motion ─▶ MotionBridge
//!                    (ingestion thread)                       │
//!                                                    DriveState (atomics)
//!                                                             │
//!                                     cpal callback ─▶ ShakerEngine
//! ```
//!
//! The ingestion side and the audio side share nothing but [`drive::DriveState`],
//! whose fields are all lock-free atomics; the audio callback never blocks.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use gyro_shaker::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let transport: Arc<dyn Transport> = Arc::new(BleTransport::new()?);
//!     let session = Session::start(
//!         transport,
//!         LinkConfig::default(),
//!         ShakerConfig::default(),
//!         12345,
//!         true,
//!     )?;
//!     std::thread::sleep(std::time::Duration::from_secs(30));
//!     println!("{}", session.status_line());
//!     session.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Using as a library dependency
//!
//! ```toml
//! [dependencies]
//! # Full build (includes the ratatui monitor):
//! gyro-shaker = "0.1"
//!
//! # Library only, skips ratatui / crossterm compilation:
//! gyro-shaker = { version = "0.1", default-features = false }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`link`] | Discovery/subscription state machine and the ingestion worker thread |
//! | [`transport`] | The poll-driven BLE seam plus btleplug, simulated, and scripted backends |
//! | [`parse`] | `"gx,gy,gz"` payload decoder |
//! | [`drive`] | Shared atomic drive state and the motion-to-energy bridge |
//! | [`dsp`] | Biquad sections, coefficient designs, xorshift noise |
//! | [`synth`] | The friction + roll shaker engine |
//! | [`audio`] | cpal output stream hosting the engine |
//! | [`config`] | JSON parameter file and effect pass-through settings |
//! | [`session`] | One running session: worker, audio, live parameters |
//! | [`cli`] | Command-line arguments shared by the binaries |
//! | [`protocol`] | GATT UUIDs, link timing, identifier normalisation |
//! | [`types`] | Motion samples, channel descriptors, link states |

pub mod audio;
pub mod cli;
pub mod config;
pub mod drive;
pub mod dsp;
pub mod link;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod synth;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Link ──────────────────────────────────────────────────────────────────
    pub use crate::link::{IngestionWorker, LinkConfig, LinkStateMachine, StopSignal};
    pub use crate::transport::{
        BleTransport, ScanStatus, ScriptedTransport, SimulatedTransport, Transport,
    };

    // ── Signal path ───────────────────────────────────────────────────────────
    pub use crate::audio::AudioOutput;
    pub use crate::drive::{DriveConfig, DriveState, MotionBridge};
    pub use crate::parse::decode_motion;
    pub use crate::synth::{param_channel, ShakerEngine, SynthParams};

    // ── Configuration and types ───────────────────────────────────────────────
    pub use crate::config::{EffectsConfig, ReverbPreset, ShakerConfig};
    pub use crate::session::Session;
    pub use crate::types::{ChannelDescriptor, LinkState, MotionSample};
}
