//! Wiring of one running sonification session.
//!
//! A [`Session`] owns the ingestion worker, the audio stream, and the two
//! live-parameter channels: synth parameters go to the audio callback and
//! drive parameters go to the link worker.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

use crate::audio::AudioOutput;
use crate::cli::Args;
use crate::config::ShakerConfig;
use crate::drive::{DriveConfig, DriveState};
use crate::link::{IngestionWorker, LinkConfig, LinkStateMachine};
use crate::synth::{param_channel, ShakerEngine, SynthParams};
use crate::transport::Transport;

/// Nominal rate used to build the engine before the device rate is known.
const NOMINAL_SAMPLE_RATE: f32 = 48_000.0;

pub struct Session {
    drive: Arc<DriveState>,
    config: ShakerConfig,
    device_name: String,
    worker: Option<IngestionWorker>,
    audio: Option<AudioOutput>,
    synth_tx: mpsc::Sender<SynthParams>,
    drive_tx: watch::Sender<DriveConfig>,
}

impl Session {
    /// Build the transport and configuration from `args` and start.
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = args.shaker_config()?;
        let transport = args.transport()?;
        Self::start(transport, args.link_config(), config, args.seed(), true)
    }

    /// Start the ingestion worker and, if `with_audio`, the audio output.
    ///
    /// An unavailable audio device is logged and the session keeps running
    /// without sound.
    pub fn start(
        transport: Arc<dyn Transport>,
        link: LinkConfig,
        config: ShakerConfig,
        seed: u32,
        with_audio: bool,
    ) -> Result<Self> {
        let drive = Arc::new(DriveState::new());
        let device_name = link.device_name.clone();

        let (drive_tx, drive_rx) = watch::channel(config.drive);
        let machine = LinkStateMachine::new(transport, link, Arc::clone(&drive), config.drive)
            .with_drive_updates(drive_rx);
        let worker = IngestionWorker::spawn(machine)?;

        let (synth_tx, synth_rx) = param_channel();
        let audio = if with_audio {
            info!("Noise seed: {seed}");
            let engine = ShakerEngine::new(config.synth, NOMINAL_SAMPLE_RATE, seed, Arc::clone(&drive))
                .with_param_updates(synth_rx);
            match AudioOutput::start(engine, &config.effects) {
                Ok(out) => Some(out),
                Err(e) => {
                    warn!("Audio disabled: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            drive,
            config,
            device_name,
            worker: Some(worker),
            audio,
            synth_tx,
            drive_tx,
        })
    }

    pub fn drive(&self) -> &Arc<DriveState> {
        &self.drive
    }

    pub fn config(&self) -> &ShakerConfig {
        &self.config
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn audio(&self) -> Option<&AudioOutput> {
        self.audio.as_ref()
    }

    /// Push new synth parameters to the audio callback.
    ///
    /// Returns `false` if the channel is full; the caller can retry on its
    /// next frame.
    pub fn set_synth_params(&mut self, params: SynthParams) -> bool {
        let params = params.clamped();
        match self.synth_tx.try_send(params) {
            Err(TrySendError::Full(_)) => false,
            // Closed means there is no audio output; keep the values anyway.
            Ok(()) | Err(TrySendError::Closed(_)) => {
                self.config.synth = params;
                true
            }
        }
    }

    pub fn set_drive_config(&mut self, drive: DriveConfig) {
        let drive = drive.clamped();
        self.config.drive = drive;
        self.drive_tx.send_replace(drive);
    }

    /// One-line summary of link, energy, and counters.
    pub fn status_line(&self) -> String {
        let d = &self.drive;
        let o = d.orientation();
        format!(
            "[{}] energy={:.3}  gyro=({:+.0}, {:+.0}, {:+.0})  payloads={} rejected={} reconnects={}",
            d.link_state(),
            d.energy(),
            o.x,
            o.y,
            o.z,
            d.payload_count(),
            d.rejected_count(),
            d.reconnect_count()
        )
    }

    /// Stop the worker and then the audio stream.
    pub fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        self.audio = None;
        info!("Session closed.");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::transport::ScriptedTransport;

    fn scripted_session() -> (Arc<ScriptedTransport>, Session) {
        let t = Arc::new(ScriptedTransport::new());
        let s = Session::start(
            t.clone(),
            LinkConfig::default(),
            ShakerConfig::default(),
            1,
            false,
        )
        .unwrap();
        (t, s)
    }

    #[test]
    fn shutdown_quits_the_transport() {
        let (t, s) = scripted_session();
        assert!(s.audio().is_none());
        s.shutdown();
        assert!(t.has_quit());
    }

    #[test]
    fn live_parameter_updates_are_clamped_and_recorded() {
        let (_t, mut s) = scripted_session();
        assert!(s.set_synth_params(SynthParams {
            level: 9.0,
            ..SynthParams::default()
        }));
        assert_eq!(s.config().synth.level, 1.0);

        s.set_drive_config(DriveConfig {
            start_threshold: -5.0,
            ..DriveConfig::default()
        });
        assert_eq!(s.config().drive.start_threshold, 0.0);
        s.shutdown();
    }

    #[test]
    fn status_line_reports_link_state() {
        let (_t, s) = scripted_session();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !s.status_line().starts_with("[scanning]") && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(s.status_line().starts_with("[scanning]"));
        s.shutdown();
    }
}
