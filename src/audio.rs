//! cpal output backend for [`ShakerEngine`].
//!
//! The stream runs at the default output device's default configuration.
//! Each hardware buffer is zeroed, the engine adds its signal into it, and
//! the feedback [`Echo`] (when enabled) runs over the result.  For integer
//! sample formats the chain renders into a scratch buffer that is allocated
//! once up front, and the result is hard-clipped to `[-1, 1]` before
//! conversion.
//!
//! The reverb settings in [`EffectsConfig`] are accepted but not rendered.

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use log::{error, info};

use crate::config::EffectsConfig;
use crate::dsp::Echo;
use crate::synth::ShakerEngine;

/// Frames rendered per pass through the scratch buffer.
const SCRATCH_FRAMES: usize = 1024;

/// A running output stream.  Dropping it stops playback.
pub struct AudioOutput {
    _stream: cpal::Stream,
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutput {
    /// Open the default output device and start playing `engine` through
    /// the effects in `effects`.
    ///
    /// The engine's filters are redesigned for the device's sample rate
    /// before the first callback.
    pub fn start(mut engine: ShakerEngine, effects: &EffectsConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No audio output device found"))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .default_output_config()
            .map_err(|e| anyhow!("Failed to get audio config: {e}"))?;
        let format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let channels = config.channels;
        let sample_rate = config.sample_rate.0;

        engine.set_sample_rate(sample_rate as f32);
        info!("Audio: {device_name} @ {sample_rate} Hz, {channels} ch, {format:?}");
        log_effects(effects);
        let chain = OutputChain::new(engine, effects, sample_rate as f32, channels as usize);

        let stream = match format {
            SampleFormat::F32 => build_f32_stream(&device, &config, chain)?,
            SampleFormat::I16 => build_converting_stream::<i16>(&device, &config, chain)?,
            SampleFormat::U16 => build_converting_stream::<u16>(&device, &config, chain)?,
            other => return Err(anyhow!("Unsupported output sample format {other:?}")),
        };
        stream
            .play()
            .map_err(|e| anyhow!("Failed to start audio stream: {e}"))?;

        Ok(Self {
            _stream: stream,
            device_name,
            sample_rate,
            channels,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

fn log_effects(fx: &EffectsConfig) {
    if fx.reverb_enabled {
        info!("Reverb: {:?} requested, not applied", fx.reverb_preset);
    }
    if fx.delay_enabled {
        info!(
            "Delay: {} ms, decay {}, wet {}, dry {}",
            fx.delay_ms, fx.delay_decay, fx.delay_wet, fx.delay_dry
        );
    } else {
        info!("Delay: off");
    }
}

fn stream_error(err: cpal::StreamError) {
    error!("Audio stream error: {err}");
}

// ── Output chain ─────────────────────────────────────────────────────────────

/// The engine followed by the optional echo.
struct OutputChain {
    engine: ShakerEngine,
    echo: Option<Echo>,
    channels: usize,
}

impl OutputChain {
    fn new(engine: ShakerEngine, fx: &EffectsConfig, sample_rate: f32, channels: usize) -> Self {
        let fx = fx.clamped();
        let echo = fx.delay_enabled.then(|| {
            Echo::new(
                fx.delay_ms,
                fx.delay_decay,
                fx.delay_wet,
                fx.delay_dry,
                sample_rate,
                channels,
            )
        });
        Self {
            engine,
            echo,
            channels,
        }
    }

    /// Overwrite `buf` with the next block of output.
    fn render(&mut self, buf: &mut [f32]) {
        buf.fill(0.0);
        self.engine.process(buf, self.channels);
        if let Some(echo) = self.echo.as_mut() {
            echo.process(buf);
        }
    }
}

fn build_f32_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut chain: OutputChain,
) -> Result<cpal::Stream> {
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| chain.render(data),
            stream_error,
            None,
        )
        .map_err(|e| anyhow!("Failed to build audio stream: {e}"))
}

fn build_converting_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut chain: OutputChain,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * chain.channels.max(1)];
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                render_converted(&mut chain, &mut scratch, data);
            },
            stream_error,
            None,
        )
        .map_err(|e| anyhow!("Failed to build audio stream: {e}"))
}

/// Render `out.len()` samples through `scratch`, one scratch-full at a time.
///
/// `scratch.len()` must be a multiple of the channel count so passes stay
/// frame-aligned.
fn render_converted<T>(chain: &mut OutputChain, scratch: &mut [f32], out: &mut [T])
where
    T: FromSample<f32>,
{
    if scratch.is_empty() {
        return;
    }
    for chunk in out.chunks_mut(scratch.len()) {
        let buf = &mut scratch[..chunk.len()];
        chain.render(buf);
        for (o, &s) in chunk.iter_mut().zip(buf.iter()) {
            *o = T::from_sample_(s.clamp(-1.0, 1.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::drive::DriveState;
    use crate::synth::SynthParams;

    const FS: f32 = 48_000.0;

    fn loud_engine() -> (ShakerEngine, Arc<DriveState>) {
        let drive = Arc::new(DriveState::new());
        drive.set_energy(1.0);
        let params = SynthParams {
            level: 1.0,
            only_roll: false,
            ..SynthParams::default()
        };
        (ShakerEngine::new(params, FS, 9, Arc::clone(&drive)), drive)
    }

    fn dry() -> EffectsConfig {
        EffectsConfig {
            delay_enabled: false,
            ..EffectsConfig::default()
        }
    }

    #[test]
    fn integer_output_matches_f32_render() {
        let (mut a, _) = loud_engine();
        let (b, _) = loud_engine();

        let mut reference = vec![0.0f32; 2 * 300];
        a.process(&mut reference[..2 * 128], 2);
        a.process(&mut reference[2 * 128..2 * 256], 2);
        a.process(&mut reference[2 * 256..], 2);

        let mut chain = OutputChain::new(b, &dry(), FS, 2);
        let mut scratch = vec![0.0f32; 2 * 128];
        let mut out = vec![0i16; 2 * 300];
        render_converted(&mut chain, &mut scratch, &mut out);

        for (o, r) in out.iter().zip(&reference) {
            assert_eq!(*o, i16::from_sample_(r.clamp(-1.0, 1.0)));
        }
    }

    #[test]
    fn unsigned_output_moves_off_midpoint() {
        let (eng, _) = loud_engine();
        let mut chain = OutputChain::new(eng, &dry(), FS, 1);
        let mut scratch = vec![0.0f32; 64];
        let mut out = vec![0u16; 4096];
        render_converted(&mut chain, &mut scratch, &mut out);
        assert!(out.iter().any(|&s| s != u16::from_sample_(0.0f32)));
    }

    #[test]
    fn empty_scratch_leaves_output_untouched() {
        let (eng, drive) = loud_engine();
        let mut chain = OutputChain::new(eng, &dry(), FS, 2);
        let mut out = vec![7i16; 8];
        render_converted(&mut chain, &mut [], &mut out);
        assert!(out.iter().all(|&s| s == 7));
        assert_eq!(drive.energy(), 1.0);
    }

    #[test]
    fn disabled_delay_builds_no_echo() {
        let (eng, _) = loud_engine();
        assert!(OutputChain::new(eng, &dry(), FS, 2).echo.is_none());
    }

    #[test]
    fn echo_runs_after_the_engine() {
        let fx = EffectsConfig::default();
        let (mut eng, _) = loud_engine();
        let mut echo = Echo::new(fx.delay_ms, fx.delay_decay, fx.delay_wet, fx.delay_dry, FS, 2);
        let mut reference = vec![0.0f32; 2 * 30_000];
        for block in reference.chunks_mut(2 * 512) {
            eng.process(block, 2);
            echo.process(block);
        }

        let (eng, _) = loud_engine();
        let mut chain = OutputChain::new(eng, &fx, FS, 2);
        assert_eq!(chain.echo.as_ref().map(Echo::len), Some(2 * 22_560));
        let mut out = vec![0.0f32; 2 * 30_000];
        for block in out.chunks_mut(2 * 512) {
            chain.render(block);
        }
        assert_eq!(out, reference);
    }

    #[test]
    fn delay_setting_is_clamped_before_allocating() {
        let fx = EffectsConfig {
            delay_ms: 60_000.0,
            ..EffectsConfig::default()
        };
        let (eng, _) = loud_engine();
        let chain = OutputChain::new(eng, &fx, FS, 1);
        assert_eq!(chain.echo.as_ref().map(Echo::len), Some(240_000));
    }
}
