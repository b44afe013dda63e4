//! Command-line arguments shared by both binaries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::config::ShakerConfig;
use crate::dsp::XorShift32;
use crate::link::LinkConfig;
use crate::protocol::{DEFAULT_DEVICE_NAME, GYRO_CHARACTERISTIC_UUID, GYRO_SERVICE_UUID};
use crate::transport::{BleTransport, SimulatedTransport, Transport};
use crate::types::ChannelDescriptor;

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "gyro-shaker")]
#[command(about = "Play a BLE gyroscope sensor as a procedural shaker", long_about = None)]
pub struct Args {
    /// Advertised name of the sensor (exact match)
    #[arg(long, value_name = "NAME", default_value = DEFAULT_DEVICE_NAME)]
    pub device: String,

    /// GATT service carrying the gyro stream
    #[arg(long, value_name = "UUID", default_value_t = GYRO_SERVICE_UUID.to_string())]
    pub service: String,

    /// Notify characteristic inside the service
    #[arg(long, value_name = "UUID", default_value_t = GYRO_CHARACTERISTIC_UUID.to_string())]
    pub characteristic: String,

    /// JSON parameter file (drive, synth, and effects sections)
    #[arg(long, value_name = "FILE")]
    pub params: Option<PathBuf>,

    /// Friction output level, overriding the parameter file (0–1)
    #[arg(long, value_name = "LEVEL")]
    pub level: Option<f32>,

    /// Use a simulated sensor instead of Bluetooth
    #[arg(long)]
    pub simulate: bool,

    /// Noise seed; defaults to a clock-derived value
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u32>,

    /// Print the effective parameters as JSON and exit
    #[arg(long)]
    pub dump_params: bool,
}

impl Args {
    pub fn channel(&self) -> ChannelDescriptor {
        ChannelDescriptor::new(self.service.clone(), self.characteristic.clone())
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            device_name: self.device.clone(),
            channel: self.channel(),
            ..LinkConfig::default()
        }
    }

    /// Parameter file (if any) with the `--level` override applied.
    pub fn shaker_config(&self) -> Result<ShakerConfig> {
        let mut cfg = match &self.params {
            Some(path) => {
                info!("Loading parameters from {}", path.display());
                ShakerConfig::from_json_file(path)?
            }
            None => ShakerConfig::default(),
        };
        if let Some(level) = self.level {
            cfg.synth.level = level;
        }
        Ok(cfg.clamped())
    }

    /// The effective parameters as a JSON document that `--params` accepts.
    pub fn params_json(&self) -> Result<String> {
        self.shaker_config()?.to_json_pretty()
    }

    pub fn seed(&self) -> u32 {
        self.seed.unwrap_or_else(|| XorShift32::from_time().next_u32())
    }

    /// The simulated sensor with `--simulate`, otherwise the first BLE adapter.
    pub fn transport(&self) -> Result<Arc<dyn Transport>> {
        if self.simulate {
            info!("Using simulated sensor {:?}", self.device);
            let seed = self.seed.unwrap_or(1);
            Ok(Arc::new(SimulatedTransport::new(
                self.device.clone(),
                self.channel(),
                seed,
            )))
        } else {
            Ok(Arc::new(BleTransport::new()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_gyro_sensor() {
        let args = Args::parse_from(["gyro-shaker"]);
        let link = args.link_config();
        assert_eq!(link.device_name, "ESP32_BLE_IMU");
        assert!(link.channel.matches_group("12345678-1234-1234-1234-1234567890AB"));
        assert!(link.channel.matches_sub("{abcdefab-1234-1234-1234-abcdefabcdef}"));
        assert!(!args.simulate);
    }

    #[test]
    fn level_flag_overrides_and_is_clamped() {
        let args = Args::parse_from(["gyro-shaker", "--level", "3.5"]);
        assert_eq!(args.shaker_config().unwrap().synth.level, 1.0);
        let args = Args::parse_from(["gyro-shaker", "--level", "0.25"]);
        assert_eq!(args.shaker_config().unwrap().synth.level, 0.25);
    }

    #[test]
    fn dumped_params_reload_to_the_same_config() {
        let args = Args::parse_from(["gyro-shaker", "--dump-params", "--level", "0.4"]);
        assert!(args.dump_params);
        let json = args.params_json().unwrap();
        let reloaded = ShakerConfig::from_json_str(&json).unwrap();
        assert_eq!(reloaded, args.shaker_config().unwrap());
        assert_eq!(reloaded.synth.level, 0.4);
    }

    #[test]
    fn explicit_seed_is_used_verbatim() {
        let args = Args::parse_from(["gyro-shaker", "--seed", "77", "--simulate"]);
        assert_eq!(args.seed(), 77);
        assert!(args.simulate);
    }

    #[test]
    fn custom_identifiers_flow_into_link_config() {
        let args = Args::parse_from([
            "gyro-shaker",
            "--device",
            "Wand",
            "--service",
            "{AAAA}",
            "--characteristic",
            "bbbb",
        ]);
        let link = args.link_config();
        assert_eq!(link.device_name, "Wand");
        assert!(link.channel.matches_group("aaaa"));
        assert!(link.channel.matches_sub("BBBB"));
    }
}
