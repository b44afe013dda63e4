//! Aggregate tuning loaded from an optional JSON parameter file.
//!
//! Every section uses `#[serde(default)]`, so a file only needs to name the
//! fields it changes:
//!
//! ```json
//! { "synth": { "level": 0.4, "only_roll": false },
//!   "drive": { "start_threshold": 40.0 } }
//! ```
//!
//! Peripheral identifiers are not part of this file; they come from the
//! command line.

use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::drive::DriveConfig;
use crate::synth::SynthParams;

// ── Effects ──────────────────────────────────────────────────────────────────

/// Room model for the downstream reverb stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReverbPreset {
    Off,
    Generic,
    Room,
    Bathroom,
    #[default]
    Hallway,
    StoneCorridor,
    ConcertHall,
    Cave,
    Arena,
    Hangar,
}

/// Settings for the two effect stages that follow the engine.
///
/// The engine only produces the dry signal; these values are handed to the
/// audio backend untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub reverb_enabled: bool,
    pub reverb_preset: ReverbPreset,
    pub delay_enabled: bool,
    /// Echo time in milliseconds, 10–5000.
    pub delay_ms: f32,
    /// Feedback per repeat, 0–1.
    pub delay_decay: f32,
    /// Wet mix, 0–1.
    pub delay_wet: f32,
    /// Dry mix, 0–1.
    pub delay_dry: f32,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            reverb_enabled: true,
            reverb_preset: ReverbPreset::Hallway,
            delay_enabled: true,
            delay_ms: 470.0,
            delay_decay: 0.272,
            delay_wet: 0.5,
            delay_dry: 1.0,
        }
    }
}

impl EffectsConfig {
    pub fn clamped(&self) -> Self {
        Self {
            delay_ms: self.delay_ms.clamp(10.0, 5000.0),
            delay_decay: self.delay_decay.clamp(0.0, 1.0),
            delay_wet: self.delay_wet.clamp(0.0, 1.0),
            delay_dry: self.delay_dry.clamp(0.0, 1.0),
            ..*self
        }
    }
}

// ── ShakerConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShakerConfig {
    pub drive: DriveConfig,
    pub synth: SynthParams,
    pub effects: EffectsConfig,
}

impl ShakerConfig {
    /// Parse a JSON parameter set.  Missing fields keep their defaults and
    /// every value is clamped into range.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: ShakerConfig = serde_json::from_str(json)?;
        Ok(cfg.clamped())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read parameter file {}: {e}", path.display()))?;
        Self::from_json_str(&text)
            .map_err(|e| anyhow!("Invalid parameter file {}: {e}", path.display()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn clamped(&self) -> Self {
        Self {
            drive: self.drive.clamped(),
            synth: self.synth.clamped(),
            effects: self.effects.clamped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = ShakerConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, ShakerConfig::default());
        assert_eq!(cfg.effects.delay_ms, 470.0);
        assert_eq!(cfg.effects.reverb_preset, ReverbPreset::Hallway);
        assert!(cfg.synth.only_roll);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = ShakerConfig::from_json_str(
            r#"{ "synth": { "level": 0.4 }, "drive": { "axis_threshold": [10, 20, 30] } }"#,
        )
        .unwrap();
        assert_eq!(cfg.synth.level, 0.4);
        assert_eq!(cfg.synth.center_hz, 2500.0);
        assert_eq!(cfg.drive.axis_threshold, [10.0, 20.0, 30.0]);
        assert_eq!(cfg.drive.start_threshold, 25.0);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cfg = ShakerConfig::from_json_str(
            r#"{ "synth": { "center_hz": 99999 }, "effects": { "delay_wet": 3.0 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.synth.center_hz, 6000.0);
        assert_eq!(cfg.effects.delay_wet, 1.0);
    }

    #[test]
    fn preset_names_are_snake_case() {
        let cfg =
            ShakerConfig::from_json_str(r#"{ "effects": { "reverb_preset": "concert_hall" } }"#)
                .unwrap();
        assert_eq!(cfg.effects.reverb_preset, ReverbPreset::ConcertHall);
        assert!(ShakerConfig::from_json_str(r#"{ "effects": { "reverb_preset": "nope" } }"#).is_err());
    }

    #[test]
    fn pretty_json_parses_back() {
        let cfg = ShakerConfig::default();
        let text = cfg.to_json_pretty().unwrap();
        assert_eq!(ShakerConfig::from_json_str(&text).unwrap(), cfg);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = ShakerConfig::from_json_file("/nonexistent/params.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/params.json"));
    }
}
