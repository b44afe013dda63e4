use std::fmt;

use crate::protocol::{ids_match, GYRO_CHARACTERISTIC_UUID, GYRO_SERVICE_UUID};

/// One decoded angular-rate reading from the sensor.
///
/// Components are **negated** relative to the raw payload so that the vector
/// matches the right-handed orientation convention of the render side
/// (see [`crate::parse::decode_motion`]).  Units are whatever the firmware
/// sends; the shipped firmware sends raw gyro counts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl MotionSample {
    pub const ZERO: MotionSample = MotionSample {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length of the vector.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Component-wise multiplication by a scalar.
    pub fn scaled(&self, k: f32) -> Self {
        Self {
            x: self.x * k,
            y: self.y * k,
            z: self.z * k,
        }
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// The `(group-id, sub-id)` pair identifying the single data source on the
/// peripheral: a GATT service and one of its characteristics.
///
/// Both identifiers are stored as given and compared only after
/// [`crate::protocol::normalize_id`], so `"{ABCD}"` matches `"abcd"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub group_id: String,
    pub sub_id: String,
}

impl ChannelDescriptor {
    pub fn new(group_id: impl Into<String>, sub_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            sub_id: sub_id.into(),
        }
    }

    /// `true` if an enumerated service identifier is the target group.
    pub fn matches_group(&self, group_id: &str) -> bool {
        ids_match(&self.group_id, group_id)
    }

    /// `true` if an enumerated characteristic identifier is the target sub-channel.
    pub fn matches_sub(&self, sub_id: &str) -> bool {
        ids_match(&self.sub_id, sub_id)
    }
}

impl Default for ChannelDescriptor {
    fn default() -> Self {
        Self::new(
            GYRO_SERVICE_UUID.to_string(),
            GYRO_CHARACTERISTIC_UUID.to_string(),
        )
    }
}

/// Lifecycle state of the link state machine.
///
/// ```text
/// Idle ──name match──▶ ServiceDiscovery ──groups done──▶ Subscribing
///  ▲                                                         │
///  └──────── 2 s without payload ◀── Connected ◀──subs done──┘
/// ```
///
/// Discovery and subscription also fall back to `Idle` if they exceed
/// [`crate::protocol::DISCOVERY_TIMEOUT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Scanning for the target peripheral; no handle bound.
    #[default]
    Idle,
    /// Handle bound, enumerating the peripheral's services.
    ServiceDiscovery,
    /// Enumerating characteristics of matching services and subscribing.
    Subscribing,
    /// Streaming payloads; the timeout clock is running.
    Connected,
}

impl LinkState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            LinkState::Idle => 0,
            LinkState::ServiceDiscovery => 1,
            LinkState::Subscribing => 2,
            LinkState::Connected => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::ServiceDiscovery,
            2 => LinkState::Subscribing,
            3 => LinkState::Connected,
            _ => LinkState::Idle,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Idle => "scanning",
            LinkState::ServiceDiscovery => "discovering services",
            LinkState::Subscribing => "subscribing",
            LinkState::Connected => "connected",
        };
        f.write_str(s)
    }
}
