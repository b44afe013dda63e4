//! The transport seam between the link state machine and a BLE stack.
//!
//! [`Transport`] mirrors a poll-driven native BLE bridge: every operation
//! either fires off a request or drains one queued result, and none of them
//! blocks for longer than a single bounded call.  Transport failures are
//! never surfaced as errors here; they show up as "nothing available yet"
//! ([`ScanStatus::Processing`]) or as an enumeration that finishes without
//! the expected item.
//!
//! | Implementation | Use |
//! |---|---|
//! | [`BleTransport`] | real hardware through btleplug |
//! | [`SimulatedTransport`] | synthetic sensor for running without hardware |
//! | [`ScriptedTransport`] | deterministic event scripts for tests |

mod ble;
mod scripted;
mod simulated;

pub use ble::BleTransport;
pub use scripted::{ScriptedTransport, TransportCall};
pub use simulated::SimulatedTransport;

/// Result of polling one of the transport's result queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus<T> {
    /// One queued result.
    Available(T),
    /// Nothing queued right now; the operation is still running.
    Processing,
    /// The operation has completed and its queue is drained.
    Finished,
}

impl<T> ScanStatus<T> {
    pub fn is_available(&self) -> bool {
        matches!(self, ScanStatus::Available(_))
    }
}

/// A peripheral reported during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Transport-assigned handle, stable for the life of the transport.
    pub id: String,
    /// Advertised local name; empty if the peripheral advertises none.
    pub name: String,
}

/// A characteristic reported while enumerating a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubChannel {
    pub id: String,
    /// Free-form description (user description or property flags).
    pub description: String,
}

/// Poll-driven access to one BLE stack.
///
/// Methods take `&self` so that the ingestion worker and the code that shuts
/// it down can share one instance; implementations use interior mutability.
pub trait Transport: Send + Sync {
    /// Begin (or restart) discovery.  Drops any link left over from a
    /// previous session.
    fn start_scan(&self);

    fn stop_scan(&self);

    /// Next discovered peripheral, if any.
    fn poll_discovered_device(&self) -> ScanStatus<DiscoveredDevice>;

    /// Connect to `device_id` if needed and start enumerating its services.
    fn enumerate_groups(&self, device_id: &str);

    /// Next enumerated service identifier.
    fn poll_group(&self) -> ScanStatus<String>;

    /// Start enumerating the characteristics of one service.
    fn enumerate_sub_channels(&self, device_id: &str, group_id: &str);

    fn poll_sub_channel(&self) -> ScanStatus<SubChannel>;

    /// Enable or disable notifications.  Returns `true` on success.
    fn subscribe(&self, device_id: &str, group_id: &str, sub_id: &str, enable: bool) -> bool;

    /// Next notification payload, if one has arrived.
    fn poll_payload(&self) -> Option<Vec<u8>>;

    /// Abort all in-flight work.  Every later call becomes a cheap no-op.
    fn quit(&self);
}
