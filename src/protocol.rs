//! GATT identifiers, link timing constants, and identifier normalisation for
//! the gyroscope sensor peripheral.
//!
//! The sensor firmware (an ESP32 running a BLE GATT server) exposes one
//! vendor service with one notify characteristic.  Each notification is a
//! short ASCII string `"gx,gy,gz"`; see [`crate::parse`] for the decoder.

use std::time::Duration;

use uuid::Uuid;

// ── Peripheral ───────────────────────────────────────────────────────────────

/// Advertised local name of the sensor peripheral.
///
/// Matched exactly (case-sensitive) against the name reported during
/// discovery.
pub const DEFAULT_DEVICE_NAME: &str = "ESP32_BLE_IMU";

/// Vendor GATT service carrying the gyroscope stream.
pub const GYRO_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ab);

/// Notify characteristic inside [`GYRO_SERVICE_UUID`].
///
/// One notification per sensor sample, payload `"gx,gy,gz"` in ASCII.
pub const GYRO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xabcdefab_1234_1234_1234_abcdefabcdef);

// ── Link timing ──────────────────────────────────────────────────────────────

/// Poll cadence while scanning for the peripheral.
pub const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll cadence during service discovery, subscription, and streaming.
pub const DATA_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Silence after which a streaming link is declared lost.
///
/// Counted from the last received payload (or from the moment the link
/// entered the streaming state if nothing has arrived yet).
pub const LINK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Upper bound on connect + service/characteristic enumeration.
///
/// BlueZ in particular can take several seconds to populate its GATT cache;
/// a discovery that has not finished after this long is treated like a lost
/// link and scanning restarts.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

// ── Identifier normalisation ─────────────────────────────────────────────────

/// Normalise a textual service/characteristic identifier for comparison.
///
/// Platform stacks disagree on formatting: Windows reports
/// `{12345678-…}` with braces and upper-case hex, BlueZ reports lower-case
/// without braces.  Normalising trims surrounding whitespace, lower-cases, and
/// strips every `{` / `}` so all of these compare equal.
///
/// ```
/// # use gyro_shaker::protocol::normalize_id;
/// assert_eq!(normalize_id(" {ABCD-01} "), "abcd-01");
/// assert_eq!(normalize_id("abcd-01"), normalize_id("{ABCD-01}"));
/// ```
pub fn normalize_id(id: &str) -> String {
    id.trim()
        .to_lowercase()
        .chars()
        .filter(|&c| c != '{' && c != '}')
        .collect()
}

/// `true` when two identifiers are equal after [`normalize_id`].
pub fn ids_match(a: &str, b: &str) -> bool {
    normalize_id(a) == normalize_id(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_equates_case_braces_and_whitespace() {
        let pairs = [
            ("ABCDEF", "abcdef"),
            ("abcdef", "{abcdef}"),
            (" abcdef ", "ABCDEF"),
            ("{12345678-1234-1234-1234-1234567890AB}", "12345678-1234-1234-1234-1234567890ab"),
        ];
        for (a, b) in pairs {
            assert_eq!(normalize_id(a), normalize_id(b), "{a:?} vs {b:?}");
            assert!(ids_match(a, b));
        }
    }

    #[test]
    fn normalisation_keeps_distinct_ids_distinct() {
        assert!(!ids_match("abcd-01", "abcd-02"));
        assert!(!ids_match("", "abcd"));
    }

    #[test]
    fn default_uuids_render_in_gatt_form() {
        assert_eq!(
            GYRO_SERVICE_UUID.to_string(),
            "12345678-1234-1234-1234-1234567890ab"
        );
        assert_eq!(
            GYRO_CHARACTERISTIC_UUID.to_string(),
            "abcdefab-1234-1234-1234-abcdefabcdef"
        );
    }

    #[test]
    fn link_timeout_exceeds_poll_cadence() {
        assert!(LINK_TIMEOUT > SCAN_POLL_INTERVAL);
        assert!(LINK_TIMEOUT > DATA_POLL_INTERVAL);
        assert!(DISCOVERY_TIMEOUT > LINK_TIMEOUT);
    }
}
