use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DiscoveredDevice, ScanStatus, SubChannel, Transport};

/// One call made against a [`ScriptedTransport`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan,
    StopScan,
    EnumerateGroups {
        device_id: String,
    },
    EnumerateSubChannels {
        device_id: String,
        group_id: String,
    },
    Subscribe {
        device_id: String,
        group_id: String,
        sub_id: String,
        enable: bool,
    },
    Quit,
}

#[derive(Default)]
struct Script {
    devices: VecDeque<DiscoveredDevice>,
    services: Vec<String>,
    characteristics: HashMap<String, Vec<SubChannel>>,
    group_queue: Option<VecDeque<String>>,
    sub_queue: Option<VecDeque<SubChannel>>,
    discovery_stalled: bool,
    subscribe_ok: bool,
    payloads: VecDeque<Vec<u8>>,
    calls: Vec<TransportCall>,
    quit: bool,
}

/// An in-memory [`Transport`] whose events are pushed by the caller.
///
/// The peripheral's GATT layout is declared up front with
/// [`with_service`](Self::with_service); discovered devices and payloads are
/// queued at any time and handed out one per poll.  Every call is recorded
/// for later inspection with [`calls`](Self::calls).
///
/// ```
/// # use gyro_shaker::transport::{ScriptedTransport, Transport, ScanStatus};
/// let t = ScriptedTransport::new().with_service("svc", &["chr"]);
/// t.push_device("dev-1", "Sensor");
/// t.start_scan();
/// assert!(t.poll_discovered_device().is_available());
/// assert_eq!(t.poll_discovered_device(), ScanStatus::Processing);
/// ```
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                subscribe_ok: true,
                ..Script::default()
            }),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a service and its characteristics on the scripted peripheral.
    pub fn with_service(self, group_id: &str, sub_ids: &[&str]) -> Self {
        {
            let mut s = self.script();
            s.services.push(group_id.to_owned());
            s.characteristics.insert(
                group_id.to_owned(),
                sub_ids
                    .iter()
                    .map(|id| SubChannel {
                        id: (*id).to_owned(),
                        description: format!("scripted {id}"),
                    })
                    .collect(),
            );
        }
        self
    }

    pub fn push_device(&self, id: &str, name: &str) {
        self.script().devices.push_back(DiscoveredDevice {
            id: id.to_owned(),
            name: name.to_owned(),
        });
    }

    pub fn push_payload(&self, bytes: &[u8]) {
        self.script().payloads.push_back(bytes.to_vec());
    }

    /// Result returned by every later [`Transport::subscribe`] call.
    pub fn set_subscribe_result(&self, ok: bool) {
        self.script().subscribe_ok = ok;
    }

    /// While stalled, service and characteristic polls report `Processing`.
    pub fn set_discovery_stalled(&self, stalled: bool) {
        self.script().discovery_stalled = stalled;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.script().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }

    pub fn pending_payloads(&self) -> usize {
        self.script().payloads.len()
    }

    pub fn has_quit(&self) -> bool {
        self.script().quit
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ScriptedTransport {
    fn start_scan(&self) {
        self.script().calls.push(TransportCall::StartScan);
    }

    fn stop_scan(&self) {
        self.script().calls.push(TransportCall::StopScan);
    }

    fn poll_discovered_device(&self) -> ScanStatus<DiscoveredDevice> {
        match self.script().devices.pop_front() {
            Some(d) => ScanStatus::Available(d),
            None => ScanStatus::Processing,
        }
    }

    fn enumerate_groups(&self, device_id: &str) {
        let mut s = self.script();
        s.calls.push(TransportCall::EnumerateGroups {
            device_id: device_id.to_owned(),
        });
        s.group_queue = Some(s.services.iter().cloned().collect());
    }

    fn poll_group(&self) -> ScanStatus<String> {
        let mut s = self.script();
        if s.discovery_stalled {
            return ScanStatus::Processing;
        }
        match s.group_queue.as_mut().and_then(VecDeque::pop_front) {
            Some(g) => ScanStatus::Available(g),
            None => ScanStatus::Finished,
        }
    }

    fn enumerate_sub_channels(&self, device_id: &str, group_id: &str) {
        let mut s = self.script();
        s.calls.push(TransportCall::EnumerateSubChannels {
            device_id: device_id.to_owned(),
            group_id: group_id.to_owned(),
        });
        let chars = s.characteristics.get(group_id).cloned().unwrap_or_default();
        s.sub_queue = Some(chars.into());
    }

    fn poll_sub_channel(&self) -> ScanStatus<SubChannel> {
        let mut s = self.script();
        if s.discovery_stalled {
            return ScanStatus::Processing;
        }
        match s.sub_queue.as_mut().and_then(VecDeque::pop_front) {
            Some(c) => ScanStatus::Available(c),
            None => ScanStatus::Finished,
        }
    }

    fn subscribe(&self, device_id: &str, group_id: &str, sub_id: &str, enable: bool) -> bool {
        let mut s = self.script();
        s.calls.push(TransportCall::Subscribe {
            device_id: device_id.to_owned(),
            group_id: group_id.to_owned(),
            sub_id: sub_id.to_owned(),
            enable,
        });
        s.subscribe_ok
    }

    fn poll_payload(&self) -> Option<Vec<u8>> {
        self.script().payloads.pop_front()
    }

    fn quit(&self) {
        let mut s = self.script();
        s.quit = true;
        s.calls.push(TransportCall::Quit);
    }
}
