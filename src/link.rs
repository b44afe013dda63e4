//! Link state machine and the background ingestion worker.
//!
//! [`LinkStateMachine`] finds the sensor by advertised name, binds its gyro
//! characteristic, and streams payloads through the decoder and the
//! [`MotionBridge`].  It is driven one non-blocking [`tick`](LinkStateMachine::tick)
//! at a time; each tick returns how long to wait before the next one.  If the
//! stream goes quiet for [`LinkConfig::link_timeout`] the handle is dropped
//! and discovery restarts from scratch.
//!
//! [`IngestionWorker`] runs the machine on a dedicated thread until stopped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::drive::{DriveConfig, DriveState, MotionBridge};
use crate::parse::decode_motion;
use crate::protocol::{
    DATA_POLL_INTERVAL, DEFAULT_DEVICE_NAME, DISCOVERY_TIMEOUT, LINK_TIMEOUT, SCAN_POLL_INTERVAL,
};
use crate::transport::{ScanStatus, Transport};
use crate::types::{ChannelDescriptor, LinkState};

/// Log the first few payloads, then one in this many.
const PAYLOAD_LOG_EVERY: u64 = 500;

// ── LinkConfig ───────────────────────────────────────────────────────────────

/// Target peripheral and link timing.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Advertised name to connect to, matched exactly.  Default: `"ESP32_BLE_IMU"`.
    pub device_name: String,
    /// Service and characteristic carrying the gyro stream.
    pub channel: ChannelDescriptor,
    /// Sleep between ticks while scanning.  Default: 100 ms.
    pub scan_poll_interval: Duration,
    /// Sleep between ticks in every other state.  Default: 20 ms.
    pub data_poll_interval: Duration,
    /// Silence after which a streaming link is declared lost.  Default: 2 s.
    pub link_timeout: Duration,
    /// Upper bound on service discovery plus subscription.  Default: 15 s.
    pub discovery_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.into(),
            channel: ChannelDescriptor::default(),
            scan_poll_interval: SCAN_POLL_INTERVAL,
            data_poll_interval: DATA_POLL_INTERVAL,
            link_timeout: LINK_TIMEOUT,
            discovery_timeout: DISCOVERY_TIMEOUT,
        }
    }
}

// ── StopSignal ───────────────────────────────────────────────────────────────

/// Cloneable stop flag checked once per tick by [`LinkStateMachine::run`].
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── LinkStateMachine ─────────────────────────────────────────────────────────

/// Discovery, subscription, streaming, and reconnection for one peripheral.
///
/// All transport problems (nothing found, a failed subscribe, a dead link)
/// show up as a lack of progress, which the discovery and link timeouts turn
/// back into a fresh scan.  Nothing here returns an error.
pub struct LinkStateMachine {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    drive: Arc<DriveState>,
    bridge: MotionBridge,
    drive_updates: Option<watch::Receiver<DriveConfig>>,

    state: LinkState,
    device_id: Option<String>,
    scanning: bool,
    /// When the current discovery/subscription attempt began.
    attempt_started: Instant,
    matched_groups: VecDeque<String>,
    current_group: Option<String>,
    last_payload: Instant,
    last_sample: Option<Instant>,
    inbox: Vec<Vec<u8>>,
    streamed: u64,
}

impl LinkStateMachine {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: LinkConfig,
        drive: Arc<DriveState>,
        drive_config: DriveConfig,
    ) -> Self {
        let now = Instant::now();
        drive.set_link_state(LinkState::Idle);
        Self {
            transport,
            config,
            drive,
            bridge: MotionBridge::new(drive_config.clamped()),
            drive_updates: None,
            state: LinkState::Idle,
            device_id: None,
            scanning: false,
            attempt_started: now,
            matched_groups: VecDeque::new(),
            current_group: None,
            last_payload: now,
            last_sample: None,
            inbox: Vec::new(),
            streamed: 0,
        }
    }

    /// Follow live [`DriveConfig`] changes published on a watch channel.
    pub fn with_drive_updates(mut self, rx: watch::Receiver<DriveConfig>) -> Self {
        self.drive_updates = Some(rx);
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Handle of the bound peripheral, or `None` while scanning.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn bridge(&self) -> &MotionBridge {
        &self.bridge
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Run until `stop` is raised, sleeping between ticks.
    pub fn run(&mut self, stop: &StopSignal) {
        info!(
            "Link worker started: device={:?} service={} characteristic={}",
            self.config.device_name, self.config.channel.group_id, self.config.channel.sub_id
        );
        while !stop.is_raised() {
            let wait = self.tick(Instant::now());
            thread::sleep(wait);
        }
        info!("Link worker stopped in state '{}'", self.state);
    }

    /// Advance the machine by one step at time `now` and return the delay
    /// before the next step.
    pub fn tick(&mut self, now: Instant) -> Duration {
        self.apply_drive_updates();
        match self.state {
            LinkState::Idle => self.tick_idle(now),
            LinkState::ServiceDiscovery => self.tick_service_discovery(now),
            LinkState::Subscribing => self.tick_subscribing(now),
            LinkState::Connected => self.tick_connected(now),
        }
    }

    fn apply_drive_updates(&mut self) {
        let Some(rx) = self.drive_updates.as_mut() else {
            return;
        };
        if rx.has_changed().unwrap_or(false) {
            let cfg = rx.borrow_and_update().clamped();
            debug!("Drive config updated: {cfg:?}");
            self.bridge.set_config(cfg);
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("Link state: {} → {}", self.state, state);
        }
        self.state = state;
        self.drive.set_link_state(state);
    }

    // ── Idle ─────────────────────────────────────────────────────────────────

    fn tick_idle(&mut self, now: Instant) -> Duration {
        if !self.scanning {
            info!("Scanning for {:?}…", self.config.device_name);
            self.transport.start_scan();
            self.scanning = true;
        }

        loop {
            match self.transport.poll_discovered_device() {
                ScanStatus::Available(d) if d.name == self.config.device_name => {
                    info!("Found device: {}  id={}", d.name, d.id);
                    self.transport.stop_scan();
                    self.scanning = false;
                    self.transport.enumerate_groups(&d.id);
                    self.device_id = Some(d.id);
                    self.matched_groups.clear();
                    self.current_group = None;
                    self.attempt_started = now;
                    self.set_state(LinkState::ServiceDiscovery);
                    return self.config.data_poll_interval;
                }
                ScanStatus::Available(d) => {
                    debug!("Ignoring device {:?}  id={}", d.name, d.id);
                }
                ScanStatus::Processing => break,
                ScanStatus::Finished => {
                    // Restarted on the next tick.
                    self.scanning = false;
                    break;
                }
            }
        }
        self.config.scan_poll_interval
    }

    // ── Service discovery ────────────────────────────────────────────────────

    fn tick_service_discovery(&mut self, now: Instant) -> Duration {
        if self.discovery_expired(now) {
            self.lose_link("service discovery timed out");
            return self.config.scan_poll_interval;
        }

        loop {
            match self.transport.poll_group() {
                ScanStatus::Available(group) => {
                    if self.config.channel.matches_group(&group) {
                        debug!("Target service found: {group}");
                        self.matched_groups.push_back(group);
                    } else {
                        debug!("Skipping service {group}");
                    }
                }
                ScanStatus::Processing => return self.config.data_poll_interval,
                ScanStatus::Finished => break,
            }
        }

        if self.matched_groups.is_empty() {
            warn!(
                "Service {} not found on {}; waiting for link timeout",
                self.config.channel.group_id,
                self.device_id.as_deref().unwrap_or("?")
            );
        }
        self.set_state(LinkState::Subscribing);
        self.config.data_poll_interval
    }

    // ── Subscribing ──────────────────────────────────────────────────────────

    fn tick_subscribing(&mut self, now: Instant) -> Duration {
        if self.discovery_expired(now) {
            self.lose_link("subscription timed out");
            return self.config.scan_poll_interval;
        }
        let Some(device_id) = self.device_id.clone() else {
            self.lose_link("no device bound");
            return self.config.scan_poll_interval;
        };

        loop {
            let group = match self.current_group.clone() {
                Some(g) => g,
                None => match self.matched_groups.pop_front() {
                    Some(g) => {
                        self.transport.enumerate_sub_channels(&device_id, &g);
                        self.current_group = Some(g.clone());
                        g
                    }
                    None => {
                        self.enter_connected(now);
                        return self.config.data_poll_interval;
                    }
                },
            };

            match self.transport.poll_sub_channel() {
                ScanStatus::Available(sub) => {
                    if self.config.channel.matches_sub(&sub.id) {
                        let ok = self.transport.subscribe(&device_id, &group, &sub.id, true);
                        if ok {
                            info!("Subscribed to {} ({})", sub.id, sub.description);
                        } else {
                            warn!("Subscribe to {} failed; continuing without it", sub.id);
                        }
                    }
                }
                ScanStatus::Processing => return self.config.data_poll_interval,
                ScanStatus::Finished => self.current_group = None,
            }
        }
    }

    fn discovery_expired(&self, now: Instant) -> bool {
        now.duration_since(self.attempt_started) > self.config.discovery_timeout
    }

    fn enter_connected(&mut self, now: Instant) {
        info!(
            "Streaming from {}",
            self.device_id.as_deref().unwrap_or("?")
        );
        self.last_payload = now;
        self.last_sample = None;
        self.streamed = 0;
        self.bridge.reset();
        self.set_state(LinkState::Connected);
    }

    // ── Connected ────────────────────────────────────────────────────────────

    fn tick_connected(&mut self, now: Instant) -> Duration {
        let mut inbox = std::mem::take(&mut self.inbox);
        while let Some(payload) = self.transport.poll_payload() {
            inbox.push(payload);
        }

        if !inbox.is_empty() {
            self.last_payload = now;
            let elapsed = self
                .last_sample
                .map(|t| now.duration_since(t))
                .unwrap_or(self.config.data_poll_interval);
            let dt = elapsed.as_secs_f32() / inbox.len() as f32;
            for payload in inbox.drain(..) {
                self.ingest(&payload, dt);
            }
            self.last_sample = Some(now);
        }
        self.inbox = inbox;

        if now.duration_since(self.last_payload) > self.config.link_timeout {
            self.lose_link("no payload within link timeout");
            return self.config.scan_poll_interval;
        }
        self.config.data_poll_interval
    }

    fn ingest(&mut self, payload: &[u8], dt_secs: f32) {
        self.streamed += 1;
        self.drive.note_payload();

        let Some(sample) = decode_motion(payload) else {
            self.drive.note_rejected();
            let rejected = self.drive.rejected_count();
            if rejected > 3 && rejected % PAYLOAD_LOG_EVERY != 0 {
                return;
            }
            debug!(
                "Discarding malformed payload ({} bytes): {:?}",
                payload.len(),
                String::from_utf8_lossy(payload)
            );
            return;
        };

        self.drive.set_orientation(sample);
        let step = self.bridge.drive(sample, dt_secs, &self.drive);

        if self.streamed <= 3 || self.streamed % PAYLOAD_LOG_EVERY == 0 {
            debug!(
                "payload #{} sample=({:.1}, {:.1}, {:.1}) filtered={:.1} jerk={:.1} energy={:.3}",
                self.streamed, sample.x, sample.y, sample.z, step.filtered, step.jerk, step.energy
            );
        }
    }

    // ── Link loss ────────────────────────────────────────────────────────────

    /// Drop the handle and every piece of session state, then scan again.
    fn lose_link(&mut self, reason: &str) {
        warn!(
            "Link to {} lost ({reason}); restarting discovery",
            self.device_id.as_deref().unwrap_or("?")
        );
        self.device_id = None;
        self.scanning = false;
        self.matched_groups.clear();
        self.current_group = None;
        self.last_sample = None;
        self.inbox.clear();
        self.bridge.reset();
        self.drive.clear_orientation();
        self.drive.note_reconnect();
        self.set_state(LinkState::Idle);
    }
}

// ── IngestionWorker ──────────────────────────────────────────────────────────

/// A [`LinkStateMachine`] running on its own thread.
///
/// Dropping the worker shuts it down.
pub struct IngestionWorker {
    stop: StopSignal,
    transport: Arc<dyn Transport>,
    handle: Option<JoinHandle<()>>,
}

impl IngestionWorker {
    /// Start `machine` on a thread named `gyro-link`.
    pub fn spawn(mut machine: LinkStateMachine) -> Result<Self> {
        let stop = StopSignal::new();
        let transport = machine.transport();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("gyro-link".into())
            .spawn(move || machine.run(&thread_stop))?;
        Ok(Self {
            stop,
            transport,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Raise the stop flag, unblock the transport, and join the thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.raise();
        self.transport.quit();
        if handle.join().is_err() {
            error!("Link worker thread panicked");
        }
    }
}

impl Drop for IngestionWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    #[test]
    fn default_config_targets_the_gyro_sensor() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.device_name, "ESP32_BLE_IMU");
        assert_eq!(cfg.scan_poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.data_poll_interval, Duration::from_millis(20));
        assert_eq!(cfg.link_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn stop_signal_is_shared_between_clones() {
        let a = StopSignal::new();
        let b = a.clone();
        assert!(!b.is_raised());
        a.raise();
        assert!(b.is_raised());
    }

    #[test]
    fn idle_tick_uses_scan_cadence_and_scans_once() {
        let t = Arc::new(ScriptedTransport::new());
        let mut m = LinkStateMachine::new(
            t.clone(),
            LinkConfig::default(),
            Arc::new(DriveState::new()),
            DriveConfig::default(),
        );
        let now = Instant::now();
        assert_eq!(m.tick(now), SCAN_POLL_INTERVAL);
        assert_eq!(m.tick(now + SCAN_POLL_INTERVAL), SCAN_POLL_INTERVAL);
        let scans = t
            .calls()
            .iter()
            .filter(|c| matches!(c, crate::transport::TransportCall::StartScan))
            .count();
        assert_eq!(scans, 1);
    }

    #[test]
    fn drive_config_updates_reach_the_bridge() {
        let (tx, rx) = watch::channel(DriveConfig::default());
        let mut m = LinkStateMachine::new(
            Arc::new(ScriptedTransport::new()),
            LinkConfig::default(),
            Arc::new(DriveState::new()),
            DriveConfig::default(),
        )
        .with_drive_updates(rx);

        tx.send(DriveConfig {
            input_gain: 1000.0,
            ..DriveConfig::default()
        })
        .unwrap();
        m.tick(Instant::now());
        assert_eq!(m.bridge().config().input_gain, 200.0);
    }
}
