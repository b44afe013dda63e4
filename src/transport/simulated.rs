use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::info;

use super::{DiscoveredDevice, ScanStatus, SubChannel, Transport};
use crate::dsp::XorShift32;
use crate::types::ChannelDescriptor;

/// Interval between synthetic notifications (~50 Hz like the firmware).
const NOTIFY_INTERVAL: Duration = Duration::from_millis(20);

/// Delay between `start_scan` and the target showing up.
const ADVERTISE_DELAY: Duration = Duration::from_millis(400);

/// Shake cycle: `SHAKE_SECS` of shaking, then rest until `CYCLE_SECS`.
const CYCLE_SECS: f32 = 4.0;
const SHAKE_SECS: f32 = 1.5;

/// Peak raw rate while shaking; comfortably above the default 80 000 axis gate.
const SHAKE_AMPLITUDE: f32 = 250_000.0;

/// Raw noise floor of a sensor at rest.
const REST_NOISE: f32 = 500.0;

/// The simulated peripheral goes silent for `DROPOUT_FOR` after every
/// `DROPOUT_EVERY` of streaming, exercising the reconnection path.
const DROPOUT_EVERY: Duration = Duration::from_secs(45);
const DROPOUT_FOR: Duration = Duration::from_secs(3);

const DEVICE_ID: &str = "sim:00:11:22:33:44:55";
const DECOY_ID: &str = "sim:66:77:88:99:aa:bb";

struct SimState {
    scanning: bool,
    scan_started: Instant,
    decoy_reported: bool,
    target_reported: bool,
    groups: Option<VecDeque<String>>,
    subs: Option<VecDeque<SubChannel>>,
    streaming_since: Option<Instant>,
    silent_until: Option<Instant>,
    last_emit: Instant,
    clock: Instant,
    rng: XorShift32,
    quit: bool,
}

/// A [`Transport`] that fakes a gyroscope sensor being shaken in bursts.
///
/// It advertises one decoy device and the target, exposes the target's
/// service and characteristic, and after a successful subscribe emits a
/// `"x,y,z"` payload every 20 ms.  Every 45 s of streaming it drops off the
/// air for 3 s, which forces a link timeout and a full rediscovery.
pub struct SimulatedTransport {
    device_name: String,
    channel: ChannelDescriptor,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    pub fn new(device_name: impl Into<String>, channel: ChannelDescriptor, seed: u32) -> Self {
        let now = Instant::now();
        Self {
            device_name: device_name.into(),
            channel,
            state: Mutex::new(SimState {
                scanning: false,
                scan_started: now,
                decoy_reported: false,
                target_reported: false,
                groups: None,
                subs: None,
                streaming_since: None,
                silent_until: None,
                last_emit: now,
                clock: now,
                rng: XorShift32::new(seed),
                quit: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw gyro reading at `t` seconds since the simulator was created.
    fn sample_at(t: f32, rng: &mut XorShift32) -> [f32; 3] {
        let phase = t % CYCLE_SECS;
        let envelope = if phase < SHAKE_SECS {
            (PI * phase / SHAKE_SECS).sin()
        } else {
            0.0
        };
        let shake = |hz: f32, offset: f32| SHAKE_AMPLITUDE * envelope * (2.0 * PI * hz * t + offset).sin();
        [
            shake(6.0, 0.0) + rng.next_bipolar() * REST_NOISE,
            shake(5.0, 1.3) + rng.next_bipolar() * REST_NOISE,
            shake(7.0, 2.1) + rng.next_bipolar() * REST_NOISE,
        ]
    }
}

impl Transport for SimulatedTransport {
    fn start_scan(&self) {
        let mut s = self.state();
        if s.quit {
            return;
        }
        s.scanning = true;
        s.scan_started = Instant::now();
        s.decoy_reported = false;
        s.target_reported = false;
        s.streaming_since = None;
    }

    fn stop_scan(&self) {
        self.state().scanning = false;
    }

    fn poll_discovered_device(&self) -> ScanStatus<DiscoveredDevice> {
        let mut s = self.state();
        if !s.scanning || s.quit {
            return ScanStatus::Processing;
        }
        let now = Instant::now();
        if s.silent_until.is_some_and(|until| now < until) {
            return ScanStatus::Processing;
        }
        if !s.decoy_reported {
            s.decoy_reported = true;
            return ScanStatus::Available(DiscoveredDevice {
                id: DECOY_ID.into(),
                name: "Wireless Headphones".into(),
            });
        }
        if !s.target_reported && now.duration_since(s.scan_started) >= ADVERTISE_DELAY {
            s.target_reported = true;
            return ScanStatus::Available(DiscoveredDevice {
                id: DEVICE_ID.into(),
                name: self.device_name.clone(),
            });
        }
        ScanStatus::Processing
    }

    fn enumerate_groups(&self, device_id: &str) {
        let mut s = self.state();
        s.groups = Some(if device_id == DEVICE_ID {
            VecDeque::from([
                "00001800-0000-1000-8000-00805f9b34fb".to_owned(),
                format!("{{{}}}", self.channel.group_id.to_uppercase()),
            ])
        } else {
            VecDeque::new()
        });
    }

    fn poll_group(&self) -> ScanStatus<String> {
        match self.state().groups.as_mut().and_then(VecDeque::pop_front) {
            Some(g) => ScanStatus::Available(g),
            None => ScanStatus::Finished,
        }
    }

    fn enumerate_sub_channels(&self, _device_id: &str, group_id: &str) {
        let subs = if self.channel.matches_group(group_id) {
            VecDeque::from([SubChannel {
                id: self.channel.sub_id.clone(),
                description: "Gyro XYZ".into(),
            }])
        } else {
            VecDeque::new()
        };
        self.state().subs = Some(subs);
    }

    fn poll_sub_channel(&self) -> ScanStatus<SubChannel> {
        match self.state().subs.as_mut().and_then(VecDeque::pop_front) {
            Some(c) => ScanStatus::Available(c),
            None => ScanStatus::Finished,
        }
    }

    fn subscribe(&self, device_id: &str, group_id: &str, sub_id: &str, enable: bool) -> bool {
        let mut s = self.state();
        let ok = !s.quit
            && device_id == DEVICE_ID
            && self.channel.matches_group(group_id)
            && self.channel.matches_sub(sub_id);
        if ok {
            s.streaming_since = enable.then(Instant::now);
        }
        ok
    }

    fn poll_payload(&self) -> Option<Vec<u8>> {
        let mut s = self.state();
        let since = s.streaming_since?;
        let now = Instant::now();

        if now.duration_since(since) >= DROPOUT_EVERY {
            info!("simulator: dropping off the air for {DROPOUT_FOR:?}");
            s.streaming_since = None;
            s.silent_until = Some(now + DROPOUT_FOR);
            return None;
        }
        if now.duration_since(s.last_emit) < NOTIFY_INTERVAL {
            return None;
        }
        s.last_emit = now;

        let t = now.duration_since(s.clock).as_secs_f32();
        let [x, y, z] = Self::sample_at(t, &mut s.rng);
        Some(format!("{x:.2},{y:.2},{z:.2}").into_bytes())
    }

    fn quit(&self) {
        let mut s = self.state();
        s.quit = true;
        s.scanning = false;
        s.streaming_since = None;
    }
}
