use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{DiscoveredDevice, ScanStatus, SubChannel, Transport};
use crate::protocol::ids_match;

/// Hard bound on `peripheral.connect()`.  BlueZ's `Device1.Connect` can hang
/// forever when the device walks out of range mid-handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard bound on GATT service discovery.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

/// Hard bound on subscribe/unsubscribe round-trips.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard bound on the best-effort disconnect performed on drop.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Log only the first and then every Nth repeated scan failure.
const SCAN_FAILURE_LOG_EVERY: u64 = 50;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drain one item from a result queue without blocking.
///
/// A dropped sender means the producing task has finished.
fn poll_queue<T>(slot: &Mutex<Option<UnboundedReceiver<T>>>) -> ScanStatus<T> {
    let mut guard = lock(slot);
    let Some(rx) = guard.as_mut() else {
        return ScanStatus::Finished;
    };
    match rx.try_recv() {
        Ok(v) => ScanStatus::Available(v),
        Err(TryRecvError::Empty) => ScanStatus::Processing,
        Err(TryRecvError::Disconnected) => {
            *guard = None;
            ScanStatus::Finished
        }
    }
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
    if let Some(old) = std::mem::replace(&mut *lock(slot), task) {
        old.abort();
    }
}

/// State reachable from spawned tasks.
#[derive(Default)]
struct Shared {
    /// Peripherals seen during scanning, keyed by their transport id.
    peripherals: Mutex<HashMap<String, Peripheral>>,
    /// GATT layout of each peripheral whose services have been discovered.
    services: Mutex<HashMap<String, BTreeSet<Service>>>,
    scan_failures: AtomicU64,
    quit: AtomicBool,
    quit_notify: Notify,
}

impl Shared {
    /// Await `fut` for at most `limit`, returning `None` as soon as quit is
    /// raised.
    async fn bounded<T>(&self, what: &str, limit: Duration, fut: impl Future<Output = Result<T>>) -> Option<T> {
        let quit = self.quit_notify.notified();
        tokio::pin!(quit);
        // Registered before the flag check so a quit in between still wakes us.
        quit.as_mut().enable();
        if self.quit.load(Ordering::Acquire) {
            return None;
        }
        tokio::select! {
            r = tokio::time::timeout(limit, fut) => match r {
                Ok(Ok(v)) => Some(v),
                Ok(Err(e)) => {
                    warn!("{what} failed: {e}");
                    None
                }
                Err(_) => {
                    warn!("{what} timed out after {limit:?}");
                    None
                }
            },
            _ = &mut quit => None,
        }
    }

    fn find_characteristic(&self, device_id: &str, group_id: &str, sub_id: &str) -> Option<Characteristic> {
        let services = lock(&self.services);
        services
            .get(device_id)?
            .iter()
            .filter(|s| ids_match(&s.uuid.to_string(), group_id))
            .flat_map(|s| s.characteristics.iter())
            .find(|c| ids_match(&c.uuid.to_string(), sub_id))
            .cloned()
    }
}

/// [`Transport`] over the platform BLE stack via btleplug.
///
/// btleplug is async; this type owns a small tokio runtime and turns each
/// request into a spawned task that pushes results into a queue.  The
/// `poll_*` methods only ever `try_recv` from those queues.  `subscribe` is
/// the one synchronous round-trip, bounded by a timeout and cut short by
/// [`Transport::quit`].
///
/// Platform identifiers:
/// * macOS / Windows: a UUID string
/// * Linux: the Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
pub struct BleTransport {
    runtime: Runtime,
    adapter: Adapter,
    shared: Arc<Shared>,
    devices: Mutex<Option<UnboundedReceiver<DiscoveredDevice>>>,
    groups: Mutex<Option<UnboundedReceiver<String>>>,
    subs: Mutex<Option<UnboundedReceiver<SubChannel>>>,
    payloads: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
    notify_task: Mutex<Option<JoinHandle<()>>>,
    connected: Mutex<Option<Peripheral>>,
}

impl BleTransport {
    /// Acquire the first Bluetooth adapter.
    ///
    /// On macOS, `CBCentralManager` needs a moment to reach *poweredOn*
    /// after launch; scanning before that is a silent no-op, so this waits up
    /// to 3 s for it.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("gyro-ble")
            .enable_all()
            .build()?;

        let adapter = runtime.block_on(async {
            let manager = Manager::new().await?;
            let adapters = manager.adapters().await?;
            let adapter = adapters
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
            wait_powered_on(&adapter).await;
            Ok::<_, anyhow::Error>(adapter)
        })?;

        match runtime.block_on(adapter.adapter_info()) {
            Ok(info) => info!("BLE adapter: {info}"),
            Err(e) => debug!("BLE adapter info unavailable: {e}"),
        }

        Ok(Self {
            runtime,
            adapter,
            shared: Arc::new(Shared::default()),
            devices: Mutex::new(None),
            groups: Mutex::new(None),
            subs: Mutex::new(None),
            payloads: Mutex::new(None),
            scan_task: Mutex::new(None),
            discovery_task: Mutex::new(None),
            notify_task: Mutex::new(None),
            connected: Mutex::new(None),
        })
    }

    fn is_quit(&self) -> bool {
        self.shared.quit.load(Ordering::Acquire)
    }

    /// Run `fut` to completion on the runtime, bounded by `limit` and by
    /// [`Transport::quit`].  Failures are logged and mapped to `None`.
    fn run_bounded<T>(&self, what: &str, limit: Duration, fut: impl Future<Output = Result<T>>) -> Option<T> {
        if self.is_quit() {
            return None;
        }
        self.runtime.block_on(self.shared.bounded(what, limit, fut))
    }

    /// Tear down the streaming link of a previous session.
    fn release_link(&self) {
        replace_task(&self.notify_task, None);
        replace_task(&self.discovery_task, None);
        *lock(&self.payloads) = None;
        if let Some(p) = lock(&self.connected).take() {
            debug!("Releasing previous link to {}", p.id());
            self.runtime.spawn(async move {
                let _ = p.disconnect().await;
            });
        }
    }
}

#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                break;
            }
            Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

/// Report every named peripheral once per scan session.
async fn scan_for_devices(
    adapter: Adapter,
    shared: Arc<Shared>,
    tx: UnboundedSender<DiscoveredDevice>,
) -> Result<()> {
    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    shared.scan_failures.store(0, Ordering::Relaxed);

    let mut reported = HashSet::new();

    // Peripherals the OS already knows from an earlier session do not emit
    // DeviceDiscovered again.
    for p in adapter.peripherals().await? {
        report_device(&shared, &tx, &mut reported, p).await;
    }

    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };
        if let Ok(p) = adapter.peripheral(&id).await {
            report_device(&shared, &tx, &mut reported, p).await;
        }
    }
    Ok(())
}

async fn report_device(
    shared: &Shared,
    tx: &UnboundedSender<DiscoveredDevice>,
    reported: &mut HashSet<String>,
    p: Peripheral,
) {
    let id = p.id().to_string();
    if reported.contains(&id) {
        return;
    }
    // Unnamed advertisements are skipped; the name often follows in a
    // DeviceUpdated once the scan response arrives.
    let Ok(Some(props)) = p.properties().await else {
        return;
    };
    let Some(name) = props.local_name else {
        return;
    };
    reported.insert(id.clone());
    lock(&shared.peripherals).insert(id.clone(), p);
    let _ = tx.send(DiscoveredDevice { id, name });
}

async fn connect_and_discover(p: &Peripheral) -> Result<BTreeSet<Service>> {
    if !p.is_connected().await.unwrap_or(false) {
        tokio::time::timeout(CONNECT_TIMEOUT, p.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out after {CONNECT_TIMEOUT:?}"))??;
    }

    // BlueZ reports the connection before its GATT cache is populated;
    // discovering too early returns an empty service set.
    #[cfg(target_os = "linux")]
    tokio::time::sleep(Duration::from_millis(600)).await;

    tokio::time::timeout(DISCOVER_TIMEOUT, p.discover_services())
        .await
        .map_err(|_| anyhow!("discover_services() timed out after {DISCOVER_TIMEOUT:?}"))??;
    Ok(p.services())
}

impl Transport for BleTransport {
    fn start_scan(&self) {
        if self.is_quit() {
            return;
        }
        self.release_link();

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.devices) = Some(rx);

        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.shared);
        let task = self.runtime.spawn(async move {
            if let Err(e) = scan_for_devices(adapter, Arc::clone(&shared), tx).await {
                let n = shared.scan_failures.fetch_add(1, Ordering::Relaxed);
                if n % SCAN_FAILURE_LOG_EVERY == 0 {
                    warn!("BLE scan failed ({} time(s)): {e}", n + 1);
                }
            }
        });
        replace_task(&self.scan_task, Some(task));
    }

    fn stop_scan(&self) {
        replace_task(&self.scan_task, None);
        if self.is_quit() {
            return;
        }
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("stop_scan: {e}");
            }
        });
    }

    fn poll_discovered_device(&self) -> ScanStatus<DiscoveredDevice> {
        poll_queue(&self.devices)
    }

    fn enumerate_groups(&self, device_id: &str) {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.groups) = Some(rx);
        if self.is_quit() {
            return;
        }

        let Some(p) = lock(&self.shared.peripherals).get(device_id).cloned() else {
            warn!("enumerate_groups: unknown device {device_id}");
            return;
        };
        *lock(&self.connected) = Some(p.clone());

        let shared = Arc::clone(&self.shared);
        let id = device_id.to_owned();
        let task = self.runtime.spawn(async move {
            match connect_and_discover(&p).await {
                Ok(services) => {
                    info!("{id}: connected, {} service(s) discovered", services.len());
                    let uuids: Vec<String> = services.iter().map(|s| s.uuid.to_string()).collect();
                    lock(&shared.services).insert(id, services);
                    for uuid in uuids {
                        let _ = tx.send(uuid);
                    }
                }
                Err(e) => warn!("{id}: service discovery failed: {e}"),
            }
        });
        replace_task(&self.discovery_task, Some(task));
    }

    fn poll_group(&self) -> ScanStatus<String> {
        poll_queue(&self.groups)
    }

    fn enumerate_sub_channels(&self, device_id: &str, group_id: &str) {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.subs) = Some(rx);

        let services = lock(&self.shared.services);
        let Some(service) = services
            .get(device_id)
            .and_then(|set| set.iter().find(|s| ids_match(&s.uuid.to_string(), group_id)))
        else {
            debug!("enumerate_sub_channels: {group_id} not known on {device_id}");
            return;
        };
        for c in &service.characteristics {
            let _ = tx.send(SubChannel {
                id: c.uuid.to_string(),
                description: format!("{:?}", c.properties),
            });
        }
    }

    fn poll_sub_channel(&self) -> ScanStatus<SubChannel> {
        poll_queue(&self.subs)
    }

    fn subscribe(&self, device_id: &str, group_id: &str, sub_id: &str, enable: bool) -> bool {
        let Some(p) = lock(&self.shared.peripherals).get(device_id).cloned() else {
            return false;
        };
        let Some(c) = self.shared.find_characteristic(device_id, group_id, sub_id) else {
            warn!("subscribe: characteristic {sub_id} not found on {device_id}");
            return false;
        };

        if !enable {
            replace_task(&self.notify_task, None);
            return self
                .run_bounded("unsubscribe", SUBSCRIBE_TIMEOUT, async {
                    p.unsubscribe(&c).await?;
                    Ok(())
                })
                .is_some();
        }

        // Take the notification stream before subscribing so the first
        // notification cannot slip past.
        let stream = self.run_bounded("subscribe", SUBSCRIBE_TIMEOUT, async {
            let stream = p.notifications().await?;
            p.subscribe(&c).await?;
            Ok(stream)
        });
        let Some(mut stream) = stream else {
            return false;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.payloads) = Some(rx);
        let uuid = c.uuid;
        let task = self.runtime.spawn(async move {
            while let Some(n) = stream.next().await {
                if n.uuid == uuid && tx.send(n.value).is_err() {
                    break;
                }
            }
            debug!("notification stream for {uuid} ended");
        });
        replace_task(&self.notify_task, Some(task));
        true
    }

    fn poll_payload(&self) -> Option<Vec<u8>> {
        match poll_queue(&self.payloads) {
            ScanStatus::Available(v) => Some(v),
            _ => None,
        }
    }

    fn quit(&self) {
        if self.shared.quit.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.quit_notify.notify_waiters();
        replace_task(&self.scan_task, None);
        replace_task(&self.discovery_task, None);
        replace_task(&self.notify_task, None);
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.quit();
        if let Some(p) = lock(&self.connected).take() {
            let _ = self
                .runtime
                .block_on(async { tokio::time::timeout(DISCONNECT_TIMEOUT, p.disconnect()).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
    }

    fn stalled() -> impl Future<Output = Result<()>> {
        std::future::pending()
    }

    #[test]
    fn bounded_returns_the_value() {
        let shared = Shared::default();
        let ready = async { Ok::<_, anyhow::Error>(7) };
        let out = runtime().block_on(shared.bounded("ready", Duration::from_secs(1), ready));
        assert_eq!(out, Some(7));
    }

    #[test]
    fn bounded_maps_errors_and_timeouts_to_none() {
        let rt = runtime();
        let shared = Shared::default();
        let failed = rt.block_on(shared.bounded("failing", Duration::from_secs(1), async {
            Err::<(), _>(anyhow!("boom"))
        }));
        assert_eq!(failed, None);
        let timed_out = rt.block_on(shared.bounded("stalled", Duration::from_millis(20), stalled()));
        assert_eq!(timed_out, None);
    }

    #[test]
    fn quit_raised_without_a_waiter_is_still_seen() {
        // The notification fired before anyone waited; only the flag remains.
        let shared = Shared::default();
        shared.quit.store(true, Ordering::Release);
        shared.quit_notify.notify_waiters();

        let started = Instant::now();
        let out = runtime().block_on(shared.bounded("subscribe", SUBSCRIBE_TIMEOUT, stalled()));
        assert_eq!(out, None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn quit_during_a_call_cuts_it_short() {
        let shared = Arc::new(Shared::default());
        let remote = Arc::clone(&shared);
        let quitter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.quit.store(true, Ordering::Release);
            remote.quit_notify.notify_waiters();
        });

        let started = Instant::now();
        let out = runtime().block_on(shared.bounded("subscribe", SUBSCRIBE_TIMEOUT, stalled()));
        quitter.join().unwrap();
        assert_eq!(out, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
