use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde_derive::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceOptions, InitializeState};
use crate::error::{DeviceError, ManagerError};
use crate::link::{Connector, Link};
use crate::messages::{Event, EventSink};
use crate::protocol;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
    pub reconnecting: usize,
}

/// Anything that can report how many devices are up.
pub trait StatsSource: Send + Sync {
    fn connection_stats(&self) -> ConnectionStats;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub serial_path: String,
    pub connected: bool,
    pub initialized: bool,
    pub scanning: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub reconnect_delay: Duration,
    pub event_queue_capacity: usize,
    pub device: DeviceOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            reconnect_delay: Duration::from_secs(5),
            event_queue_capacity: 1000,
            device: DeviceOptions::default(),
        }
    }
}

/// A device id is in at most one of these maps at a time.
struct ManagerState<L: Link> {
    devices: HashMap<String, Arc<Device<L>>>,
    reconnect_timers: HashMap<String, JoinHandle<()>>,
}

/// Owns every configured device: brings them up, retries the ones that fail,
/// and merges their sightings into one event stream.
///
/// The state lock is never held while calling into a device.
pub struct Manager<C: Connector> {
    connector: C,
    configs: Vec<DeviceConfig>,
    options: ManagerOptions,
    state: Mutex<ManagerState<C::Link>>,
    sink: EventSink,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

impl<C: Connector> Manager<C> {
    /// Returns the manager and the consuming end of its merged event stream.
    pub fn new(
        connector: C,
        configs: Vec<DeviceConfig>,
        options: ManagerOptions,
    ) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (sink, events) = EventSink::channel("manager", options.event_queue_capacity);
        let manager = Arc::new(Manager {
            connector,
            configs,
            options,
            state: Mutex::new(ManagerState {
                devices: HashMap::new(),
                reconnect_timers: HashMap::new(),
            }),
            sink,
            shutdown: watch::Sender::new(false),
            closed: AtomicBool::new(false),
        });
        (manager, events)
    }

    /// Producer handle onto the merged event stream.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState<C::Link>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Brings up every enabled device concurrently. Devices that fail are left
    /// to the reconnect timer; only "nothing up and something failed" is an error.
    pub async fn initialize_all(self: &Arc<Self>) -> Result<(), ManagerError> {
        info!("Initializing {} configured devices", self.configs.len());

        let bring_ups = self
            .configs
            .iter()
            .filter(|config| {
                if !config.enabled {
                    info!("[{}] Skipping disabled device", config.device_id);
                }
                config.enabled
            })
            .map(|config| {
                let manager = self.clone();
                let config = config.clone();
                async move {
                    let result = manager.bring_up(&config).await;
                    if let Err(e) = &result {
                        error!("[{}] Failed to bring up: {}", config.device_id, e);
                        manager.schedule_reconnect(config.clone());
                    }
                    result
                }
            });
        let failures = join_all(bring_ups)
            .await
            .into_iter()
            .filter(Result::is_err)
            .count();

        let stats = self.connection_stats();
        info!(
            "Devices up: {}/{} ({} awaiting reconnect)",
            stats.connected, stats.total, stats.reconnecting
        );

        if stats.connected == 0 && failures > 0 {
            return Err(ManagerError::NoDevicesConnected);
        }
        Ok(())
    }

    /// connect -> initialize -> role check -> report -> register -> forward.
    async fn bring_up(self: &Arc<Self>, config: &DeviceConfig) -> Result<(), DeviceError> {
        let link = self
            .connector
            .connect(config)
            .await
            .map_err(|e| DeviceError::transport("connect", e))?;
        let device = Device::connect(
            config.clone(),
            link,
            self.options.device,
            self.shutdown.subscribe(),
        );

        if let Err(e) = device.initialize().await {
            let _ = device.disconnect().await;
            return Err(e);
        }
        match device.query_role().await {
            Ok(role) if role == protocol::SINGLE_ROLE => {
                debug!("[{}] Role confirmed", config.device_id);
            }
            Ok(role) => warn!(
                "[{}] Module reports role {}, expected {}",
                config.device_id,
                role,
                protocol::SINGLE_ROLE
            ),
            Err(e) => warn!("[{}] Could not confirm role: {}", config.device_id, e),
        }
        device.start_report();

        let Some(events) = device.take_events() else {
            let _ = device.disconnect().await;
            return Err(DeviceError::Protocol("device event stream already taken".to_string()));
        };

        let registered = {
            let mut state = self.lock_state();
            if self.closed.load(Ordering::Acquire) {
                false
            } else {
                state.reconnect_timers.remove(&config.device_id);
                state
                    .devices
                    .insert(config.device_id.clone(), device.clone());
                true
            }
        };
        if !registered {
            debug!("[{}] Shut down during bring-up", config.device_id);
            let _ = device.disconnect().await;
            return Ok(());
        }

        info!("[{}] Device up", config.device_id);
        self.spawn_forwarder(device, events);
        Ok(())
    }

    /// Copies one device's events into the merged stream until shutdown, and
    /// hands the device to the reconnect path if its link drops.
    fn spawn_forwarder(self: &Arc<Self>, device: Arc<Device<C::Link>>, mut events: mpsc::Receiver<Event>) {
        let manager = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            manager.sink.push(event);
                        }
                        None => break,
                    },
                    _ = device.link_lost() => {
                        manager.handle_link_lost(&device).await;
                        break;
                    }
                }
            }
            debug!("[{}] Forwarder stopped", device.device_id());
        });
    }

    async fn handle_link_lost(self: &Arc<Self>, device: &Arc<Device<C::Link>>) {
        let id = device.device_id().to_string();
        {
            let mut state = self.lock_state();
            match state.devices.get(&id) {
                Some(live) if Arc::ptr_eq(live, device) => {
                    state.devices.remove(&id);
                }
                _ => return,
            }
            warn!("[{}] Link lost, scheduling reconnect", id);
            self.schedule_reconnect_locked(&mut state, device.config().clone());
        }
        let _ = device.disconnect().await;
    }

    /// Replaces any pending retry for this device with a fresh one.
    fn schedule_reconnect(self: &Arc<Self>, config: DeviceConfig) {
        let mut state = self.lock_state();
        self.schedule_reconnect_locked(&mut state, config);
    }

    fn schedule_reconnect_locked(
        self: &Arc<Self>,
        state: &mut ManagerState<C::Link>,
        config: DeviceConfig,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(timer) = state.reconnect_timers.remove(&config.device_id) {
            timer.abort();
        }

        let id = config.device_id.clone();
        let delay = self.options.reconnect_delay;
        let manager = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("[{}] Attempting reconnect", config.device_id);
            if let Err(e) = manager.bring_up(&config).await {
                error!("[{}] Reconnect failed: {}", config.device_id, e);
                manager.schedule_reconnect(config);
            }
        });
        debug!("[{}] Reconnect scheduled in {:?}", id, delay);
        state.reconnect_timers.insert(id, timer);
    }

    fn live_devices(&self) -> Vec<Arc<Device<C::Link>>> {
        let state = self.lock_state();
        let mut devices: Vec<_> = state.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id().cmp(b.device_id()));
        devices
    }

    fn targets(&self, device_id: &str) -> Result<Vec<Arc<Device<C::Link>>>, ManagerError> {
        if device_id.is_empty() {
            return Ok(self.live_devices());
        }
        self.lock_state()
            .devices
            .get(device_id)
            .cloned()
            .map(|device| vec![device])
            .ok_or_else(|| ManagerError::DeviceNotFound(device_id.to_string()))
    }

    fn collect_failures(
        operation: &'static str,
        results: Vec<(String, Result<(), DeviceError>)>,
    ) -> Result<(), ManagerError> {
        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::PartialFailure {
                operation,
                failures,
            })
        }
    }

    /// Starts scanning on one device, or on every live device when
    /// `device_id` is empty.
    pub async fn start_scan(&self, device_id: &str, threshold: &str) -> Result<(), ManagerError> {
        if !device_id.is_empty() {
            let device = self.targets(device_id)?.remove(0);
            return Ok(device.start_scan(threshold).await?);
        }
        let devices = self.live_devices();
        let results = join_all(devices.iter().map(|device| async move {
            (device.device_id().to_string(), device.start_scan(threshold).await)
        }))
        .await;
        Self::collect_failures("start scan", results)
    }

    pub async fn stop_scan(&self, device_id: &str) -> Result<(), ManagerError> {
        if !device_id.is_empty() {
            let device = self.targets(device_id)?.remove(0);
            return Ok(device.stop_scan().await?);
        }
        let devices = self.live_devices();
        let results = join_all(devices.iter().map(|device| async move {
            (device.device_id().to_string(), device.stop_scan().await)
        }))
        .await;
        Self::collect_failures("stop scan", results)
    }

    /// Unknown ids are ignored.
    pub fn start_report(&self, device_id: &str) {
        for device in self.targets(device_id).unwrap_or_default() {
            device.start_report();
        }
    }

    pub fn stop_report(&self, device_id: &str) {
        for device in self.targets(device_id).unwrap_or_default() {
            device.stop_report();
        }
    }

    #[cfg(test)]
    pub fn device(&self, device_id: &str) -> Option<Arc<Device<C::Link>>> {
        self.lock_state().devices.get(device_id).cloned()
    }

    pub fn devices_info(&self) -> Vec<DeviceInfo> {
        self.live_devices()
            .iter()
            .map(|device| {
                let status = device.status();
                DeviceInfo {
                    device_id: device.device_id().to_string(),
                    serial_path: device.serial_path().to_string(),
                    connected: status.connected,
                    initialized: status.initialize_state == InitializeState::Initialized,
                    scanning: status.is_scanning,
                }
            })
            .collect()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let state = self.lock_state();
        ConnectionStats {
            total: self.configs.len(),
            connected: state.devices.len(),
            reconnecting: state.reconnect_timers.len(),
        }
    }

    /// Cancels retries, disconnects every device and stops all background
    /// tasks. Later calls do nothing.
    pub async fn disconnect_all(&self) -> Result<(), ManagerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Disconnecting all devices");
        self.shutdown.send_replace(true);

        let devices = {
            let mut state = self.lock_state();
            for (id, timer) in state.reconnect_timers.drain() {
                timer.abort();
                debug!("[{}] Reconnect cancelled", id);
            }
            let mut devices: Vec<_> = state.devices.drain().map(|(_, d)| d).collect();
            devices.sort_by(|a, b| a.device_id().cmp(b.device_id()));
            devices
        };

        let results = join_all(devices.iter().map(|device| async move {
            (device.device_id().to_string(), device.disconnect().await)
        }))
        .await;
        Self::collect_failures("disconnect", results)?;
        info!("All devices disconnected");
        Ok(())
    }
}

impl<C: Connector> StatsSource for Manager<C> {
    fn connection_stats(&self) -> ConnectionStats {
        Manager::connection_stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockConnector;
    use crate::protocol::format_observer_report;

    fn configs(ids: &[&str]) -> Vec<DeviceConfig> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| DeviceConfig {
                serial_path: format!("/dev/ttyS{i}"),
                device_id: id.to_string(),
                baud_rate: 115_200,
                enabled: true,
                rssi: "-50".to_string(),
            })
            .collect()
    }

    fn manager(
        ids: &[&str],
    ) -> (Arc<Manager<MockConnector>>, mpsc::Receiver<Event>, MockConnector) {
        let connector = MockConnector::default();
        let (manager, events) =
            Manager::new(connector.clone(), configs(ids), ManagerOptions::default());
        (manager, events, connector)
    }

    fn assert_disjoint(manager: &Manager<MockConnector>) {
        let state = manager.lock_state();
        for id in state.devices.keys() {
            assert!(
                !state.reconnect_timers.contains_key(id),
                "{id} is both live and pending reconnect"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_all_brings_devices_up() {
        let (manager, _events, connector) = manager(&["a", "b", "c"]);
        manager.initialize_all().await.unwrap();

        assert_eq!(
            manager.connection_stats(),
            ConnectionStats {
                total: 3,
                connected: 3,
                reconnecting: 0,
            }
        );
        for id in ["a", "b", "c"] {
            let device = manager.device(id).unwrap();
            let status = device.status();
            assert!(status.is_scanning);
            assert!(status.report_enabled);
            assert_eq!(
                connector.handle(id).unwrap().count_writes("AT+OBSERVER=1,4,,,-50\r\n"),
                1
            );
        }
        let info = manager.devices_info();
        assert_eq!(info.len(), 3);
        assert_eq!(info[0].device_id, "a");
        assert!(info.iter().all(|d| d.connected && d.initialized && d.scanning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_devices_are_skipped() {
        let connector = MockConnector::default();
        let mut configs = configs(&["a", "b"]);
        configs[1].enabled = false;
        let (manager, _events) = Manager::new(connector.clone(), configs, ManagerOptions::default());

        manager.initialize_all().await.unwrap();
        assert_eq!(connector.attempts(), 1);
        assert_eq!(
            manager.connection_stats(),
            ConnectionStats {
                total: 2,
                connected: 1,
                reconnecting: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_failed_connect() {
        let (manager, _events, connector) = manager(&["a", "b"]);
        connector.fail_connects("b", 2);

        manager.initialize_all().await.unwrap();
        assert_eq!(
            manager.connection_stats(),
            ConnectionStats {
                total: 2,
                connected: 1,
                reconnecting: 1,
            }
        );
        assert_disjoint(&manager);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            manager.connection_stats(),
            ConnectionStats {
                total: 2,
                connected: 2,
                reconnecting: 0,
            }
        );
        // One initial attempt for each device plus two retries for b.
        assert_eq!(connector.attempts(), 4);
        assert_disjoint(&manager);
        assert!(manager.device("b").unwrap().status().is_scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failed_is_an_error() {
        let (manager, _events, connector) = manager(&["a"]);
        connector.fail_connects("a", 1);

        let err = manager.initialize_all().await.unwrap_err();
        assert!(matches!(err, ManagerError::NoDevicesConnected));
        assert_eq!(manager.connection_stats().reconnecting, 1);
        manager.disconnect_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_stop_partial_failure() {
        let (manager, _events, connector) = manager(&["a", "b", "c"]);
        manager.initialize_all().await.unwrap();
        connector.handle("b").unwrap().set_fail_writes(true);

        let err = manager.stop_scan("").await.unwrap_err();
        assert_eq!(err.failed_devices(), vec!["b"]);
        assert!(err.to_string().contains("device b"));

        assert!(!manager.device("a").unwrap().status().is_scanning);
        assert!(!manager.device("c").unwrap().status().is_scanning);
        assert!(manager.device("b").unwrap().status().is_scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targeted_operations() {
        let (manager, _events, connector) = manager(&["a", "b"]);
        manager.initialize_all().await.unwrap();

        manager.stop_scan("a").await.unwrap();
        assert!(!manager.device("a").unwrap().status().is_scanning);
        assert!(manager.device("b").unwrap().status().is_scanning);

        manager.start_scan("a", "-65").await.unwrap();
        assert_eq!(
            connector.handle("a").unwrap().count_writes("AT+OBSERVER=1,4,,,-65\r\n"),
            1
        );

        assert!(matches!(
            manager.start_scan("missing", "").await,
            Err(ManagerError::DeviceNotFound(id)) if id == "missing"
        ));
        assert!(matches!(
            manager.stop_scan("missing").await,
            Err(ManagerError::DeviceNotFound(_))
        ));

        manager.stop_report("b");
        assert!(!manager.device("b").unwrap().status().report_enabled);
        assert!(manager.device("a").unwrap().status().report_enabled);
        manager.stop_report("missing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sightings_fan_in() {
        let (manager, mut events, connector) = manager(&["a", "b"]);
        manager.initialize_all().await.unwrap();

        connector
            .handle("a")
            .unwrap()
            .push_line(format_observer_report("004C", "00000001", "ABCD", -40));
        connector
            .handle("b")
            .unwrap()
            .push_line(format_observer_report("00E0", "00000002", "ABCD", -40));

        let mut seen = Vec::new();
        for _ in 0..2 {
            match events.recv().await.unwrap() {
                Event::Sighting(s) => seen.push((s.device_id, s.manufacturer)),
                other => panic!("unexpected event {other:?}"),
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), "Apple, Inc.".to_string()),
                ("b".to_string(), "Google".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_is_reconnected() {
        let (manager, _events, connector) = manager(&["a"]);
        manager.initialize_all().await.unwrap();
        let first = manager.device("a").unwrap();

        connector.handle("a").unwrap().hang_up();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.connection_stats().connected, 0);
        assert_eq!(manager.connection_stats().reconnecting, 1);
        assert_eq!(
            first.status().initialize_state,
            InitializeState::Uninitialized
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.connection_stats().connected, 1);
        assert!(!Arc::ptr_eq(&first, &manager.device("a").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_checked_on_bring_up() {
        let (manager, _events, connector) = manager(&["a"]);
        let init = tokio::spawn({
            let manager = manager.clone();
            async move { manager.initialize_all().await }
        });

        let handle = loop {
            if let Some(handle) = connector.handle("a") {
                if handle.count_writes("AT+ROLE?\r\n") > 0 {
                    break handle;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        // Scanning is already on, but the device is registered only after
        // the role check.
        assert_eq!(handle.count_writes("AT+OBSERVER=1,4,,,-50\r\n"), 1);
        assert!(manager.device("a").is_none());
        handle.push_line("+ROLE=1");

        init.await.unwrap().unwrap();
        assert!(manager.device("a").unwrap().status().report_enabled);
        assert_eq!(handle.count_writes("AT+ROLE?\r\n"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_device_is_never_untracked() {
        let (manager, _events, connector) = manager(&["a"]);
        manager.initialize_all().await.unwrap();
        let device = manager.device("a").unwrap();

        // An in-flight role query holds the command lock, so the disconnect
        // that follows a lost link has to wait for it.
        let query = tokio::spawn({
            let device = device.clone();
            async move { device.query_role().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        connector.handle("a").unwrap().hang_up();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(
            device.status().initialize_state,
            InitializeState::Initialized,
            "disconnect should still be waiting"
        );
        assert_eq!(
            manager.connection_stats(),
            ConnectionStats {
                total: 1,
                connected: 0,
                reconnecting: 1,
            }
        );
        assert_disjoint(&manager);

        assert!(query.await.unwrap().is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            device.status().initialize_state,
            InitializeState::Uninitialized
        );
        assert_eq!(manager.connection_stats().reconnecting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_once() {
        let (manager, _events, connector) = manager(&["a", "b"]);
        connector.fail_connects("b", usize::MAX);
        manager.initialize_all().await.unwrap();
        let a = connector.handle("a").unwrap();

        manager.disconnect_all().await.unwrap();
        assert_eq!(
            manager.connection_stats(),
            ConnectionStats {
                total: 2,
                connected: 0,
                reconnecting: 0,
            }
        );
        assert!(a.is_closed());

        manager.disconnect_all().await.unwrap();

        // Cancelled timers never fire.
        let attempts = connector.attempts();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), attempts);
        assert_eq!(manager.connection_stats().connected, 0);
    }
}
