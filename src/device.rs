use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::link::Link;
use crate::manufacturer::Manufacturer;
use crate::messages::{DeviceSighting, Event, EventSink, now_millis};
use crate::protocol;

const ROLE_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializeState {
    Uninitialized,
    Initializing,
    Initialized,
}

/// Pauses the module needs after each step of the init sequence before it
/// accepts further input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    pub after_restart: Duration,
    pub after_enter_command: Duration,
    pub after_set_role: Duration,
    pub after_second_restart: Duration,
    pub after_second_enter_command: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        SettleDelays {
            after_restart: Duration::from_millis(3000),
            after_enter_command: Duration::from_millis(500),
            after_set_role: Duration::from_millis(500),
            after_second_restart: Duration::from_millis(2000),
            after_second_enter_command: Duration::from_millis(1000),
        }
    }
}

impl SettleDelays {
    #[cfg(test)]
    pub fn total(&self) -> Duration {
        self.after_restart
            + self.after_enter_command
            + self.after_set_role
            + self.after_second_restart
            + self.after_second_enter_command
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceOptions {
    pub settle: SettleDelays,
    pub queue_capacity: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            settle: SettleDelays::default(),
            queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub connected: bool,
    pub initialize_state: InitializeState,
    pub is_scanning: bool,
    pub report_enabled: bool,
}

struct DeviceState {
    connected: bool,
    initialize_state: InitializeState,
    is_scanning: bool,
    report_enabled: bool,
    seen: HashSet<String>,
    role_waiter: Option<oneshot::Sender<String>>,
}

/// One scanning module behind a [`Link`].
///
/// `state` is only ever held for short reads and writes, never across I/O, so
/// the reader task can always get at it. `op_lock` serializes the commands that
/// talk to the module.
pub struct Device<L: Link> {
    config: DeviceConfig,
    link: L,
    settle: SettleDelays,
    state: Mutex<DeviceState>,
    op_lock: tokio::sync::Mutex<()>,
    events: EventSink,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    stop: watch::Sender<bool>,
    lost: watch::Sender<bool>,
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

impl<L: Link> Device<L> {
    /// Wraps a connected link and starts the reader task. The reader also stops
    /// once `shutdown` turns true.
    pub fn connect(
        config: DeviceConfig,
        link: L,
        options: DeviceOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (events, event_rx) =
            EventSink::channel(config.device_id.clone(), options.queue_capacity);
        let device = Arc::new(Device {
            config,
            link,
            settle: options.settle,
            state: Mutex::new(DeviceState {
                connected: true,
                initialize_state: InitializeState::Uninitialized,
                is_scanning: false,
                report_enabled: false,
                seen: HashSet::new(),
                role_waiter: None,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            stop: watch::Sender::new(false),
            lost: watch::Sender::new(false),
        });
        info!(
            "[{}] Connected on {}",
            device.config.device_id, device.config.serial_path
        );
        device.spawn_reader(shutdown);
        device
    }

    fn spawn_reader(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let device = self.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let id = device.config.device_id.clone();
            loop {
                tokio::select! {
                    _ = stopped(&mut stop) => break,
                    _ = stopped(&mut shutdown) => break,
                    line = device.link.read_line() => match line {
                        Ok(Some(line)) => {
                            debug!("[{}] <- {}", id, line);
                            device.parse_incoming_line(&line);
                        }
                        Ok(None) => {
                            warn!("[{}] Link reached end of stream", id);
                            device.mark_lost();
                            break;
                        }
                        Err(e) => {
                            error!("[{}] Error reading link: {}", id, e);
                            device.mark_lost();
                            break;
                        }
                    }
                }
            }
            debug!("[{}] Reader stopped", id);
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_lost(&self) {
        self.lock_state().connected = false;
        self.lost.send_replace(true);
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn serial_path(&self) -> &str {
        &self.config.serial_path
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn status(&self) -> DeviceStatus {
        let state = self.lock_state();
        DeviceStatus {
            connected: state.connected,
            initialize_state: state.initialize_state,
            is_scanning: state.is_scanning,
            report_enabled: state.report_enabled,
        }
    }

    /// The receiving end of this device's sightings. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Resolves once the link failed or hit end of stream on its own.
    pub async fn link_lost(&self) {
        let mut lost = self.lost.subscribe();
        let _ = lost.wait_for(|lost| *lost).await;
    }

    async fn send(&self, data: &str, step: &'static str) -> Result<(), DeviceError> {
        debug!("[{}] -> {}", self.config.device_id, data.trim_end());
        self.link.write_line(data).await.map_err(|e| {
            error!("[{}] Failed to {}: {}", self.config.device_id, step, e);
            DeviceError::transport(step, e)
        })
    }

    /// Claims the init sequence. `Err` while another caller is running it.
    fn begin_initializing(&self) -> Result<bool, DeviceError> {
        let mut state = self.lock_state();
        match state.initialize_state {
            InitializeState::Uninitialized => {
                state.initialize_state = InitializeState::Initializing;
                Ok(true)
            }
            InitializeState::Initializing => {
                Err(DeviceError::Initializing(self.config.device_id.clone()))
            }
            InitializeState::Initialized => Ok(false),
        }
    }

    /// Runs the restart / role / restart sequence. Must hold `op_lock` and have
    /// claimed the sequence. A failed write leaves the state at `Initializing`.
    async fn run_init_sequence(&self) -> Result<(), DeviceError> {
        info!("[{}] Initializing device", self.config.device_id);
        let enter_command_mode = protocol::build_enter_command_mode();
        let steps = [
            ("restart device", protocol::build_restart(), self.settle.after_restart),
            (
                "enter command mode",
                enter_command_mode.to_string(),
                self.settle.after_enter_command,
            ),
            ("set role", protocol::build_set_single_role(), self.settle.after_set_role),
            (
                "restart device after role change",
                protocol::build_restart(),
                self.settle.after_second_restart,
            ),
            (
                "enter command mode after restart",
                enter_command_mode.to_string(),
                self.settle.after_second_enter_command,
            ),
        ];

        for (step, command, settle) in steps {
            self.send(&command, step).await?;
            tokio::time::sleep(settle).await;
        }

        self.lock_state().initialize_state = InitializeState::Initialized;
        info!("[{}] Device initialized", self.config.device_id);
        Ok(())
    }

    /// Brings the module into a known role and starts scanning at the
    /// configured threshold. A no-op once initialization has begun.
    pub async fn initialize(&self) -> Result<(), DeviceError> {
        match self.begin_initializing() {
            Ok(true) => {}
            Ok(false) | Err(DeviceError::Initializing(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        let _op = self.op_lock.lock().await;
        self.run_init_sequence().await?;
        self.start_observer(&self.config.rssi).await
    }

    /// Starts observer mode, initializing first if needed. An empty threshold
    /// falls back to the configured one.
    pub async fn start_scan(&self, threshold: &str) -> Result<(), DeviceError> {
        let needs_init = self.begin_initializing()?;
        let _op = self.op_lock.lock().await;
        if needs_init {
            self.run_init_sequence().await?;
        }
        let threshold = match threshold.trim() {
            "" => self.config.rssi.as_str(),
            t => t,
        };
        self.start_observer(threshold).await
    }

    async fn start_observer(&self, threshold: &str) -> Result<(), DeviceError> {
        {
            let mut state = self.lock_state();
            if state.initialize_state != InitializeState::Initialized {
                return Err(DeviceError::NotInitialized(self.config.device_id.clone()));
            }
            if state.is_scanning {
                warn!("[{}] Already scanning", self.config.device_id);
                return Ok(());
            }
            state.seen.clear();
        }

        info!(
            "[{}] Starting scan, threshold {}",
            self.config.device_id, threshold
        );
        self.send(&protocol::build_start_observer(threshold), "start observer")
            .await?;
        self.lock_state().is_scanning = true;
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<(), DeviceError> {
        let _op = self.op_lock.lock().await;
        if !self.lock_state().is_scanning {
            return Ok(());
        }
        info!("[{}] Stopping scan", self.config.device_id);
        self.send(&protocol::build_stop_observer(), "stop observer")
            .await?;
        self.lock_state().is_scanning = false;
        Ok(())
    }

    /// Starts forwarding sightings and forgets everything seen so far.
    pub fn start_report(&self) {
        let mut state = self.lock_state();
        state.report_enabled = true;
        state.seen.clear();
        info!("[{}] Reporting enabled", self.config.device_id);
    }

    pub fn stop_report(&self) {
        self.lock_state().report_enabled = false;
        info!("[{}] Reporting disabled", self.config.device_id);
    }

    /// Asks the module for its current role.
    pub async fn query_role(&self) -> Result<String, DeviceError> {
        let _op = self.op_lock.lock().await;
        let reply = {
            let mut state = self.lock_state();
            if state.initialize_state != InitializeState::Initialized {
                return Err(DeviceError::NotInitialized(self.config.device_id.clone()));
            }
            let (tx, rx) = oneshot::channel();
            state.role_waiter = Some(tx);
            rx
        };

        if let Err(e) = self.send(&protocol::build_query_role(), "query role").await {
            self.lock_state().role_waiter = None;
            return Err(e);
        }

        let line = match tokio::time::timeout(ROLE_REPLY_TIMEOUT, reply).await {
            Ok(Ok(line)) => line,
            Ok(Err(_)) => return Err(DeviceError::Protocol("role query abandoned".to_string())),
            Err(_) => {
                self.lock_state().role_waiter = None;
                return Err(DeviceError::Protocol(format!(
                    "no reply to role query within {ROLE_REPLY_TIMEOUT:?}"
                )));
            }
        };

        let role = protocol::parse_role_query_response(&line).trim();
        if role == line.trim() || role.is_empty() {
            return Err(DeviceError::Protocol(format!(
                "unparseable role reply {line:?}"
            )));
        }
        Ok(role.to_string())
    }

    /// Handles one line from the link: role replies go to a pending query,
    /// observation reports from known vendors become sightings.
    pub fn parse_incoming_line(&self, line: &str) {
        if line.starts_with("+ROLE") {
            if let Some(waiter) = self.lock_state().role_waiter.take() {
                let _ = waiter.send(line.to_string());
                return;
            }
        }

        let Some(report) = protocol::parse_advertisement_frame(line) else {
            return;
        };

        let Some(manufacturer) = Manufacturer::from_code(&report.manufacturer_code) else {
            debug!(
                "[{}] Unknown manufacturer code {}",
                self.config.device_id, report.manufacturer_code
            );
            return;
        };

        let key = report.dedup_key();
        let mut state = self.lock_state();
        if state.seen.contains(&key) || !state.report_enabled {
            return;
        }

        let sighting = Event::Sighting(DeviceSighting {
            manufacturer: manufacturer.display_name().to_string(),
            device_id: self.config.device_id.clone(),
            serial_path: self.config.serial_path.clone(),
            timestamp: now_millis(),
        });
        if self.events.push(sighting) {
            state.seen.insert(key);
            info!(
                "[{}] Found {} (RSSI {})",
                self.config.device_id,
                manufacturer.display_name(),
                report.rssi
            );
        }
    }

    /// Stops scanning and reporting, closes the link and returns to
    /// `Uninitialized`. A failed stop command is reported after the link is
    /// released anyway.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let _op = self.op_lock.lock().await;
        let was_scanning = {
            let mut state = self.lock_state();
            state.report_enabled = false;
            state.is_scanning
        };

        let result = if was_scanning {
            self.send(&protocol::build_stop_observer(), "stop observer")
                .await
        } else {
            Ok(())
        };

        self.stop.send_replace(true);
        self.link.close().await;

        {
            let mut state = self.lock_state();
            state.connected = false;
            state.is_scanning = false;
            state.initialize_state = InitializeState::Uninitialized;
            state.seen.clear();
            state.role_waiter = None;
        }
        info!("[{}] Disconnected", self.config.device_id);
        result
    }
}
