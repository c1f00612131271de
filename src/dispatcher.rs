use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_derive::Deserialize;

use crate::error::RequestError;
use crate::link::Connector;
use crate::manager::Manager;
use crate::messages::Event;

pub const COMMAND_START: i64 = 1;
pub const COMMAND_STOP: i64 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start { threshold: Option<String> },
    Stop,
}

#[derive(Deserialize)]
struct RawRequest {
    c: Option<i64>,
    d: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StartData {
    rssi: Option<Threshold>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Threshold {
    Text(String),
    Number(i64),
}

/// Parses `{"c": <code>, "d": {"rssi": ...}}`.
pub fn parse_request(raw: &str) -> Result<Command, RequestError> {
    let request: RawRequest = serde_json::from_str(raw)?;
    match request.c {
        None => Err(RequestError::MissingCommand),
        Some(COMMAND_START) => {
            let threshold = match request.d {
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::Object(data)) => {
                    let data: StartData =
                        serde_json::from_value(serde_json::Value::Object(data))
                            .map_err(|e| RequestError::InvalidData(e.to_string()))?;
                    match data.rssi {
                        Some(Threshold::Text(t)) if !t.trim().is_empty() => {
                            Some(t.trim().to_string())
                        }
                        Some(Threshold::Number(n)) => Some(n.to_string()),
                        _ => None,
                    }
                }
                Some(other) => {
                    return Err(RequestError::InvalidData(format!(
                        "expected an object, got {other}"
                    )));
                }
            };
            Ok(Command::Start { threshold })
        }
        Some(COMMAND_STOP) => Ok(Command::Stop),
        Some(other) => Err(RequestError::UnknownCommand(other)),
    }
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Configured threshold, used for thresholdless starts when enabled.
    pub rssi: String,
    pub use_config_rssi: bool,
}

/// Turns start/stop requests into manager calls, one response per request.
pub struct Dispatcher<C: Connector> {
    manager: Arc<Manager<C>>,
    config: DispatchConfig,
}

impl<C: Connector> Dispatcher<C> {
    pub fn new(manager: Arc<Manager<C>>, config: DispatchConfig) -> Self {
        Dispatcher { manager, config }
    }

    /// Handles one raw request. Malformed input never reaches the manager.
    pub async fn handle(&self, raw: &str) -> Event {
        match parse_request(raw) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                warn!("Rejected request {:?}: {}", raw, e);
                Event::error(e.to_string())
            }
        }
    }

    pub async fn dispatch(&self, command: Command) -> Event {
        debug!("Dispatching {:?}", command);
        match command {
            Command::Start { threshold } => self.start(threshold).await,
            Command::Stop => self.stop().await,
        }
    }

    async fn start(&self, threshold: Option<String>) -> Event {
        let threshold = match threshold {
            Some(t) => t,
            None if self.config.use_config_rssi => self.config.rssi.clone(),
            None => String::new(),
        };
        info!("Starting scan, threshold {:?}", threshold);

        if let Err(e) = self.manager.start_scan("", &threshold).await {
            error!("Failed to start scan: {}", e);
            return Event::error(format!("Failed to start scan: {e}"));
        }
        self.manager.start_report("");
        Event::status(true, "Scan started successfully")
    }

    async fn stop(&self) -> Event {
        info!("Stopping scan");
        if let Err(e) = self.manager.stop_scan("").await {
            error!("Failed to stop scan: {}", e);
            return Event::error(format!("Failed to stop scan: {e}"));
        }
        self.manager.stop_report("");
        Event::status(true, "Scan stopped successfully")
    }
}
