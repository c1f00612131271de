use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::Serializer;
use serde_derive::Serialize;
use tokio::sync::mpsc;

/// Wire tags for the `t` field of every outbound message.
pub mod tag {
    pub const STATUS: u8 = 1;
    pub const ERROR: u8 = 2;
    pub const SIGHTING: u8 = 3;
    pub const HEARTBEAT: u8 = 4;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceSighting {
    #[serde(rename = "mf")]
    pub manufacturer: String,
    #[serde(rename = "did")]
    pub device_id: String,
    #[serde(rename = "sp")]
    pub serial_path: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Everything that flows out to the consumer: sightings and heartbeats on the
/// event stream, status and error as command responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Sighting(DeviceSighting),
    Heartbeat { run: bool },
    Status { success: bool, message: String },
    Error { message: String },
}

#[derive(Serialize)]
struct Envelope<T> {
    t: u8,
    d: T,
}

#[derive(Serialize)]
struct HeartbeatData {
    run: bool,
}

#[derive(Serialize)]
struct StatusData<'a> {
    success: bool,
    message: &'a str,
}

#[derive(Serialize)]
struct ErrorData<'a> {
    error: &'a str,
}

impl Event {
    pub fn status(success: bool, message: impl Into<String>) -> Self {
        Event::Status {
            success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Event::Status { .. } => tag::STATUS,
            Event::Error { .. } => tag::ERROR,
            Event::Sighting(_) => tag::SIGHTING,
            Event::Heartbeat { .. } => tag::HEARTBEAT,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn envelope<T: serde::Serialize, S: Serializer>(t: u8, d: T, serializer: S) -> Result<S::Ok, S::Error> {
    serde::Serialize::serialize(&Envelope { t, d }, serializer)
}

impl serde::Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let t = self.tag();
        match self {
            Event::Sighting(sighting) => envelope(t, sighting, serializer),
            Event::Heartbeat { run } => envelope(t, HeartbeatData { run: *run }, serializer),
            Event::Status { success, message } => envelope(
                t,
                StatusData {
                    success: *success,
                    message,
                },
                serializer,
            ),
            Event::Error { message } => envelope(t, ErrorData { error: message }, serializer),
        }
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Producer side of a bounded event queue. Pushing never waits: when the queue
/// is full the new event is dropped and reported as such.
#[derive(Clone, Debug)]
pub struct EventSink {
    name: String,
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub fn channel(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            EventSink {
                name: name.into(),
                tx,
            },
            rx,
        )
    }

    /// Returns `false` if the event was dropped.
    pub fn push(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("[{}] event queue full, dropping {:?}", self.name, event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("[{}] event queue closed", self.name);
                false
            }
        }
    }
}
