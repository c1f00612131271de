use std::fmt;
use std::io;

use thiserror::Error;

/// Failures of the byte-stream link underneath a device.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("link closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    /// A write failed while performing `step`.
    #[error("failed to {step}: {source}")]
    Transport {
        step: &'static str,
        #[source]
        source: LinkError,
    },

    #[error("device {0} is still initializing")]
    Initializing(String),

    #[error("device {0} is not initialized")]
    NotInitialized(String),

    /// Missing, unparseable or out-of-sequence reply from the module.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DeviceError {
    pub fn transport(step: &'static str, source: LinkError) -> Self {
        DeviceError::Transport { step, source }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("no devices connected successfully")]
    NoDevicesConnected,

    #[error("some devices failed to {operation}: {}", FailureList(.failures))]
    PartialFailure {
        operation: &'static str,
        failures: Vec<(String, DeviceError)>,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl ManagerError {
    /// Ids of the devices named in a partial failure, empty otherwise.
    #[cfg(test)]
    pub fn failed_devices(&self) -> Vec<&str> {
        match self {
            ManagerError::PartialFailure { failures, .. } => {
                failures.iter().map(|(id, _)| id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

struct FailureList<'a>(&'a [(String, DeviceError)]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (id, err)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "device {id}: {err}")?;
        }
        Ok(())
    }
}

/// Malformed external command.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Invalid message format: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid message format: missing command code")]
    MissingCommand,

    #[error("Unknown command: {0}")]
    UnknownCommand(i64),

    #[error("Invalid request data: {0}")]
    InvalidData(String),
}
