//! Line-oriented duplex links to the scanning modules.

use std::future::Future;
use std::io::{self, Read as _, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};
use serialport::SerialPort;
use tokio::sync::mpsc;

use crate::config::DeviceConfig;
use crate::error::LinkError;

/// A connected byte stream that yields and accepts text lines.
///
/// Methods take `&self` so one task can sit in `read_line` while others write.
pub trait Link: Send + Sync + 'static {
    /// Next line without its terminator, or `None` at end of stream.
    fn read_line(&self) -> impl Future<Output = Result<Option<String>, LinkError>> + Send;

    /// Writes `data` verbatim. Callers supply any terminator themselves.
    fn write_line(&self, data: &str) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Releases the underlying port. Pending and later reads end promptly.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens links for configured devices.
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    fn connect(
        &self,
        config: &DeviceConfig,
    ) -> impl Future<Output = Result<Self::Link, LinkError>> + Send;
}

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const LINE_QUEUE: usize = 256;

/// Closed flag shared with the reader thread. Set on `close()` and on drop, so
/// the thread also exits for links that are dropped without being closed.
struct CloseSignal(Arc<AtomicBool>);

impl CloseSignal {
    fn new() -> Self {
        CloseSignal(Arc::new(AtomicBool::new(false)))
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// True if this call did the closing.
    fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

impl Drop for CloseSignal {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct SerialLink {
    path: String,
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    lines: tokio::sync::Mutex<mpsc::Receiver<io::Result<String>>>,
    closed: CloseSignal,
}

impl SerialLink {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let open_error = |e: serialport::Error| LinkError::Open {
            path: path.to_string(),
            reason: e.to_string(),
        };

        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(open_error)?;
        let reader = port.try_clone().map_err(open_error)?;

        let closed = CloseSignal::new();
        let (tx, rx) = mpsc::channel(LINE_QUEUE);

        let thread_closed = closed.flag();
        let thread_path = path.to_string();
        std::thread::Builder::new()
            .name(format!("serial-reader {path}"))
            .spawn(move || read_lines(&thread_path, reader, thread_closed, tx))?;

        debug!("Opened serial port {} at {} baud", path, baud_rate);

        Ok(SerialLink {
            path: path.to_string(),
            writer: Arc::new(Mutex::new(port)),
            lines: tokio::sync::Mutex::new(rx),
            closed,
        })
    }
}

/// Blocking reader loop. The port timeout bounds how long a closed link keeps
/// this thread alive.
fn read_lines<R: io::Read>(
    path: &str,
    mut port: R,
    closed: Arc<AtomicBool>,
    tx: mpsc::Sender<io::Result<String>>,
) {
    let mut buf = [0u8; 256];
    let mut pending: Vec<u8> = Vec::new();

    while !closed.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = pending.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let line = String::from_utf8_lossy(&line).into_owned();
                    if tx.blocking_send(Ok(line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Error reading {}: {}", path, e);
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
    debug!("Serial reader for {} stopped", path);
}

impl Link for SerialLink {
    async fn read_line(&self) -> Result<Option<String>, LinkError> {
        if self.closed.is_set() {
            return Ok(None);
        }
        match self.lines.lock().await.recv().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(LinkError::Io(e)),
            None => Ok(None),
        }
    }

    async fn write_line(&self, data: &str) -> Result<(), LinkError> {
        if self.closed.is_set() {
            return Err(LinkError::Closed);
        }
        let writer = self.writer.clone();
        let data = data.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = writer
                .lock()
                .map_err(|_| io::Error::other("serial writer lock poisoned"))?;
            port.write_all(&data)?;
            port.flush()
        })
        .await
        .map_err(io::Error::other)??;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.set() {
            debug!("Closing serial port {}", self.path);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Link = SerialLink;

    async fn connect(&self, config: &DeviceConfig) -> Result<SerialLink, LinkError> {
        let path = config.serial_path.clone();
        let baud_rate = config.baud_rate;
        tokio::task::spawn_blocking(move || SerialLink::open(&path, baud_rate))
            .await
            .map_err(|e| LinkError::Io(io::Error::other(e)))?
    }
}
