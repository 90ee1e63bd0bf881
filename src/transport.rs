//! Byte-stream transport abstraction.
//!
//! The session engine ([`crate::session`]) owns exactly one [`Transport`]
//! exclusively and never shares it. Everything downstream of the physical
//! link (Bluetooth SPP, BLE GATT, WiFi TCP, USB-serial) is out of scope for
//! this crate; callers provide a [`Transport`] implementation for whichever
//! link they have.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result type used by [`Transport`] implementations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error produced by a [`Transport`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Underlying I/O error. Carries only the message: the original
    /// [`std::io::Error`] is not `Clone`.
    #[error("I/O error: {0}")]
    Io(String),
    /// The transport reported its connection lost.
    #[error("connection lost")]
    ConnectionLost,
    /// Writing to the transport exceeded its timeout.
    #[error("write timeout")]
    WriteTimeout,
    /// Reading from the transport exceeded its timeout.
    #[error("read timeout")]
    ReadTimeout,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// A bidirectional byte stream to an ELM327-class adapter.
///
/// Implementations MUST deliver bytes in order and MUST NOT rewrite content
/// (§6: "the transport MUST deliver bytes in order and MUST NOT rewrite
/// content"). [`Transport::read_nonblocking`] returns whatever is currently
/// available without blocking; an empty result is not an error.
pub trait Transport: Send {
    /// Writes `bytes` to the adapter. Implementations should apply their own
    /// write timeout and map it to [`TransportError::WriteTimeout`].
    fn write(&mut self, bytes: &[u8]) -> TransportResult<()>;

    /// Returns whatever bytes are currently available, without blocking.
    /// An empty `Vec` means "nothing yet", not an error.
    fn read_nonblocking(&mut self) -> TransportResult<Vec<u8>>;

    /// `true` once the transport has detected the link is gone. Once this
    /// returns `true` it must continue to do so.
    fn connection_lost(&self) -> bool;
}

/// An in-memory [`Transport`] for tests and documentation examples.
///
/// Requests are matched verbatim (including the trailing `\r`) against a
/// caller-populated request→response map; unmatched requests receive no
/// response at all, which the session engine times out on exactly as it
/// would a silent real adapter.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    responses: Arc<Mutex<std::collections::HashMap<Vec<u8>, Vec<u8>>>>,
    rx_queue: Arc<Mutex<VecDeque<u8>>>,
    lost: Arc<std::sync::atomic::AtomicBool>,
}

impl SimulatedTransport {
    /// Creates an empty simulated transport. Populate it with
    /// [`SimulatedTransport::add_response`] before handing it to a session.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(std::collections::HashMap::new())),
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            lost: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Registers a canned response for a given request. `req` and `resp`
    /// are both given as the exact bytes that would cross the wire
    /// (`resp` should end in the prompt byte `>`, matching a real adapter).
    pub fn add_response(&self, req: &[u8], resp: &[u8]) {
        self.responses
            .lock()
            .unwrap()
            .insert(req.to_vec(), resp.to_vec());
    }

    /// Marks the simulated link as lost; subsequent reads/writes fail.
    pub fn break_connection(&self) {
        self.lost.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedTransport {
    fn write(&mut self, bytes: &[u8]) -> TransportResult<()> {
        if self.lost.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(TransportError::ConnectionLost);
        }
        if let Some(resp) = self.responses.lock().unwrap().get(bytes) {
            self.rx_queue.lock().unwrap().extend(resp.iter().copied());
        }
        Ok(())
    }

    fn read_nonblocking(&mut self) -> TransportResult<Vec<u8>> {
        if self.lost.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(TransportError::ConnectionLost);
        }
        let mut q = self.rx_queue.lock().unwrap();
        Ok(q.drain(..).collect())
    }

    fn connection_lost(&self) -> bool {
        self.lost.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// A [`Transport`] backed by a host serial port (USB-serial or Bluetooth
/// SPP exposed as a virtual COM port), the common way real ELM327 adapters
/// show up on a desktop OS. Gated behind the `serial` feature; not used by
/// this crate's own tests.
#[cfg(feature = "serial")]
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port.name())
            .finish()
    }
}

#[cfg(feature = "serial")]
impl SerialTransport {
    /// Opens `path` (e.g. `/dev/rfcomm0`, `COM4`) at `baud_rate`.
    pub fn open(path: &str, baud_rate: u32) -> TransportResult<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self { port })
    }
}

#[cfg(feature = "serial")]
impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> TransportResult<()> {
        use std::io::Write;
        self.port
            .write_all(bytes)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn read_nonblocking(&mut self) -> TransportResult<Vec<u8>> {
        use std::io::Read;
        let available = self.port.bytes_to_read().unwrap_or(0) as usize;
        if available == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; available];
        match self.port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }

    fn connection_lost(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_transport_echoes_registered_response() {
        let t = SimulatedTransport::new();
        t.add_response(b"0100\r", b"41 00 BE 1F A8 13\r>");
        let mut t2 = t.clone();
        t2.write(b"0100\r").unwrap();
        let got = t2.read_nonblocking().unwrap();
        assert_eq!(got, b"41 00 BE 1F A8 13\r>".to_vec());
    }

    #[test]
    fn unmatched_request_yields_no_bytes() {
        let mut t = SimulatedTransport::new();
        t.write(b"0100\r").unwrap();
        assert_eq!(t.read_nonblocking().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn broken_connection_fails_read_and_write() {
        let mut t = SimulatedTransport::new();
        t.break_connection();
        assert!(matches!(
            t.write(b"0100\r"),
            Err(TransportError::ConnectionLost)
        ));
        assert!(matches!(
            t.read_nonblocking(),
            Err(TransportError::ConnectionLost)
        ));
    }
}
