#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

//! A crate for talking to a vehicle over an ELM327-class OBD-II adapter.
//!
//! The adapter bridges a host byte stream (USB-serial, Bluetooth SPP, WiFi)
//! to the vehicle's diagnostic bus (CAN, K-Line, or J1850). This crate owns
//! everything on the host side of that bridge:
//!
//! * [`session`] - the ELM327 command/response state machine: adapter reset,
//!   configuration, bus auto-detection, and prompt-synchronized I/O.
//! * [`service`] - encoders and decoders for SAE J1979 services $01-$0A.
//! * [`pid`] - the Parameter ID registry: formulas, units, ranges and
//!   warning/critical thresholds.
//! * [`dtc`] - diagnostic trouble code and freeze-frame decoding.
//! * [`vin`] - VIN decoding with ISO-3779 checksum validation.
//! * [`frame`] - splits adapter output into per-ECU records and reassembles
//!   ISO-TP multi-frame responses.
//! * [`client`] - [`client::ObdClient`], the facade application code uses.
//! * [`cadence`] - periodic batched sampling for live telemetry.
//!
//! The transport itself (the actual Bluetooth/USB/WiFi link) is outside this
//! crate's scope; it is represented by the [`transport::Transport`] trait.

use transport::TransportError;

pub mod byte_codec;
pub mod cadence;
pub mod client;
pub mod dtc;
pub mod frame;
pub mod pid;
pub mod queue;
pub mod service;
pub mod session;
pub mod transport;
pub mod vin;

/// Result type returned by all fallible operations in this crate.
pub type DiagResult<T> = Result<T, DiagError>;

/// The complete error taxonomy surfaced by this crate.
///
/// Every transport-adjacent failure is classified at the session engine
/// boundary (see [`session`]); higher layers never see a raw
/// [`TransportError`] directly except wrapped in [`DiagError::Transport`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiagError {
    /// The adapter did not reach the `Ready` state during [`client::ObdClient::initialize`].
    #[error("adapter initialization failed: {0}")]
    InitializationError(String),
    /// The adapter refused a command, reported `UNABLE TO CONNECT`, or the bus is down.
    #[error("protocol error on `{command}`: {detail}")]
    ProtocolError {
        /// The command that was sent.
        command: String,
        /// Adapter-supplied detail text.
        detail: String,
    },
    /// The vehicle did not respond to the request. Not a fault, just absence.
    #[error("no data for `{0}`")]
    NoData(String),
    /// The bus is transiently busy; the caller may retry.
    #[error("bus busy on `{0}`")]
    BusBusy(String),
    /// The per-command deadline was exceeded. The session remains aligned.
    #[error("timeout waiting for `{0}`")]
    Timeout(String),
    /// The adapter reported `ERROR`, `CAN ERROR`, `BUFFER FULL`, or similar.
    #[error("adapter error on `{command}`: {text}")]
    AdapterError {
        /// The command that was sent.
        command: String,
        /// The raw adapter response text.
        text: String,
    },
    /// The adapter replied `?` to a command it didn't recognize.
    #[error("adapter did not recognize `{0}`")]
    UnknownCommand(String),
    /// The response was structurally unusable.
    #[error("parse error: {0}")]
    ParseError(String),
    /// The PID is not in the vehicle's support bitmap.
    #[error("PID ${pid:02X} of service ${service:02X} is not supported by this vehicle")]
    UnsupportedPid {
        /// Service byte, e.g. `0x01`.
        service: u8,
        /// PID byte.
        pid: u8,
    },
    /// A caller-side precondition was violated, e.g. more than 6 PIDs in one batch.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Service $04 (clear DTCs) did not acknowledge.
    #[error("clear DTC failed: {0}")]
    ClearDtcError(String),
    /// The command queue is at capacity.
    #[error("command queue is full")]
    QueueFull,
    /// The session is closed. Fatal; all in-flight commands resolve with this once.
    #[error("connection closed")]
    ConnectionClosed,
    /// Error from the underlying byte-stream transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DiagError {
    /// `true` for errors that are normal, expected outcomes rather than faults
    /// (spec: "`NoData` and `BusBusy` are normal outcomes, not logged as errors").
    pub fn is_expected(&self) -> bool {
        matches!(self, DiagError::NoData(_) | DiagError::BusBusy(_))
    }

    /// `true` for errors that terminate the session and cannot be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DiagError::ConnectionClosed | DiagError::InitializationError(_)
        )
    }
}
