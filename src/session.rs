//! The ELM327 command/response state machine: adapter reset, AT
//! configuration, bus auto-detection, and prompt-synchronized I/O (§4.7).
//!
//! Grounded on the thread-owned request/response loop in
//! `kwp2000::Kwp2000DiagnosticServer` and the negative-response handling in
//! `helpers::perform_cmd`, re-targeted from ISO-TP's binary SID framing to
//! ELM327's ASCII, prompt (`>`)-terminated framing. Where the teacher
//! retries on a transient ECU busy response, this engine instead classifies
//! the adapter's plain-text replies (`NO DATA`, `BUS BUSY`, `?`, ...) into
//! [`DiagError`] variants at this one boundary, per §7.

use crate::byte_codec::{decode_iso8859_1, encode_iso8859_1};
use crate::queue::CommandQueue;
use crate::service::BusProtocol;
use crate::transport::Transport;
use crate::DiagError;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Position in the state machine described by §4.7's diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport acquired, or the session has been closed.
    Disconnected,
    /// Sending `ATZ` and waiting for the identification banner.
    Resetting,
    /// Applying `ATE0`/`ATL0`/`ATS0`/`ATH1`/`ATAT1`.
    Configuring,
    /// Auto-negotiating the bus protocol via `ATSP0`/`ATDPN`.
    Probing,
    /// Idle, ready to accept the next application command.
    Ready,
    /// A command is currently in flight.
    Busy,
    /// Initialization failed or the adapter reported something the engine
    /// cannot recover from without a fresh `initialize()`.
    Error,
}

/// Adapter identity and auto-detected bus, returned by
/// [`SessionEngine::initialize`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterInfo {
    /// The `ATZ` identification banner, trimmed.
    pub version: String,
    /// The bus protocol `ATDPN` reported, if recognized.
    pub protocol: Option<BusProtocol>,
    /// Supply voltage from `ATRV`, when the adapter supports it.
    pub battery_voltage: Option<f32>,
}

/// Timing and capacity knobs for a session, grouped the way
/// `Kwp2000ServerOptions`/`UdsServerOptions` group theirs.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Per-command deadline for ordinary application commands (§4.7: 2s default).
    pub command_timeout: Duration,
    /// Deadline for initialization commands (§4.7: 5s default).
    pub init_timeout: Duration,
    /// Deadline for service `$04` (clear DTCs) (§4.7: 5s default).
    pub clear_dtc_timeout: Duration,
    /// Command queue capacity (§4.6: 10 default).
    pub queue_capacity: usize,
    /// Default staleness budget applied to [`crate::pid::PidSample`]s (§3).
    pub staleness_budget: Duration,
    /// Minimum period the live-data cadence will honor between ticks (§4.9).
    pub cadence_min_period: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            init_timeout: Duration::from_secs(5),
            clear_dtc_timeout: Duration::from_secs(5),
            queue_capacity: crate::queue::DEFAULT_CAPACITY,
            staleness_budget: Duration::from_secs(5),
            cadence_min_period: Duration::from_millis(200),
        }
    }
}

/// Classifies a decoded, prompt-terminated response body against the
/// adapter error vocabulary of §4.7/§7. `Ok(())` means the text is
/// application data and should be handed to the frame parser.
fn classify(command: &str, text: &str) -> Result<(), DiagError> {
    let t = text.trim();
    if t.contains("NO DATA") {
        return Err(DiagError::NoData(command.to_string()));
    }
    if t.contains("BUS BUSY") {
        return Err(DiagError::BusBusy(command.to_string()));
    }
    if t.contains("UNABLE TO CONNECT") || t.contains("STOPPED") {
        return Err(DiagError::ProtocolError {
            command: command.to_string(),
            detail: t.to_string(),
        });
    }
    if t == "?" {
        return Err(DiagError::UnknownCommand(command.to_string()));
    }
    if t.contains("ERROR") || t.contains("BUFFER FULL") {
        return Err(DiagError::AdapterError {
            command: command.to_string(),
            text: t.to_string(),
        });
    }
    Ok(())
}

/// Reads from `transport` into `buffer` until the prompt byte `>` appears,
/// or `transport` reports the link lost.
///
/// Tolerates partial reads across multiple transport deliveries. Once
/// `deadline` passes without a prompt, the read keeps going rather than
/// bailing out immediately — the caller still gets a [`DiagError::Timeout`],
/// but the engine stays byte-aligned with the adapter for the *next*
/// command instead of leaving a stray response sitting in the buffer
/// (§4.7 "prompt re-synchronization", §5).
fn read_until_prompt(
    transport: &mut dyn Transport,
    buffer: &mut Vec<u8>,
    command: &str,
    deadline: Instant,
) -> Result<Vec<u8>, DiagError> {
    let mut timed_out = false;
    loop {
        if let Some(pos) = buffer.iter().position(|&b| b == b'>') {
            let raw: Vec<u8> = buffer.drain(..pos).collect();
            buffer.remove(0); // drop the prompt byte itself
            return if timed_out {
                Err(DiagError::Timeout(command.to_string()))
            } else {
                Ok(raw)
            };
        }
        if transport.connection_lost() {
            return Err(DiagError::ConnectionClosed);
        }
        if !timed_out && Instant::now() >= deadline {
            timed_out = true;
        }
        let chunk = transport.read_nonblocking()?;
        if chunk.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        } else {
            buffer.extend(chunk);
        }
    }
}

/// Writes `command` (plus the trailing `\r`) and awaits its prompt-
/// terminated, classified response.
fn send_command(
    transport: &mut dyn Transport,
    buffer: &mut Vec<u8>,
    command: &str,
    deadline: Instant,
) -> Result<Vec<u8>, DiagError> {
    let mut wire = encode_iso8859_1(command);
    wire.push(b'\r');
    transport.write(&wire)?;
    let raw = read_until_prompt(transport, buffer, command, deadline)?;
    classify(command, &decode_iso8859_1(&raw))?;
    Ok(raw)
}

/// Like [`send_command`], but actually gives up once `giveup_at` passes
/// instead of waiting indefinitely for the prompt.
///
/// `read_until_prompt`'s refusal to give up is correct while the session is
/// still alive for a *next* command to resync with (§4.7/§5), but
/// [`SessionEngine::shutdown`] has no next command — it's the last thing
/// the engine does before the worker thread (and the transport with it)
/// goes away, so an adapter that never acknowledges `ATPC` must not be able
/// to hang `close()`/`Drop` forever.
fn send_command_bounded(
    transport: &mut dyn Transport,
    buffer: &mut Vec<u8>,
    command: &str,
    giveup_at: Instant,
) -> Result<Vec<u8>, DiagError> {
    let mut wire = encode_iso8859_1(command);
    wire.push(b'\r');
    transport.write(&wire)?;
    loop {
        if let Some(pos) = buffer.iter().position(|&b| b == b'>') {
            let raw: Vec<u8> = buffer.drain(..pos).collect();
            buffer.remove(0);
            classify(command, &decode_iso8859_1(&raw))?;
            return Ok(raw);
        }
        if transport.connection_lost() {
            return Err(DiagError::ConnectionClosed);
        }
        if Instant::now() >= giveup_at {
            return Err(DiagError::Timeout(command.to_string()));
        }
        let chunk = transport.read_nonblocking()?;
        if chunk.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        } else {
            buffer.extend(chunk);
        }
    }
}

fn parse_voltage(text: &str) -> Option<f32> {
    let digits: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

/// Owns the transport exclusively and drives it through §4.7's state
/// machine. A single `SessionEngine` is created by [`crate::client::ObdClient::initialize`],
/// run synchronously to reach `Ready`, then handed to a dedicated worker
/// thread for the lifetime of the session (§5's "single-threaded
/// cooperative logical owner").
pub struct SessionEngine {
    transport: Box<dyn Transport>,
    buffer: Vec<u8>,
    state: SessionState,
    options: SessionOptions,
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("state", &self.state)
            .field("options", &self.options)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl SessionEngine {
    /// Creates an engine over `transport`, in state `Disconnected`.
    pub fn new(transport: Box<dyn Transport>, options: SessionOptions) -> Self {
        Self {
            transport,
            buffer: Vec::new(),
            state: SessionState::Disconnected,
            options,
        }
    }

    /// Current position in the state machine.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn send_text(&mut self, command: &str, timeout: Duration) -> Result<String, DiagError> {
        let deadline = Instant::now() + timeout;
        let raw = send_command(self.transport.as_mut(), &mut self.buffer, command, deadline)?;
        Ok(decode_iso8859_1(&raw))
    }

    /// Runs `Resetting → Configuring → Probing → Ready` (§4.7). On any
    /// failure the engine is left in `Error` and the transport is dropped
    /// with this `SessionEngine` when it goes out of scope, releasing it
    /// per §5's "guaranteed released on any path that leaves `initialize()`
    /// unsuccessfully".
    pub fn initialize(&mut self) -> Result<AdapterInfo, DiagError> {
        self.state = SessionState::Resetting;
        debug!("session: sending ATZ");
        let banner = self
            .send_text("ATZ", self.options.init_timeout)
            .map_err(|e| {
                self.state = SessionState::Error;
                DiagError::InitializationError(format!("ATZ produced no banner: {e}"))
            })?;
        std::thread::sleep(Duration::from_secs(1));

        self.state = SessionState::Configuring;
        for cmd in ["ATE0", "ATL0", "ATS0", "ATH1", "ATAT1"] {
            if let Err(e) = self.send_text(cmd, self.options.init_timeout) {
                self.state = SessionState::Error;
                return Err(DiagError::InitializationError(format!(
                    "{cmd} was rejected: {e}"
                )));
            }
        }

        self.state = SessionState::Probing;
        if let Err(e) = self.send_text("ATSP0", self.options.init_timeout) {
            self.state = SessionState::Error;
            return Err(DiagError::InitializationError(format!(
                "ATSP0 failed: {e}"
            )));
        }
        // Force the adapter to auto-negotiate against the bus. A NoData or
        // BusBusy here (key off, no ECUs awake yet) is expected and does not
        // fail initialization.
        let _ = self.send_text("0100", self.options.init_timeout);

        let protocol = self
            .send_text("ATDPN", self.options.init_timeout)
            .ok()
            // An adapter that auto-detected the bus prefixes the digit with
            // `A` (e.g. `"A6"`); the protocol digit itself is always the
            // last character, never the first.
            .and_then(|resp| resp.trim().chars().last())
            .and_then(BusProtocol::from_atdpn_digit);

        let battery_voltage = self
            .send_text("ATRV", self.options.command_timeout)
            .ok()
            .and_then(|resp| parse_voltage(&resp));

        self.state = SessionState::Ready;
        info!(
            "session: adapter ready ({}), protocol={:?}",
            banner.trim(),
            protocol
        );
        Ok(AdapterInfo {
            version: banner.trim().to_string(),
            protocol,
            battery_voltage,
        })
    }

    /// Sends one application command and awaits its raw, classified
    /// response bytes. Transitions `Ready → Busy → Ready` around the
    /// exchange (§4.7).
    pub fn execute(&mut self, command: &str, deadline: Instant) -> Result<Vec<u8>, DiagError> {
        self.state = SessionState::Busy;
        let result = send_command(self.transport.as_mut(), &mut self.buffer, command, deadline);
        self.state = SessionState::Ready;
        result
    }

    /// `true` once the owned transport has signalled the link is gone.
    pub fn connection_lost(&self) -> bool {
        self.transport.connection_lost()
    }

    /// Sends `ATPC` and marks the engine `Disconnected`. Best-effort: a
    /// failure to reach the adapter here does not change the outcome.
    ///
    /// Uses [`send_command_bounded`] rather than [`Self::send_text`]: there's
    /// no next command left in this session for `read_until_prompt`'s
    /// indefinite resync wait to protect, so an adapter that never
    /// acknowledges `ATPC` must not be able to wedge teardown forever.
    pub fn shutdown(&mut self) {
        if self.state != SessionState::Disconnected {
            let giveup_at = Instant::now() + self.options.command_timeout;
            let _ = send_command_bounded(
                self.transport.as_mut(),
                &mut self.buffer,
                "ATPC",
                giveup_at,
            );
        }
        self.state = SessionState::Disconnected;
    }
}

/// The worker loop a session thread runs for the lifetime of the session:
/// dequeue one [`crate::queue::QueuedCommand`], execute it against `engine`,
/// fulfill its completion slot, repeat. On transport failure or `running`
/// being cleared, every remaining queued entry is completed with
/// [`DiagError::ConnectionClosed`] (§4.6, §5).
///
/// Grounded on `Kwp2000DiagnosticServer::new_over_iso_tp`'s spawned thread
/// loop, simplified from its tester-present interleaving (not applicable to
/// ELM327) down to the bare dequeue/execute/complete cycle.
pub fn run(mut engine: SessionEngine, queue: Arc<Mutex<CommandQueue>>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        let next = queue.lock().unwrap().dequeue();
        match next {
            Some(cmd) => {
                if engine.connection_lost() {
                    cmd.complete(Err(DiagError::ConnectionClosed));
                    running.store(false, Ordering::Relaxed);
                    break;
                }
                let deadline = cmd.deadline_at;
                let command = cmd.command.clone();
                let result = engine.execute(&command, deadline);
                if let Err(e) = &result {
                    if !e.is_expected() {
                        warn!("session: `{command}` failed: {e}");
                    }
                }
                cmd.complete(result);
            }
            None => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    engine.shutdown();
    queue.lock().unwrap().fail_all_connection_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedTransport;

    fn ready_transport() -> SimulatedTransport {
        let t = SimulatedTransport::new();
        t.add_response(b"ATZ\r", b"ELM327 v1.5\r>");
        t.add_response(b"ATE0\r", b"OK\r>");
        t.add_response(b"ATL0\r", b"OK\r>");
        t.add_response(b"ATS0\r", b"OK\r>");
        t.add_response(b"ATH1\r", b"OK\r>");
        t.add_response(b"ATAT1\r", b"OK\r>");
        t.add_response(b"ATSP0\r", b"OK\r>");
        t.add_response(b"0100\r", b"41 00 BE 1F A8 13\r>");
        t.add_response(b"ATDPN\r", b"A6\r>");
        t.add_response(b"ATRV\r", b"12.6V\r>");
        t
    }

    #[test]
    fn initialize_reaches_ready_and_reports_adapter_info() {
        let mut engine = SessionEngine::new(Box::new(ready_transport()), SessionOptions::default());
        let info = engine.initialize().unwrap();
        assert_eq!(engine.state(), SessionState::Ready);
        assert_eq!(info.version, "ELM327 v1.5");
        assert_eq!(info.protocol, Some(BusProtocol::Can11Bit500k));
        assert!((info.battery_voltage.unwrap() - 12.6).abs() < 1e-3);
    }

    #[test]
    fn configuration_rejection_fails_initialization() {
        let t = SimulatedTransport::new();
        t.add_response(b"ATZ\r", b"ELM327 v1.5\r>");
        t.add_response(b"ATE0\r", b"?\r>");
        let mut engine = SessionEngine::new(Box::new(t), SessionOptions::default());
        assert!(matches!(
            engine.initialize(),
            Err(DiagError::InitializationError(_))
        ));
        assert_eq!(engine.state(), SessionState::Error);
    }

    #[test]
    fn no_banner_fails_initialization() {
        // An ATZ that never gets a reply keeps `read_until_prompt` waiting
        // indefinitely by design (§4.7/§5: a deadline expiry must not
        // desynchronize the byte stream, so it can't give up early). A
        // broken link is what actually bounds that wait here.
        let t = SimulatedTransport::new();
        t.break_connection();
        let mut options = SessionOptions::default();
        options.init_timeout = Duration::from_millis(20);
        let mut engine = SessionEngine::new(Box::new(t), options);
        assert!(matches!(
            engine.initialize(),
            Err(DiagError::InitializationError(_))
        ));
    }

    #[test]
    fn execute_classifies_no_data() {
        let t = ready_transport();
        t.add_response(b"010C\r", b"NO DATA\r>");
        let mut engine = SessionEngine::new(Box::new(t), SessionOptions::default());
        engine.initialize().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(matches!(
            engine.execute("010C", deadline),
            Err(DiagError::NoData(_))
        ));
        assert_eq!(engine.state(), SessionState::Ready);
    }

    #[test]
    fn execute_classifies_bus_busy_and_can_error() {
        let t = ready_transport();
        t.add_response(b"0902\r", b"BUS BUSY\r>");
        t.add_response(b"04\r", b"CAN ERROR\r>");
        let mut engine = SessionEngine::new(Box::new(t), SessionOptions::default());
        engine.initialize().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(matches!(
            engine.execute("0902", deadline),
            Err(DiagError::BusBusy(_))
        ));
        assert!(matches!(
            engine.execute("04", deadline),
            Err(DiagError::AdapterError { .. })
        ));
    }

    #[test]
    fn past_deadline_still_resyncs_and_reports_timeout() {
        let t = ready_transport();
        t.add_response(b"010C\r", b"41 0C 1A F8\r>");
        let mut engine = SessionEngine::new(Box::new(t), SessionOptions::default());
        engine.initialize().unwrap();

        // The response is already sitting in the transport by the time we
        // call `execute`, but a deadline in the past must still surface as
        // a Timeout rather than a success (§4.7/§5: deadline expiry doesn't
        // cancel the underlying wait for the prompt).
        let past_deadline = Instant::now() - Duration::from_millis(50);
        let result = engine.execute("010C", past_deadline);
        assert!(matches!(result, Err(DiagError::Timeout(_))));
        assert_eq!(engine.state(), SessionState::Ready);

        // The session stays byte-aligned: the next command pairs correctly
        // with its own response instead of picking up a stray leftover.
        let deadline = Instant::now() + Duration::from_secs(2);
        let raw = engine.execute("010C", deadline).unwrap();
        assert_eq!(raw, b"41 0C 1A F8".to_vec());
    }
}
