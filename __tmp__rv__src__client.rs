===== src/client.rs =====
//! [`ObdClient`], the facade application code talks to.
//!
//! Grounded on `dynamic_diag::DynamicDiagSession`'s role as "the useful
//! wrappers for basic functions such as reading and clearing error codes"
//! sitting on top of a diagnostic server, generalized from KWP/UDS dispatch
//! to the fixed J1979 service surface this crate speaks. Per §9's design
//! note, there is exactly one such value — no session-manager singleton —
//! and it owns everything reachable: the session engine's worker thread and
//! the command queue it drains.

use crate::byte_codec;
use crate::dtc::{self, Dtc, DtcKind, FreezeFrame};
use crate::frame;
use crate::pid::{self, PidSample};
use crate::queue::CommandQueue;
use crate::service;
use crate::session::{self, AdapterInfo, SessionEngine, SessionOptions};
use crate::transport::Transport;
use crate::vin::Vin;
use crate::DiagError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Vehicle identification: VIN, calibration IDs/verification numbers, and
/// ECU names (§3). Best-effort — an unreadable VIN leaves `vin` unset
/// rather than failing the whole read (§4.8).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct VehicleInfo {
    /// The decoded VIN, if the adapter returned one of the right length.
    /// `vin.verified` is `false` rather than this being `None` when the
    /// check digit fails (§4.4).
    pub vin: Option<Vin>,
    /// One entry per calibration ID the ECU(s) reported.
    pub calibration_ids: Vec<String>,
    /// One entry per calibration verification number, rendered as hex.
    pub calibration_verification_numbers: Vec<String>,
    /// One entry per ECU name reported.
    pub ecu_names: Vec<String>,
}

/// The high-level API application code uses: read PID(s), enumerate
/// supported PIDs, read/clear DTCs, read VIN (§4.8).
///
/// Not `Clone` (mirrors the teacher's diagnostic servers) — all session
/// state is reachable through this one value.
pub struct ObdClient {
    transport: Option<Box<dyn Transport>>,
    options: SessionOptions,
    queue: Arc<Mutex<CommandQueue>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    adapter_info: Mutex<Option<AdapterInfo>>,
    supported_pids: Mutex<HashMap<u8, Vec<u8>>>,
}

impl std::fmt::Debug for ObdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObdClient")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("adapter_info", &self.adapter_info.lock().unwrap())
            .finish()
    }
}

impl ObdClient {
    /// Creates a client over `transport`, not yet initialized. Call
    /// [`ObdClient::initialize`] before issuing any other request.
    pub fn new(transport: Box<dyn Transport>, options: SessionOptions) -> Self {
        Self {
            transport: Some(transport),
            queue: Arc::new(Mutex::new(CommandQueue::new(options.queue_capacity))),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            options,
            adapter_info: Mutex::new(None),
            supported_pids: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the adapter through reset/configuration/bus-probing and, on
    /// success, starts the session's worker thread. Fails with
    /// [`DiagError::InitializationError`] if any step fails; the transport
    /// is released (dropped along with the local `SessionEngine`) rather
    /// than left half-configured (§4.8, §5).
    pub fn initialize(&mut self) -> Result<AdapterInfo, DiagError> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| DiagError::InitializationError("already initialized".into()))?;
        let mut engine = SessionEngine::new(transport, self.options);
        let info = engine.initialize()?;

        *self.adapter_info.lock().unwrap() = Some(info.clone());
        self.running.store(true, Ordering::Relaxed);
        let queue = self.queue.clone();
        let running = self.running.clone();
        self.worker = Some(std::thread::spawn(move || {
            session::run(engine, queue, running);
        }));
        Ok(info)
    }

    /// The adapter info captured during [`ObdClient::initialize`], if it
    /// has been called successfully.
    pub fn adapter_info(&self) -> Option<AdapterInfo> {
        self.adapter_info.lock().unwrap().clone()
    }

    /// Closes the session: stops the worker thread and completes any
    /// still-queued command with [`DiagError::ConnectionClosed`]. Idempotent
    /// and safe to call from any state (§5).
    pub fn close(&mut self) {
        if self.running.swap(false, Ordering::Relaxed) {
            if let Some(handle) = self.worker.take() {
                let _ = handle.join();
            }
        }
        self.queue.lock().unwrap().fail_all_connection_closed();
        self.transport = None;
    }

    fn call(&self, command: String, timeout: Duration) -> Result<Vec<u8>, DiagError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(DiagError::ConnectionClosed);
        }
        let rx = self.queue.lock().unwrap().enqueue(command, timeout)?;
        rx.recv().unwrap_or(Err(DiagError::ConnectionClosed))
    }

    fn parse_primary(&self, raw: &[u8]) -> Result<frame::EcuResponse, DiagError> {
        let text = byte_codec::decode_iso8859_1(raw);
        let responses =
            frame::parse_response(&text).map_err(|e| DiagError::ParseError(e.to_string()))?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| DiagError::ParseError("response carried no ECU record".into()))
    }

    /// Reads a single PID from service `$01`. Fails with
    /// [`DiagError::InvalidRequest`] for any service other than `$01`
    /// (multi-PID batching and freeze-frame/info reads have their own
    /// entry points).
    pub fn read_pid(&self, service: u8, pid: u8) -> Result<PidSample, DiagError> {
        if service != 0x01 {
            return Err(DiagError::InvalidRequest(format!(
                "read_pid only supports service $01, got ${service:02X}"
            )));
        }
        let cmd = service::encode_service01(&[pid])?;
        let raw = self.call(cmd, self.options.command_timeout)?;
        let primary = self.parse_primary(&raw)?;
        let body = primary.payload.get(2..).unwrap_or(&[]); // skip response SID + echoed PID
        pid::decode_sample(service, pid, body, primary.header)
    }

    /// Reads up to [`service::MAX_BATCHED_PIDS`] PIDs from service `$01` in
    /// a single request. PIDs that fail to decode are omitted from the
    /// result rather than failing the whole call (§4.8 "partial success").
    pub fn read_pids(&self, pids: &[u8]) -> Result<Vec<PidSample>, DiagError> {
        let cmd = service::encode_service01(pids)?;
        let raw = self.call(cmd, self.options.command_timeout)?;
        let primary = self.parse_primary(&raw)?;
        let body = primary.payload.get(1..).unwrap_or(&[]); // skip response SID
        let pairs = service::split_batched_response(0x01, body);
        Ok(pairs
            .into_iter()
            .filter_map(|(pid, raw)| pid::decode_sample(0x01, pid, &raw, primary.header).ok())
            .collect())
    }

    /// Reads `pids` from service `$02` (freeze frame) at `frame_index`,
    /// the snapshot captured at the moment a DTC matured (§3, §4.5). Each
    /// PID is its own `02 pp ff` request — mode `$02` has no batched form
    /// — so, as with [`ObdClient::read_pids`], a PID that fails to decode
    /// is simply omitted rather than failing the whole read.
    ///
    /// PID `$02` itself is special-cased: it carries the DTC that caused
    /// this frame to be stored rather than an engineering value, so it's
    /// read separately and surfaced as `triggering_dtc` instead of being
    /// decoded through the PID registry.
    pub fn read_freeze_frame(&self, frame_index: u8, pids: &[u8]) -> Result<FreezeFrame, DiagError> {
        let triggering_dtc = self.read_freeze_frame_triggering_dtc(frame_index);

        let mut samples = Vec::with_capacity(pids.len());
        for &requested_pid in pids {
            let cmd = service::encode_service02(requested_pid, frame_index);
            let raw = match self.call(cmd, self.options.command_timeout) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let Ok(primary) = self.parse_primary(&raw) else {
                continue;
            };
            // Response head `42 pp ff ...`: skip response SID, echoed PID,
            // and echoed frame index.
            let body = primary.payload.get(3..).unwrap_or(&[]);
            if let Ok(sample) = pid::decode_sample(0x02, requested_pid, body, primary.header) {
                samples.push(sample);
            }
        }
        Ok(FreezeFrame {
            frame_index,
            triggering_dtc,
            samples,
            timestamp: Instant::now(),
        })
    }

    fn read_freeze_frame_triggering_dtc(&self, frame_index: u8) -> Option<Dtc> {
        let cmd = service::encode_service02(0x02, frame_index);
        let raw = self.call(cmd, self.options.command_timeout).ok()?;
        let primary = self.parse_primary(&raw).ok()?;
        let body = primary.payload.get(3..)?;
        dtc::parse_dtc_response(body, DtcKind::Stored).into_iter().next()
    }

    /// Targets a single ECU for subsequent requests: `ATSH <hhh>` sets the
    /// header every outgoing command is sent under, `ATCRA <hhh>` narrows
    /// which response header the adapter passes through (§6 "Header/filter
    /// control for ECU targeting"). Grounded on `channel::BaseChannel::set_ids`'s
    /// send/receive addressing pair, retargeted to the two AT commands that
    /// do the same job on an ELM327. Clears the supported-PID memoization,
    /// since it's scoped per responding ECU.
    pub fn target_ecu(&self, header: u32) -> Result<(), DiagError> {
        self.call(format!("ATSH{:03X}", header), self.options.command_timeout)?;
        self.call(format!("ATCRA{:03X}", header), self.options.command_timeout)?;
        self.supported_pids.lock().unwrap().clear();
        Ok(())
    }

    /// Clears a previously-set ECU filter, returning to the default
    /// functional-broadcast addressing (`$7DF`) and unfiltered responses.
    pub fn clear_ecu_filter(&self) -> Result<(), DiagError> {
        self.call("ATCRA".to_string(), self.options.command_timeout)?;
        self.call("ATSH7DF".to_string(), self.options.command_timeout)?;
        self.supported_pids.lock().unwrap().clear();
        Ok(())
    }

    /// Enumerates the PIDs service `$01` supports on this vehicle, walking
    /// the support-bitmap probe chain (`$00, $20, ...`) and memoizing the
    /// result for the life of this client (§4.8).
    pub fn supported_pids(&self, service: u8) -> Result<Vec<u8>, DiagError> {
        if let Some(cached) = self.supported_pids.lock().unwrap().get(&service) {
            return Ok(cached.clone());
        }
        let mut supported = Vec::new();
        for &base in &service::SUPPORT_PROBE_BASES {
            let cmd = service::encode_support_probe(base);
            let raw = match self.call(cmd, self.options.command_timeout) {
                Ok(raw) => raw,
                Err(e) if e.is_expected() => break,
                Err(e) => return Err(e),
            };
            let primary = self.parse_primary(&raw)?;
            let data = primary.payload.get(2..).unwrap_or(&[]); // skip SID + echoed base PID
            supported.extend(pid::decode_support_bitmap(base, data));
            if !pid::bitmap_continue_bit(data) {
                break;
            }
        }
        self.supported_pids
            .lock()
            .unwrap()
            .insert(service, supported.clone());
        Ok(supported)
    }

    fn read_dtcs(&self, service: u8, kind: DtcKind) -> Result<Vec<Dtc>, DiagError> {
        let cmd = service::encode_bare(service);
        let raw = match self.call(cmd, self.options.command_timeout) {
            Ok(raw) => raw,
            Err(DiagError::NoData(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let primary = self.parse_primary(&raw)?;
        let body = primary.payload.get(1..).unwrap_or(&[]); // skip response SID
        Ok(dtc::parse_dtc_response(body, kind))
    }

    /// Reads stored DTCs via service `$03`.
    pub fn read_stored_dtcs(&self) -> Result<Vec<Dtc>, DiagError> {
        self.read_dtcs(0x03, DtcKind::Stored)
    }

    /// Reads pending DTCs via service `$07`.
    pub fn read_pending_dtcs(&self) -> Result<Vec<Dtc>, DiagError> {
        self.read_dtcs(0x07, DtcKind::Pending)
    }

    /// Reads permanent DTCs via service `$0A`.
    pub fn read_permanent_dtcs(&self) -> Result<Vec<Dtc>, DiagError> {
        self.read_dtcs(0x0A, DtcKind::Permanent)
    }

    /// Clears stored DTCs via service `$04`. Succeeds iff the response is
    /// `44` or contains `OK` (§4.8); otherwise [`DiagError::ClearDtcError`].
    pub fn clear_dtcs(&self) -> Result<(), DiagError> {
        let cmd = service::encode_bare(0x04);
        let raw = self.call(cmd, self.options.clear_dtc_timeout)?;
        let text = byte_codec::decode_iso8859_1(&raw);
        let upper = text.to_uppercase();
        if upper.contains("44") || upper.contains("OK") {
            Ok(())
        } else {
            Err(DiagError::ClearDtcError(text))
        }
    }

    fn service09_body(&self, infotype: u8) -> Option<Vec<u8>> {
        let cmd = service::encode_service09(infotype);
        let raw = self.call(cmd, self.options.command_timeout).ok()?;
        let primary = self.parse_primary(&raw).ok()?;
        primary.payload.get(2..).map(|s| s.to_vec()) // skip response SID + echoed infotype
    }

    /// Reads VIN, calibration IDs, calibration verification numbers and ECU
    /// names via service `$09`. Best-effort throughout: an unreadable field
    /// is simply absent from the result, never fabricated (§4.8).
    pub fn read_vehicle_info(&self) -> Result<VehicleInfo, DiagError> {
        let vin = self.service09_body(0x02).and_then(|body| {
            let trimmed = if body.len() == 18 { &body[1..] } else { &body[..] };
            let hex = byte_codec::bytes_to_hex(trimmed);
            crate::vin::decode_vin(&hex)
        });

        let calibration_ids = self
            .service09_body(0x04)
            .map(|body| chunk_ascii(&body, 16))
            .unwrap_or_default();

        let calibration_verification_numbers = self
            .service09_body(0x06)
            .map(|body| chunk_hex(&body, 4))
            .unwrap_or_default();

        let ecu_names = self
            .service09_body(0x0A)
            .map(|body| chunk_ascii(&body, 20))
            .unwrap_or_default();

        Ok(VehicleInfo {
            vin,
            calibration_ids,
            calibration_verification_numbers,
            ecu_names,
        })
    }
}

impl Drop for ObdClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Splits `body` into fixed-`width` ASCII items, tolerating a leading
/// item-count byte some adapters prepend (mirrors the DTC response
/// count-byte tolerance in [`crate::dtc::parse_dtc_response`]).
fn chunk_ascii(body: &[u8], width: usize) -> Vec<String> {
    let body = if !body.is_empty() && body.len() % width == 1 {
        &body[1..]
    } else {
        body
    };
    body.chunks(width)
        .filter(|c| c.len() == width)
        .map(byte_codec::printable_ascii)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Splits `body` into fixed-`width` items rendered as hex text, with the
/// same leading-count-byte tolerance as [`chunk_ascii`].
fn chunk_hex(body: &[u8], width: usize) -> Vec<String> {
    let body = if !body.is_empty() && body.len() % width == 1 {
        &body[1..]
    } else {
        body
    };
    body.chunks(width)
        .filter(|c| c.len() == width)
        .map(byte_codec::bytes_to_hex)
        .collect()
}
