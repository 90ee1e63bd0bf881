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
    // Wrapped in a `Mutex` (rather than a bare `Option`) so `ObdClient` is
    // `Sync`: `Transport` is only required to be `Send` (§5 — it's owned
    // exclusively by the session engine once initialized), so a bare
    // `Option<Box<dyn Transport>>` would make this whole struct `!Sync` and
    // `Arc<ObdClient>` `!Send`, which `cadence::start`'s worker thread needs.
    transport: Mutex<Option<Box<dyn Transport>>>,
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
            transport: Mutex::new(Some(transport)),
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
            .lock()
            .unwrap()
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
        *self.transport.lock().unwrap() = None;
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
            let cmd = service::encode_support_probe(service, base);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedTransport;

    fn init_client(t: SimulatedTransport) -> ObdClient {
        t.add_response(b"ATZ\r", b"ELM327 v1.5\r>");
        t.add_response(b"ATE0\r", b"OK\r>");
        t.add_response(b"ATL0\r", b"OK\r>");
        t.add_response(b"ATS0\r", b"OK\r>");
        t.add_response(b"ATH1\r", b"OK\r>");
        t.add_response(b"ATAT1\r", b"OK\r>");
        t.add_response(b"ATSP0\r", b"OK\r>");
        t.add_response(b"0100\r", b"41 00 BE 1F A8 13\r>");
        t.add_response(b"ATDPN\r", b"6\r>");
        t.add_response(b"ATRV\r", b"12.6V\r>");
        let mut client = ObdClient::new(Box::new(t), SessionOptions::default());
        client.initialize().unwrap();
        client
    }

    #[test]
    fn read_pid_decodes_rpm() {
        // header 7E8, ISO-TP single-frame PCI `04` (4 data bytes follow).
        let t = SimulatedTransport::new();
        t.add_response(b"010C\r", b"7E8 04 41 0C 1A F8\r>");
        let client = init_client(t);
        let sample = client.read_pid(0x01, 0x0C).unwrap();
        assert!((sample.value - 1726.0).abs() < 1e-6);
    }

    #[test]
    fn read_pids_batched_preserves_request_order() {
        // PID $0C (2 bytes) then $0D (1 byte): SID + 0C + 2B + 0D + 1B = 6
        // data bytes, fits one ISO-TP single frame (PCI `06`).
        let t = SimulatedTransport::new();
        t.add_response(b"010C0D\r", b"7E8 06 41 0C 1A F8 0D 32\r>");
        let client = init_client(t);
        let samples = client.read_pids(&[0x0C, 0x0D]).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].definition.pid, 0x0C);
        assert_eq!(samples[1].definition.pid, 0x0D);
    }

    #[test]
    fn supported_pids_stops_at_cleared_continue_bit() {
        let t = SimulatedTransport::new();
        // Scenario 6 (§8): continue bit for `$20` is set, but we only ever
        // register a response for `$00`, so a second probe round would
        // fail the test if the chain didn't stop correctly.
        t.add_response(b"0100\r", b"7E8 06 41 00 BE 1F A8 13\r>");
        let client = init_client(t);
        let supported = client.supported_pids(0x01).unwrap();
        assert!(supported.contains(&0x0C));
        assert!(supported.contains(&0x20));
        // Memoized: a second call doesn't re-probe.
        let second = client.supported_pids(0x01).unwrap();
        assert_eq!(supported, second);
    }

    #[test]
    fn read_stored_dtcs_parses_two_codes() {
        let t = SimulatedTransport::new();
        t.add_response(b"03\r", b"7E8 05 43 01 33 02 45\r>");
        let client = init_client(t);
        let dtcs = client.read_stored_dtcs().unwrap();
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].code, "P0133");
        assert_eq!(dtcs[1].code, "P0245");
    }

    #[test]
    fn clear_dtcs_succeeds_on_bare_44_response() {
        let t = SimulatedTransport::new();
        t.add_response(b"04\r", b"44\r>");
        let client = init_client(t);
        client.clear_dtcs().unwrap();
    }

    #[test]
    fn clear_dtcs_fails_on_unexpected_response() {
        let t = SimulatedTransport::new();
        t.add_response(b"04\r", b"7F 04 11\r>");
        let client = init_client(t);
        assert!(matches!(
            client.clear_dtcs(),
            Err(DiagError::ClearDtcError(_))
        ));
    }

    #[test]
    fn read_vehicle_info_decodes_vin() {
        // Three ISO-TP frames reassembling SID 49 + infotype 02 + a
        // leading count byte + the 17 ASCII bytes of "1HGBH41JXMN109186".
        let t = SimulatedTransport::new();
        let resp = b"7E8 10 14 49 02 01 31 48 47\r\n\
                      7E8 21 42 48 34 31 4A 58 4D\r\n\
                      7E8 22 4E 31 30 39 31 38 36\r\n>";
        t.add_response(b"0902\r", resp);
        let client = init_client(t);
        let info = client.read_vehicle_info().unwrap();
        assert_eq!(info.vin.unwrap().text, "1HGBH41JXMN109186");
    }

    #[test]
    fn close_is_idempotent_and_resolves_pending_commands() {
        let t = SimulatedTransport::new();
        let mut client = init_client(t);
        client.close();
        client.close(); // must not panic
        assert!(matches!(
            client.read_pid(0x01, 0x0C),
            Err(DiagError::ConnectionClosed)
        ));
    }

    #[test]
    fn target_ecu_sends_header_and_filter_then_clears_memoization() {
        let t = SimulatedTransport::new();
        t.add_response(b"0100\r", b"7E8 06 41 00 BE 1F A8 13\r>");
        let client = init_client(t.clone());
        let _ = client.supported_pids(0x01).unwrap();
        assert!(!client.supported_pids.lock().unwrap().is_empty());

        t.add_response(b"ATSH7E9\r", b"OK\r>");
        t.add_response(b"ATCRA7E9\r", b"OK\r>");
        client.target_ecu(0x7E9).unwrap();
        assert!(client.supported_pids.lock().unwrap().is_empty());
    }

    #[test]
    fn clear_ecu_filter_restores_broadcast_addressing() {
        let t = SimulatedTransport::new();
        t.add_response(b"ATCRA\r", b"OK\r>");
        t.add_response(b"ATSH7DF\r", b"OK\r>");
        let client = init_client(t);
        client.clear_ecu_filter().unwrap();
    }

    #[test]
    fn read_freeze_frame_decodes_triggering_dtc_and_pid() {
        let t = SimulatedTransport::new();
        // PID `$02` at frame `$00` carries the triggering DTC, not an
        // engineering value: SID 42 + echoed pid 02 + echoed frame 00 +
        // the two-byte DTC word for P0133.
        t.add_response(b"020200\r", b"7E8 05 42 02 00 01 33\r>");
        // PID `$0C` (RPM) at the same frame, decoded through the normal
        // registry the same way a mode-$01 read would be.
        t.add_response(b"020C00\r", b"7E8 05 42 0C 00 1A F8\r>");
        let client = init_client(t);

        let frame = client.read_freeze_frame(0, &[0x0C]).unwrap();
        assert_eq!(frame.frame_index, 0);
        assert_eq!(frame.triggering_dtc.unwrap().code, "P0133");
        assert_eq!(frame.samples.len(), 1);
        assert_eq!(frame.samples[0].definition.pid, 0x0C);
        assert!((frame.samples[0].value - 1726.0).abs() < 1e-6);
    }
}
