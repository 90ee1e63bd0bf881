//! SAE J1979 service encoders, response splitting, and the bus protocol
//! enumeration ELM327's `ATDPN` reports.
//!
//! Grounded on `obd2/service01.rs` (request/response shape for modes $01
//! and $02) and `obd2/mod.rs::decode_pid_response` (walking a PID+payload
//! sequence out of a batched response).

use crate::DiagError;
use strum_macros::Display;

/// The in-vehicle bus the adapter auto-negotiated, per ELM327's numeric
/// `ATDPN` protocol codes 1-9, A.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BusProtocol {
    /// SAE J1850 PWM, 41.6 kbaud.
    #[strum(serialize = "SAE J1850 PWM")]
    J1850Pwm,
    /// SAE J1850 VPW, 10.4/41.6 kbaud.
    #[strum(serialize = "SAE J1850 VPW")]
    J1850Vpw,
    /// ISO 9141-2.
    #[strum(serialize = "ISO 9141-2")]
    Iso9141_2,
    /// ISO 14230-4 KWP, 5-baud init.
    #[strum(serialize = "ISO 14230-4 KWP (5-baud init)")]
    Kwp5Baud,
    /// ISO 14230-4 KWP, fast init.
    #[strum(serialize = "ISO 14230-4 KWP (fast init)")]
    KwpFast,
    /// ISO 15765-4 CAN, 11-bit ID, 500 kbps.
    #[strum(serialize = "ISO 15765-4 CAN (11-bit ID, 500 kbps)")]
    Can11Bit500k,
    /// ISO 15765-4 CAN, 29-bit ID, 500 kbps.
    #[strum(serialize = "ISO 15765-4 CAN (29-bit ID, 500 kbps)")]
    Can29Bit500k,
    /// ISO 15765-4 CAN, 11-bit ID, 250 kbps.
    #[strum(serialize = "ISO 15765-4 CAN (11-bit ID, 250 kbps)")]
    Can11Bit250k,
    /// ISO 15765-4 CAN, 29-bit ID, 250 kbps.
    #[strum(serialize = "ISO 15765-4 CAN (29-bit ID, 250 kbps)")]
    Can29Bit250k,
    /// SAE J1939 CAN.
    #[strum(serialize = "SAE J1939")]
    J1939,
}

impl BusProtocol {
    /// Maps an `ATDPN` numeric protocol digit (`'1'..'9'`, `'A'`) to the
    /// corresponding [`BusProtocol`]. Returns `None` for an unrecognized
    /// digit.
    pub fn from_atdpn_digit(digit: char) -> Option<Self> {
        match digit {
            '1' => Some(BusProtocol::J1850Pwm),
            '2' => Some(BusProtocol::J1850Vpw),
            '3' => Some(BusProtocol::Iso9141_2),
            '4' => Some(BusProtocol::Kwp5Baud),
            '5' => Some(BusProtocol::KwpFast),
            '6' => Some(BusProtocol::Can11Bit500k),
            '7' => Some(BusProtocol::Can29Bit500k),
            '8' => Some(BusProtocol::Can11Bit250k),
            '9' => Some(BusProtocol::Can29Bit250k),
            'A' | 'a' => Some(BusProtocol::J1939),
            _ => None,
        }
    }

    /// `true` for any CAN-based protocol variant.
    pub fn is_can(self) -> bool {
        matches!(
            self,
            BusProtocol::Can11Bit500k
                | BusProtocol::Can29Bit500k
                | BusProtocol::Can11Bit250k
                | BusProtocol::Can29Bit250k
                | BusProtocol::J1939
        )
    }
}

/// Maximum PIDs allowed in a single batched service $01 request (§4.5).
pub const MAX_BATCHED_PIDS: usize = 6;

/// Encodes a service $01 request for one or more PIDs: `"01" + pid_hex`
/// repeated, up to [`MAX_BATCHED_PIDS`] PIDs per request.
pub fn encode_service01(pids: &[u8]) -> Result<String, DiagError> {
    if pids.is_empty() {
        return Err(DiagError::InvalidRequest("no PIDs given".into()));
    }
    if pids.len() > MAX_BATCHED_PIDS {
        return Err(DiagError::InvalidRequest(format!(
            "at most {} PIDs per batched request, got {}",
            MAX_BATCHED_PIDS,
            pids.len()
        )));
    }
    let mut cmd = String::from("01");
    for pid in pids {
        cmd.push_str(&format!("{:02X}", pid));
    }
    Ok(cmd)
}

/// Encodes a service $02 (freeze frame) request: `"02" + pid_hex + frame_hex`.
pub fn encode_service02(pid: u8, frame: u8) -> String {
    format!("02{:02X}{:02X}", pid, frame)
}

/// Encodes a bare-mode request for services $03, $04, $07 or $0A.
pub fn encode_bare(service: u8) -> String {
    format!("{:02X}", service)
}

/// Encodes a service $09 (vehicle information) request: `"09" + infotype_hex`.
pub fn encode_service09(infotype: u8) -> String {
    format!("09{:02X}", infotype)
}

/// The PID support-bitmap probe chain: $00, $20, $40, ..., $E0.
pub const SUPPORT_PROBE_BASES: [u8; 8] = [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0, 0xE0];

/// Encodes a support-bitmap probe for `service`'s window `base` (§4.5:
/// "mode + PID ∈ {$00, $20, ...}" — the probe's request mode is whichever
/// service is being enumerated, not hard-coded to `$01`).
pub fn encode_support_probe(service: u8, base: u8) -> String {
    format!("{:02X}{:02X}", service, base)
}

/// Splits a batched service $01/$02 response body (everything after the
/// response SID byte, e.g. `$41`) into `(pid, payload)` pairs.
///
/// The adapter repeats the PID before each PID's own payload bytes
/// (`"0C 1A F8 0D 32"` for PIDs $0C then $0D), so this walks the body
/// using the registry's `payloadBytes` for whichever PID it reads next. A
/// PID not found in the registry, or a payload cut short, stops the walk
/// there — matching §4.8's "partial success is allowed" rule instead of
/// failing the whole response.
pub fn split_batched_response(service: u8, body: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < body.len() {
        let pid = body[i];
        i += 1;
        let Some(def) = crate::pid::lookup(service, pid) else {
            break;
        };
        if i + def.payload_bytes > body.len() {
            break;
        }
        out.push((pid, body[i..i + def.payload_bytes].to_vec()));
        i += def.payload_bytes;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_single_pid_request() {
        assert_eq!(encode_service01(&[0x0C]).unwrap(), "010C");
    }

    #[test]
    fn encodes_batched_request_up_to_six() {
        let pids = [0x04, 0x05, 0x0C, 0x0D, 0x0F, 0x11];
        assert_eq!(encode_service01(&pids).unwrap(), "0104050C0D0F11");
    }

    #[test]
    fn rejects_more_than_six_pids() {
        let pids = [0x04, 0x05, 0x0C, 0x0D, 0x0F, 0x11, 0x1F];
        assert!(matches!(
            encode_service01(&pids),
            Err(DiagError::InvalidRequest(_))
        ));
    }

    #[test]
    fn atdpn_digit_maps_to_can_protocol() {
        let bp = BusProtocol::from_atdpn_digit('6').unwrap();
        assert_eq!(bp, BusProtocol::Can11Bit500k);
        assert!(bp.is_can());
    }

    #[test]
    fn bus_protocol_displays_human_readable_name() {
        assert_eq!(
            BusProtocol::Can11Bit500k.to_string(),
            "ISO 15765-4 CAN (11-bit ID, 500 kbps)"
        );
    }

    #[test]
    fn support_probe_uses_requested_service_as_its_mode() {
        assert_eq!(encode_support_probe(0x01, 0x00), "0100");
        assert_eq!(encode_support_probe(0x09, 0x00), "0900");
    }

    #[test]
    fn split_batched_response_walks_pid_payload_pairs_in_order() {
        // PID $0C (2 bytes) then PID $0D (1 byte).
        let body = [0x0C, 0x1A, 0xF8, 0x0D, 0x32];
        let split = split_batched_response(0x01, &body);
        assert_eq!(split, vec![(0x0C, vec![0x1A, 0xF8]), (0x0D, vec![0x32])]);
    }

    #[test]
    fn split_batched_response_stops_at_unregistered_pid() {
        let body = [0x0C, 0x1A, 0xF8, 0xFE, 0x00];
        let split = split_batched_response(0x01, &body);
        assert_eq!(split, vec![(0x0C, vec![0x1A, 0xF8])]);
    }
}
