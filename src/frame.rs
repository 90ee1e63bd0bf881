//! Splits ELM327 response blocks into per-ECU records, demultiplexing on
//! the CAN header and reassembling ISO-TP (ISO 15765-2) multi-frame
//! payloads.
//!
//! Grounded on the frame typing and out-of-order sequence check in
//! `I-CAN-hack-automotive`'s `isotp` module, adapted from raw CAN frames to
//! the text lines an ELM327 in `ATH1` mode actually emits (e.g.
//! `7E8 06 41 00 BE 1F A8 13`), and on `channel.rs`'s header/payload split
//! for the request/response addressing model.

use crate::byte_codec::{hex_digits_to_bytes, strip_adapter_noise};
use std::collections::HashMap;

/// The ECU a response line was attributed to, per the standard response
/// address table (§6). Unmapped headers retain their raw numeric value
/// rather than being discarded.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EcuRole {
    /// `$7E8`
    Engine,
    /// `$7E9`
    Transmission,
    /// `$7EA`
    Abs,
    /// `$7EB`
    Airbag,
    /// `$7EC`
    Body,
    /// `$7ED`
    Climate,
    /// Any header outside the mapped range, or no header at all (carries 0).
    Unknown(u32),
}

fn role_from_header(header: u32) -> EcuRole {
    match header {
        0x7E8 => EcuRole::Engine,
        0x7E9 => EcuRole::Transmission,
        0x7EA => EcuRole::Abs,
        0x7EB => EcuRole::Airbag,
        0x7EC => EcuRole::Body,
        0x7ED => EcuRole::Climate,
        other => EcuRole::Unknown(other),
    }
}

/// One demultiplexed response record. A single request may yield several
/// of these — one per responding ECU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuResponse {
    /// The 11-bit or 29-bit CAN header, if the line had a recognizable one.
    pub header: Option<u32>,
    /// ECU role inferred from `header` via the standard address table.
    pub role: EcuRole,
    /// The fully reassembled payload (service byte onward), with any
    /// ISO-TP PCI bytes stripped.
    pub payload: Vec<u8>,
    /// The original text line(s) this record was built from, joined by `\n`.
    pub raw_line: String,
}

/// Failure modes specific to frame reassembly. Callers convert this to
/// [`crate::DiagError::ParseError`] at the session boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// A first-frame was opened but its declared length was never reached
    /// before the response block ended (§4.2: "missing consecutive frame
    /// within the adapter-driven inter-frame timeout").
    #[error("multi-frame response incomplete")]
    Incomplete,
}

enum Pci {
    Single { data: Vec<u8> },
    First { total_len: usize, data: Vec<u8> },
    Consecutive { seq: u8, data: Vec<u8> },
    Other,
}

fn decode_pci(payload: &[u8]) -> Pci {
    if payload.is_empty() {
        return Pci::Other;
    }
    let top = payload[0] >> 4;
    match top {
        0 => {
            let len = (payload[0] & 0x0F) as usize;
            let data = payload.get(1..1 + len).unwrap_or(&payload[1..]).to_vec();
            Pci::Single { data }
        }
        1 => {
            if payload.len() < 2 {
                return Pci::Other;
            }
            let total_len = (((payload[0] & 0x0F) as usize) << 8) | payload[1] as usize;
            Pci::First {
                total_len,
                data: payload[2..].to_vec(),
            }
        }
        2 => Pci::Consecutive {
            seq: payload[0] & 0x0F,
            data: payload[1..].to_vec(),
        },
        _ => Pci::Other,
    }
}

/// Splits `digits` (a hex string with whitespace already removed) into an
/// optional header plus the remaining hex digits, trying an 11-bit header
/// (three hex digits) then a 29-bit header (eight hex digits), in that
/// order, per §4.2. A candidate is only accepted if what remains forms
/// whole bytes.
fn split_header(digits: &str) -> (Option<u32>, &str) {
    if digits.len() > 3 && (digits.len() - 3) % 2 == 0 {
        if let Ok(h) = u32::from_str_radix(&digits[..3], 16) {
            return (Some(h), &digits[3..]);
        }
    }
    if digits.len() > 8 && (digits.len() - 8) % 2 == 0 {
        if let Ok(h) = u32::from_str_radix(&digits[..8], 16) {
            return (Some(h), &digits[8..]);
        }
    }
    (None, digits)
}

struct Accumulation {
    total_len: usize,
    data: Vec<u8>,
    next_seq: u8,
    raw_lines: Vec<String>,
    poisoned: bool,
}

/// Parses one prompt-terminated response block into per-ECU records.
///
/// See module docs for the line-splitting and header-matching rules, and
/// [`FrameError`] for what happens when a multi-frame response never
/// completes within the block.
pub fn parse_response(raw: &str) -> Result<Vec<EcuResponse>, FrameError> {
    let lines = strip_adapter_noise(raw);
    let mut out = Vec::new();
    let mut pending: HashMap<Option<u32>, Accumulation> = HashMap::new();

    for line in &lines {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        let (header, rest) = split_header(&compact);
        let payload = hex_digits_to_bytes(rest);

        if header.is_none() {
            // No recognizable header: the whole line is payload, unparsed
            // as ISO-TP (non-CAN protocols don't carry a PCI byte).
            out.push(EcuResponse {
                header: None,
                role: EcuRole::Unknown(0),
                payload,
                raw_line: line.clone(),
            });
            continue;
        }

        match decode_pci(&payload) {
            Pci::Single { data } => {
                out.push(EcuResponse {
                    header,
                    role: role_from_header(header.unwrap()),
                    payload: data,
                    raw_line: line.clone(),
                });
            }
            Pci::First { total_len, data } => {
                pending.insert(
                    header,
                    Accumulation {
                        total_len,
                        data,
                        next_seq: 1,
                        raw_lines: vec![line.clone()],
                        poisoned: false,
                    },
                );
            }
            Pci::Consecutive { seq, data } => {
                if let Some(acc) = pending.get_mut(&header) {
                    if acc.poisoned {
                        continue;
                    }
                    if seq != acc.next_seq % 16 {
                        // Out-of-order: discard this header's reassembly entirely.
                        acc.poisoned = true;
                        continue;
                    }
                    acc.data.extend(data);
                    acc.raw_lines.push(line.clone());
                    acc.next_seq = acc.next_seq.wrapping_add(1);
                    if acc.data.len() >= acc.total_len {
                        acc.data.truncate(acc.total_len);
                        let acc = pending.remove(&header).unwrap();
                        out.push(EcuResponse {
                            header,
                            role: role_from_header(header.unwrap()),
                            payload: acc.data,
                            raw_line: acc.raw_lines.join("\n"),
                        });
                    }
                }
                // A consecutive frame with no matching first frame is ignored.
            }
            Pci::Other => {}
        }
    }

    if pending.values().any(|acc| !acc.poisoned) {
        return Err(FrameError::Incomplete);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_two_ecus_split_by_header() {
        let raw = "7E8 06 41 00 BE 1F A8 13\r\n7E9 06 41 00 80 00 00 01\r\n>";
        let res = parse_response(raw).unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].role, EcuRole::Engine);
        assert_eq!(res[0].payload, vec![0x41, 0x00, 0xBE, 0x1F, 0xA8, 0x13]);
        assert_eq!(res[1].role, EcuRole::Transmission);
    }

    #[test]
    fn noise_lines_are_dropped() {
        let raw = "SEARCHING...\r\n7E8 03 41 0C\r\nOK\r\n>";
        let res = parse_response(raw).unwrap();
        assert_eq!(res.len(), 1);
    }

    #[test]
    fn multi_frame_reassembly_in_order() {
        // First frame: total_len=10, data bytes [0x49,0x02,0x01]
        // Consecutive frame seq 1: remaining 7 bytes.
        let raw = "7E8 10 0A 49 02 01 31 48\r\n7E8 21 47 42 48 34 31 4A\r\n>";
        let res = parse_response(raw).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].payload.len(), 10);
    }

    #[test]
    fn out_of_order_consecutive_frame_is_discarded() {
        // Consecutive frame claims seq 3 when seq 1 was expected.
        let raw = "7E8 10 0A 49 02 01 31 48\r\n7E8 23 47 42 48 34 31 4A\r\n>";
        let res = parse_response(raw).unwrap();
        assert!(res.is_empty());
    }

    #[test]
    fn incomplete_multiframe_errors() {
        let raw = "7E8 10 0A 49 02 01 31 48\r\n>";
        assert_eq!(parse_response(raw), Err(FrameError::Incomplete));
    }

    #[test]
    fn unknown_header_line_passes_through_as_raw_payload() {
        let raw = "41 0C 1A F8\r\n>";
        let res = parse_response(raw).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].header, None);
        assert_eq!(res[0].payload, vec![0x41, 0x0C, 0x1A, 0xF8]);
    }
}
