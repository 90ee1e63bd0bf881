//! Diagnostic trouble code (J2012) decoding and freeze-frame storage.
//!
//! Grounded on the `DTC`/`DTCFormatType` shape in the teacher's original
//! `dtc.rs` and the status-bit walking in `uds/read_dtc_information.rs`,
//! re-targeted from the teacher's multi-standard `DTCFormatType` (which
//! covered ISO14229-1/SAEJ1939-73/ISO11992-4 variants this crate never
//! emits) to the single J2012/J1979 two-byte word format §4.4 specifies.

use crate::pid::PidSample;

/// The first letter of a DTC, derived from the top two bits of the DTC's
/// high byte.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DtcCategory {
    /// Powertrain.
    P,
    /// Chassis.
    C,
    /// Body.
    B,
    /// Network/undefined.
    U,
}

impl DtcCategory {
    fn from_top_bits(hi: u8) -> Self {
        match (hi >> 6) & 0b11 {
            0 => DtcCategory::P,
            1 => DtcCategory::C,
            2 => DtcCategory::B,
            _ => DtcCategory::U,
        }
    }

    fn letter(self) -> char {
        match self {
            DtcCategory::P => 'P',
            DtcCategory::C => 'C',
            DtcCategory::B => 'B',
            DtcCategory::U => 'U',
        }
    }
}

/// Which request surfaced this DTC. Two DTCs sharing a code but differing
/// in `kind` are distinct entities (§3).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DtcKind {
    /// Service $03.
    Stored,
    /// Service $07.
    Pending,
    /// Service $0A.
    Permanent,
}

bitflags::bitflags! {
    /// The eight per-DTC status bits defined by J1979, when the adapter
    /// response actually carries them.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DtcStatus: u8 {
        /// Test failed at least once.
        const TEST_FAILED = 0b0000_0001;
        /// Test failed during the current drive cycle.
        const TEST_FAILED_THIS_CYCLE = 0b0000_0010;
        /// Pending DTC.
        const PENDING = 0b0000_0100;
        /// Confirmed DTC.
        const CONFIRMED = 0b0000_1000;
        /// Test not completed since last clear.
        const TEST_NOT_COMPLETED_SINCE_CLEAR = 0b0001_0000;
        /// Test failed since last clear.
        const TEST_FAILED_SINCE_CLEAR = 0b0010_0000;
        /// Test not completed this drive cycle.
        const TEST_NOT_COMPLETED_THIS_CYCLE = 0b0100_0000;
        /// Warning indicator (MIL) requested.
        const WARNING_INDICATOR_REQUESTED = 0b1000_0000;
    }
}

/// Coarse severity derived from `status`, for display purposes only.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DtcSeverity {
    /// Status unavailable, or no concerning bits set.
    Info,
    /// Confirmed but not requesting the MIL.
    Moderate,
    /// Confirmed and requesting the MIL.
    Severe,
}

/// A single decoded diagnostic trouble code.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dtc {
    /// Five-character textual code, e.g. `"P0133"`.
    pub code: String,
    /// The undecoded two-byte word.
    pub raw: u16,
    /// First letter of `code`.
    pub category: DtcCategory,
    /// Which service surfaced this code.
    pub kind: DtcKind,
    /// Status bits, when the response carried them. `None` is the
    /// "unknown" sentinel §4.4 requires rather than fabricating `false`.
    pub status: Option<DtcStatus>,
    /// Human-readable description, if a lookup table is plugged in
    /// upstream. This crate does not ship one.
    pub description: Option<String>,
}

impl Dtc {
    /// Derived severity: see [`DtcSeverity`].
    pub fn severity(&self) -> DtcSeverity {
        match self.status {
            None => DtcSeverity::Info,
            Some(s) if s.contains(DtcStatus::CONFIRMED | DtcStatus::WARNING_INDICATOR_REQUESTED) => {
                DtcSeverity::Severe
            }
            Some(s) if s.contains(DtcStatus::CONFIRMED) => DtcSeverity::Moderate,
            Some(_) => DtcSeverity::Info,
        }
    }
}

/// Decodes one DTC word `(hi, lo)` into `(category, four-hex-digit code)`.
/// Returns `None` for the suppressed `0x0000` word (§3, §4.4).
fn decode_word(hi: u8, lo: u8) -> Option<(DtcCategory, String)> {
    if hi == 0 && lo == 0 {
        return None;
    }
    let category = DtcCategory::from_top_bits(hi);
    let first_digit = (hi >> 4) & 0b11;
    let code = format!(
        "{}{:01X}{:01X}{:01X}",
        first_digit,
        hi & 0x0F,
        (lo >> 4) & 0x0F,
        lo & 0x0F
    );
    Some((category, code))
}

/// Parses a service $03/$07/$0A response body (everything after the
/// response SID byte, e.g. `$43`) into a list of DTCs tagged `kind`.
///
/// Tolerates both framing conventions some adapters use: a leading
/// "number of DTCs" count byte, or no count byte at all. An odd-length
/// body is assumed to carry the count byte; an even-length body is
/// assumed not to (§4.4).
pub fn parse_dtc_response(body: &[u8], kind: DtcKind) -> Vec<Dtc> {
    let data = if body.len() % 2 == 1 { &body[1..] } else { body };

    data.chunks_exact(2)
        .filter_map(|pair| {
            decode_word(pair[0], pair[1]).map(|(category, digits)| Dtc {
                code: format!("{}{}", category.letter(), digits),
                raw: u16::from_be_bytes([pair[0], pair[1]]),
                category,
                kind,
                status: None,
                description: None,
            })
        })
        .collect()
}

/// Snapshot of live PIDs captured at the moment a DTC matured.
#[derive(Debug, Clone)]
pub struct FreezeFrame {
    /// Frame index as reported by the ECU.
    pub frame_index: u8,
    /// The DTC that triggered this freeze frame, if known.
    pub triggering_dtc: Option<Dtc>,
    /// The PIDs captured at fault time, in response order.
    pub samples: Vec<PidSample>,
    /// When this freeze frame was read from the vehicle.
    pub timestamp: std::time::Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scenario_no_count_byte() {
        let dtcs = parse_dtc_response(&[0x01, 0x33, 0x02, 0x45], DtcKind::Stored);
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].code, "P0133");
        assert_eq!(dtcs[1].code, "P0245");
        assert!(dtcs.iter().all(|d| d.kind == DtcKind::Stored));
    }

    #[test]
    fn parse_tolerates_leading_count_byte() {
        let dtcs = parse_dtc_response(&[0x02, 0x01, 0x33, 0x02, 0x45], DtcKind::Pending);
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].code, "P0133");
    }

    #[test]
    fn all_zero_word_is_suppressed() {
        let dtcs = parse_dtc_response(&[0x00, 0x00, 0x01, 0x33], DtcKind::Permanent);
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].code, "P0133");
    }

    #[test]
    fn category_letters_cover_all_four() {
        assert_eq!(decode_word(0b0000_0000, 0x01).unwrap().0, DtcCategory::P);
        assert_eq!(decode_word(0b0100_0000, 0x01).unwrap().0, DtcCategory::C);
        assert_eq!(decode_word(0b1000_0000, 0x01).unwrap().0, DtcCategory::B);
        assert_eq!(decode_word(0b1100_0000, 0x01).unwrap().0, DtcCategory::U);
    }

    #[test]
    fn severity_without_status_is_info() {
        let dtc = Dtc {
            code: "P0133".into(),
            raw: 0x0133,
            category: DtcCategory::P,
            kind: DtcKind::Stored,
            status: None,
            description: None,
        };
        assert_eq!(dtc.severity(), DtcSeverity::Info);
    }
}
