===== src/pid/mod.rs =====
//! Parameter ID registry: the table of (service, pid) → decode formula,
//! unit, range and thresholds, plus the [`PidSample`] values it produces.

mod table;
pub mod units;

pub use table::{
    decode_bit_flags, decode_support_bitmap, bitmap_continue_bit, lookup, BitFlag, PidCategory,
    PidDefinition, ThresholdDirection,
};

use crate::DiagError;
use std::time::Instant;

/// Health classification of a decoded sample against its definition's
/// warning/critical thresholds.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueStatus {
    /// No threshold crossed.
    Normal,
    /// Warning threshold crossed, critical not.
    Warning,
    /// Critical threshold crossed.
    Critical,
}

fn derive_status(def: &PidDefinition, value: f64) -> ValueStatus {
    let crossed = |threshold: f64| match def.direction {
        ThresholdDirection::AboveIsBad => value >= threshold,
        ThresholdDirection::BelowIsBad => value <= threshold,
    };
    if def.critical.is_some_and(crossed) {
        ValueStatus::Critical
    } else if def.warning.is_some_and(crossed) {
        ValueStatus::Warning
    } else {
        ValueStatus::Normal
    }
}

/// A single decoded PID reading.
#[derive(Debug, Clone)]
pub struct PidSample {
    /// The registered definition this sample was decoded against.
    pub definition: &'static PidDefinition,
    /// The decoded scalar value, in `definition.unit`.
    pub value: f64,
    /// The raw bytes the value was decoded from.
    pub raw: Vec<u8>,
    /// When the sample was acquired.
    pub timestamp: Instant,
    /// The CAN header of the responding ECU, if known.
    pub ecu_address: Option<u32>,
    /// Health classification against `definition`'s thresholds.
    pub status: ValueStatus,
}

impl PidSample {
    /// `true` once `timestamp` is older than `budget`.
    pub fn is_stale(&self, budget: std::time::Duration) -> bool {
        self.timestamp.elapsed() > budget
    }
}

/// Looks up `(service, pid)` and decodes `raw` against it.
///
/// Fails with [`DiagError::UnsupportedPid`] if the PID isn't registered, or
/// [`DiagError::ParseError`] if `raw`'s length doesn't match the
/// definition's `payload_bytes` (§3: "A PidSample's raw-byte length equals
/// `definition.payloadBytes`").
pub fn decode_sample(
    service: u8,
    pid: u8,
    raw: &[u8],
    ecu_address: Option<u32>,
) -> Result<PidSample, DiagError> {
    let def = lookup(service, pid).ok_or(DiagError::UnsupportedPid { service, pid })?;
    if raw.len() != def.payload_bytes {
        return Err(DiagError::ParseError(format!(
            "PID ${:02X} expected {} payload bytes, got {}",
            pid,
            def.payload_bytes,
            raw.len()
        )));
    }
    let value = (def.decode)(raw);
    Ok(PidSample {
        definition: def,
        value,
        raw: raw.to_vec(),
        timestamp: Instant::now(),
        ecu_address,
        status: derive_status(def, value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_decode_scenario() {
        let s = decode_sample(0x01, 0x0C, &[0x1A, 0xF8], None).unwrap();
        assert!((s.value - 1726.0).abs() < 1e-6);
        assert_eq!(s.status, ValueStatus::Normal);
    }

    #[test]
    fn coolant_critical_scenario() {
        let s = decode_sample(0x01, 0x05, &[0x96], None).unwrap();
        assert!((s.value - 110.0).abs() < 1e-6);
        assert_eq!(s.status, ValueStatus::Critical);
    }

    #[test]
    fn wrong_length_is_parse_error() {
        let err = decode_sample(0x01, 0x0C, &[0x1A], None).unwrap_err();
        assert!(matches!(err, DiagError::ParseError(_)));
    }

    #[test]
    fn unregistered_pid_is_unsupported() {
        let err = decode_sample(0x01, 0xFE, &[0x00], None).unwrap_err();
        assert!(matches!(err, DiagError::UnsupportedPid { service: 0x01, pid: 0xFE }));
    }

    #[test]
    fn low_fuel_level_is_warning() {
        let s = decode_sample(0x01, 0x2F, &[0x19], None).unwrap(); // ~9.8%
        assert_eq!(s.status, ValueStatus::Warning);
    }
}


