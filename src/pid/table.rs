//! The static Parameter ID registry: one entry per (service, pid), keyed
//! on identity and immutable after process start.
//!
//! Grounded on the `DataPid` const-table pattern in `obd2/presentation.rs`
//! (`pid`, `required_size`, `name`, decode closure), re-expressed as a
//! runtime-built `HashMap` so the formula can carry the richer per-field
//! data (unit, range, thresholds, bit layout) §4.3 requires without a
//! const-eval decode function.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Coarse grouping used only for presentation; does not affect decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidCategory {
    /// Engine load, RPM, timing, throttle.
    Engine,
    /// Fuel trims, fuel pressure, fuel level, fuel rate.
    Fuel,
    /// O2 sensors, catalyst temperature.
    Emissions,
    /// Module voltage, hybrid battery.
    Electrical,
    /// Distance, runtime, barometric/ambient readings.
    Info,
}

/// Which side of a threshold is the unhealthy one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdDirection {
    /// Value rising above the threshold is bad (e.g. coolant temperature).
    AboveIsBad,
    /// Value falling below the threshold is bad (e.g. module voltage).
    BelowIsBad,
}

/// A single named, independently-decoded flag within a bit-encoded PID.
#[derive(Debug, Clone, Copy)]
pub struct BitFlag {
    /// Bit index, 0 = least significant bit of the last payload byte.
    pub bit: u8,
    /// Human-readable flag name.
    pub name: &'static str,
    /// `true` if a set bit means the flag is active; `false` if inverted.
    pub active_high: bool,
}

/// A registered Parameter ID: identity, decode formula, and presentation
/// metadata. Immutable once built; keyed uniquely on `(service, pid)`.
#[derive(Clone)]
pub struct PidDefinition {
    /// OBD-II service, e.g. `0x01`.
    pub service: u8,
    /// Parameter ID byte.
    pub pid: u8,
    /// Display name.
    pub name: &'static str,
    /// Exact payload length this PID's formula expects.
    pub payload_bytes: usize,
    /// Physical unit symbol, e.g. `"°C"`, `"rpm"`, `"%"`.
    pub unit: &'static str,
    /// Inclusive value range the formula can produce for valid input.
    pub range: (f64, f64),
    /// Warning threshold, if any.
    pub warning: Option<f64>,
    /// Critical threshold, if any.
    pub critical: Option<f64>,
    /// Which side of `warning`/`critical` is unhealthy.
    pub direction: ThresholdDirection,
    /// Presentation category.
    pub category: PidCategory,
    /// Named bit flags, for PIDs whose payload is a bitmask rather than a
    /// scalar (e.g. $13, O2 sensors present).
    pub bit_layout: Option<&'static [BitFlag]>,
    /// Pure decode formula: exactly `payload_bytes` long input, scalar out.
    pub decode: fn(&[u8]) -> f64,
}

impl std::fmt::Debug for PidDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidDefinition")
            .field("service", &self.service)
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("payload_bytes", &self.payload_bytes)
            .field("unit", &self.unit)
            .finish()
    }
}

fn pct_255(b: &[u8]) -> f64 {
    b[0] as f64 * 100.0 / 255.0
}

fn minus_40(b: &[u8]) -> f64 {
    b[0] as f64 - 40.0
}

fn fuel_trim(b: &[u8]) -> f64 {
    (b[0] as f64 - 128.0) * 100.0 / 128.0
}

fn word(b: &[u8]) -> f64 {
    (b[0] as u16 * 256 + b[1] as u16) as f64
}

const BASE_PIDS: &[PidDefinition] = &[
    PidDefinition {
        service: 0x01,
        pid: 0x04,
        name: "Calculated engine load",
        payload_bytes: 1,
        unit: "%",
        range: (0.0, 100.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: pct_255,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x05,
        name: "Engine coolant temperature",
        payload_bytes: 1,
        unit: "°C",
        range: (-40.0, 215.0),
        warning: Some(100.0),
        critical: Some(110.0),
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: minus_40,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x06,
        name: "Short term fuel trim bank 1",
        payload_bytes: 1,
        unit: "%",
        range: (-100.0, 99.21875),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Fuel,
        bit_layout: None,
        decode: fuel_trim,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x07,
        name: "Long term fuel trim bank 1",
        payload_bytes: 1,
        unit: "%",
        range: (-100.0, 99.21875),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Fuel,
        bit_layout: None,
        decode: fuel_trim,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x08,
        name: "Short term fuel trim bank 2",
        payload_bytes: 1,
        unit: "%",
        range: (-100.0, 99.21875),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Fuel,
        bit_layout: None,
        decode: fuel_trim,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x09,
        name: "Long term fuel trim bank 2",
        payload_bytes: 1,
        unit: "%",
        range: (-100.0, 99.21875),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Fuel,
        bit_layout: None,
        decode: fuel_trim,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x0A,
        name: "Fuel pressure",
        payload_bytes: 1,
        unit: "kPa",
        range: (0.0, 765.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Fuel,
        bit_layout: None,
        decode: |b| b[0] as f64 * 3.0,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x0B,
        name: "Intake manifold absolute pressure",
        payload_bytes: 1,
        unit: "kPa",
        range: (0.0, 255.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: |b| b[0] as f64,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x0C,
        name: "Engine RPM",
        payload_bytes: 2,
        unit: "rpm",
        range: (0.0, 16_383.75),
        warning: Some(6000.0),
        critical: Some(7000.0),
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: |b| word(b) / 4.0,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x0D,
        name: "Vehicle speed",
        payload_bytes: 1,
        unit: "km/h",
        range: (0.0, 255.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: |b| b[0] as f64,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x0E,
        name: "Timing advance",
        payload_bytes: 1,
        unit: "°",
        range: (-64.0, 63.5),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: |b| b[0] as f64 / 2.0 - 64.0,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x0F,
        name: "Intake air temperature",
        payload_bytes: 1,
        unit: "°C",
        range: (-40.0, 215.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: minus_40,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x10,
        name: "Mass air flow rate",
        payload_bytes: 2,
        unit: "g/s",
        range: (0.0, 655.35),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: |b| word(b) / 100.0,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x11,
        name: "Throttle position",
        payload_bytes: 1,
        unit: "%",
        range: (0.0, 100.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: pct_255,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x13,
        name: "O2 sensors present",
        payload_bytes: 1,
        unit: "",
        range: (0.0, 255.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Emissions,
        bit_layout: Some(&[
            BitFlag { bit: 0, name: "Bank 1 Sensor 1", active_high: true },
            BitFlag { bit: 1, name: "Bank 1 Sensor 2", active_high: true },
            BitFlag { bit: 2, name: "Bank 1 Sensor 3", active_high: true },
            BitFlag { bit: 3, name: "Bank 1 Sensor 4", active_high: true },
            BitFlag { bit: 4, name: "Bank 2 Sensor 1", active_high: true },
            BitFlag { bit: 5, name: "Bank 2 Sensor 2", active_high: true },
            BitFlag { bit: 6, name: "Bank 2 Sensor 3", active_high: true },
            BitFlag { bit: 7, name: "Bank 2 Sensor 4", active_high: true },
        ]),
        decode: |b| b[0] as f64,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x1F,
        name: "Run time since engine start",
        payload_bytes: 2,
        unit: "s",
        range: (0.0, 65_535.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Info,
        bit_layout: None,
        decode: word,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x21,
        name: "Distance traveled with MIL on",
        payload_bytes: 2,
        unit: "km",
        range: (0.0, 65_535.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Info,
        bit_layout: None,
        decode: word,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x2F,
        name: "Fuel level input",
        payload_bytes: 1,
        unit: "%",
        range: (0.0, 100.0),
        warning: Some(15.0),
        critical: None,
        direction: ThresholdDirection::BelowIsBad,
        category: PidCategory::Fuel,
        bit_layout: None,
        decode: pct_255,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x33,
        name: "Barometric pressure",
        payload_bytes: 1,
        unit: "kPa",
        range: (0.0, 255.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Info,
        bit_layout: None,
        decode: |b| b[0] as f64,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x3C,
        name: "Catalyst temperature bank 1 sensor 1",
        payload_bytes: 2,
        unit: "°C",
        range: (-40.0, 6513.5),
        warning: Some(800.0),
        critical: Some(900.0),
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Emissions,
        bit_layout: None,
        decode: |b| word(b) / 10.0 - 40.0,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x42,
        name: "Control module voltage",
        payload_bytes: 2,
        unit: "V",
        range: (0.0, 65.535),
        warning: Some(13.0),
        critical: Some(11.5),
        direction: ThresholdDirection::BelowIsBad,
        category: PidCategory::Electrical,
        bit_layout: None,
        decode: |b| word(b) / 1000.0,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x46,
        name: "Ambient air temperature",
        payload_bytes: 1,
        unit: "°C",
        range: (-40.0, 215.0),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Info,
        bit_layout: None,
        decode: minus_40,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x5B,
        name: "Hybrid battery pack remaining life",
        payload_bytes: 1,
        unit: "%",
        range: (0.0, 100.0),
        warning: Some(20.0),
        critical: Some(10.0),
        direction: ThresholdDirection::BelowIsBad,
        category: PidCategory::Electrical,
        bit_layout: None,
        decode: pct_255,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x5C,
        name: "Engine oil temperature",
        payload_bytes: 1,
        unit: "°C",
        range: (-40.0, 215.0),
        warning: Some(120.0),
        critical: Some(140.0),
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Engine,
        bit_layout: None,
        decode: minus_40,
    },
    PidDefinition {
        service: 0x01,
        pid: 0x5E,
        name: "Engine fuel rate",
        payload_bytes: 2,
        unit: "L/h",
        range: (0.0, 3276.75),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Fuel,
        bit_layout: None,
        decode: |b| word(b) / 20.0,
    },
];

fn o2_voltage(name: &'static str, pid: u8) -> PidDefinition {
    PidDefinition {
        service: 0x01,
        pid,
        name,
        payload_bytes: 2,
        unit: "V",
        range: (0.0, 1.275),
        warning: None,
        critical: None,
        direction: ThresholdDirection::AboveIsBad,
        category: PidCategory::Emissions,
        bit_layout: None,
        decode: |b| b[0] as f64 / 200.0,
    }
}

const O2_NAMES: [&str; 8] = [
    "O2 sensor 1 (bank 1) voltage",
    "O2 sensor 2 (bank 1) voltage",
    "O2 sensor 3 (bank 1) voltage",
    "O2 sensor 4 (bank 1) voltage",
    "O2 sensor 1 (bank 2) voltage",
    "O2 sensor 2 (bank 2) voltage",
    "O2 sensor 3 (bank 2) voltage",
    "O2 sensor 4 (bank 2) voltage",
];

static REGISTRY: OnceLock<HashMap<(u8, u8), PidDefinition>> = OnceLock::new();

/// Registers `def` under its own `(service, pid)` key, plus a mode-`$02`
/// (freeze frame) twin under the same PID: SAE J1979 freeze-frame PIDs
/// decode with the exact same formula as their mode-`$01` live-data
/// counterpart, only the request SID differs (§4.5/§6).
fn insert_with_freeze_frame_twin(map: &mut HashMap<(u8, u8), PidDefinition>, def: PidDefinition) {
    let mut freeze = def.clone();
    freeze.service = 0x02;
    map.insert((def.service, def.pid), def);
    map.insert((freeze.service, freeze.pid), freeze);
}

fn build_registry() -> HashMap<(u8, u8), PidDefinition> {
    let mut map = HashMap::new();
    for def in BASE_PIDS {
        insert_with_freeze_frame_twin(&mut map, def.clone());
    }
    for (i, name) in O2_NAMES.iter().enumerate() {
        let pid = 0x14 + i as u8;
        insert_with_freeze_frame_twin(&mut map, o2_voltage(name, pid));
    }
    map
}

/// Looks up the registered definition for `(service, pid)`, if any.
pub fn lookup(service: u8, pid: u8) -> Option<&'static PidDefinition> {
    REGISTRY.get_or_init(build_registry).get(&(service, pid))
}

/// Decodes a support-bitmap response's four data bytes into the set of
/// supported PIDs in the window `base+1 ..= base+32`, per §4.5.
pub fn decode_support_bitmap(base: u8, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pid = base.wrapping_add(1);
    for byte in bytes {
        let mut mask = 0b1000_0000u8;
        for _ in 0..8 {
            if byte & mask != 0 {
                out.push(pid);
            }
            mask >>= 1;
            pid = pid.wrapping_add(1);
        }
    }
    out
}

/// `true` if the support bitmap's own "continue" bit (the one for
/// `base + 0x20`) is set, i.e. probing should continue at the next window.
pub fn bitmap_continue_bit(bytes: &[u8]) -> bool {
    bytes.last().map(|b| b & 0x01 != 0).unwrap_or(false)
}

/// Decodes the active named flags of a bit-encoded PID's payload.
pub fn decode_bit_flags(def: &PidDefinition, raw: &[u8]) -> Vec<&'static str> {
    let Some(flags) = def.bit_layout else {
        return Vec::new();
    };
    let Some(&byte) = raw.last() else {
        return Vec::new();
    };
    flags
        .iter()
        .filter(|f| {
            let set = byte & (1 << f.bit) != 0;
            set == f.active_high
        })
        .map(|f| f.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_decode_matches_scenario() {
        let def = lookup(0x01, 0x0C).unwrap();
        let v = (def.decode)(&[0x1A, 0xF8]);
        assert!((v - 1726.0).abs() < 1e-6);
    }

    #[test]
    fn coolant_critical_threshold() {
        let def = lookup(0x01, 0x05).unwrap();
        let v = (def.decode)(&[0x96]);
        assert!((v - 110.0).abs() < 1e-6);
        assert!(v >= def.critical.unwrap());
    }

    #[test]
    fn support_bitmap_decode_scenario() {
        let supported = decode_support_bitmap(0x00, &[0xBE, 0x1F, 0xA8, 0x13]);
        assert_eq!(
            supported,
            vec![0x01, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x13, 0x15, 0x1C, 0x1F, 0x20]
        );
        assert!(bitmap_continue_bit(&[0xBE, 0x1F, 0xA8, 0x13]));
    }

    #[test]
    fn every_standard_formula_stays_in_range() {
        for def in BASE_PIDS {
            let raw = vec![0u8; def.payload_bytes];
            let v = (def.decode)(&raw);
            assert!(v >= def.range.0 - 1e-6 && v <= def.range.1 + 1e-6, "{} out of range at zero input", def.name);
            let raw_max = vec![0xFFu8; def.payload_bytes];
            let v = (def.decode)(&raw_max);
            assert!(v >= def.range.0 - 1e-6 && v <= def.range.1 + 1e-6, "{} out of range at max input", def.name);
        }
    }

    #[test]
    fn o2_sensor_bit_flags_decode() {
        let def = lookup(0x01, 0x13).unwrap();
        let flags = decode_bit_flags(def, &[0b0000_0011]);
        assert_eq!(flags, vec!["Bank 1 Sensor 1", "Bank 1 Sensor 2"]);
    }

    #[test]
    fn freeze_frame_pid_shares_live_data_formula() {
        let live = lookup(0x01, 0x0C).unwrap();
        let freeze = lookup(0x02, 0x0C).unwrap();
        assert_eq!(freeze.service, 0x02);
        assert_eq!((freeze.decode)(&[0x1A, 0xF8]), (live.decode)(&[0x1A, 0xF8]));
    }
}
