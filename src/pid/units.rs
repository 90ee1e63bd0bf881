//! Metric/imperial unit conversion.
//!
//! Grounded on the `Speed`/`Temperature`/`Pressure`/`Distance` wrapper types
//! in `obd2/units.rs`, collapsed into a single data-driven `(from, to,
//! factor, offset)` table per §4.3/§4.10 instead of one wrapper type per
//! physical quantity — the registry only ever needs to convert a scalar, not
//! carry a typed unit through the rest of the program.

/// One `(from, to, factor, offset)` conversion: `to = from * factor + offset`.
#[derive(Debug, Clone, Copy)]
pub struct UnitConversion {
    /// Source unit symbol, e.g. `"°C"`.
    pub from: &'static str,
    /// Target unit symbol, e.g. `"°F"`.
    pub to: &'static str,
    /// Multiplicative factor.
    pub factor: f64,
    /// Additive offset, applied after the factor.
    pub offset: f64,
}

impl UnitConversion {
    /// Converts a value from `self.from` to `self.to`.
    pub fn apply(&self, v: f64) -> f64 {
        v * self.factor + self.offset
    }

    /// Converts a value from `self.to` back to `self.from`.
    pub fn reverse(&self, v: f64) -> f64 {
        (v - self.offset) / self.factor
    }
}

const CONVERSIONS: &[UnitConversion] = &[
    UnitConversion {
        from: "°C",
        to: "°F",
        factor: 9.0 / 5.0,
        offset: 32.0,
    },
    UnitConversion {
        from: "km/h",
        to: "mph",
        factor: 0.621_371,
        offset: 0.0,
    },
    UnitConversion {
        from: "kPa",
        to: "psi",
        factor: 0.145_038,
        offset: 0.0,
    },
    UnitConversion {
        from: "kPa",
        to: "bar",
        factor: 0.01,
        offset: 0.0,
    },
    UnitConversion {
        from: "km",
        to: "mi",
        factor: 0.621_371,
        offset: 0.0,
    },
];

/// Converts `value` from `from` to `to`, trying the table in both
/// directions. Returns `None` if no conversion between the two units is
/// registered.
pub fn convert(value: f64, from: &str, to: &str) -> Option<f64> {
    for c in CONVERSIONS {
        if c.from == from && c.to == to {
            return Some(c.apply(value));
        }
        if c.to == from && c.from == to {
            return Some(c.reverse(value));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn celsius_to_fahrenheit() {
        let v = convert(110.0, "°C", "°F").unwrap();
        assert!((v - 230.0).abs() < 1e-6);
    }

    #[test]
    fn reverse_direction_also_resolves() {
        let v = convert(230.0, "°F", "°C").unwrap();
        assert!((v - 110.0).abs() < 1e-6);
    }

    #[test]
    fn unregistered_pair_is_none() {
        assert!(convert(1.0, "rpm", "°C").is_none());
    }

    #[test]
    fn kpa_to_psi_and_bar() {
        assert!((convert(100.0, "kPa", "psi").unwrap() - 14.5038).abs() < 1e-4);
        assert!((convert(100.0, "kPa", "bar").unwrap() - 1.0).abs() < 1e-6);
    }
}
