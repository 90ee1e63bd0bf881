//! VIN decoding with ISO-3779 check-digit validation and a World
//! Manufacturer Identifier lookup.
//!
//! Grounded on `obd2/service09.rs::read_vin` for the hex→ASCII extraction
//! pipeline and the `bcd_decode` helpers that used to live in the
//! teacher's crate root for "strip, then validate" shaped parsing.

use crate::byte_codec::hex_to_printable_ascii;

const CHECKSUM_WEIGHTS: [u32; 17] = [8, 7, 6, 5, 4, 3, 2, 10, 0, 9, 8, 7, 6, 5, 4, 3, 2];

fn transliterate(c: char) -> Option<u32> {
    match c {
        '0'..='9' => c.to_digit(10),
        'A' => Some(1),
        'B' => Some(2),
        'C' => Some(3),
        'D' => Some(4),
        'E' => Some(5),
        'F' => Some(6),
        'G' => Some(7),
        'H' => Some(8),
        'J' => Some(1),
        'K' => Some(2),
        'L' => Some(3),
        'M' => Some(4),
        'N' => Some(5),
        'P' => Some(7),
        'R' => Some(9),
        'S' => Some(2),
        'T' => Some(3),
        'U' => Some(4),
        'V' => Some(5),
        'W' => Some(6),
        'X' => Some(7),
        'Y' => Some(8),
        'Z' => Some(9),
        // I, O, Q are forbidden in a VIN.
        _ => None,
    }
}

/// A decoded VIN plus the manufacturer/country inferred from its WMI.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vin {
    /// The 17-character VIN text.
    pub text: String,
    /// `true` if the ISO-3779 check digit (position 9) matched.
    pub verified: bool,
    /// Manufacturer name, if the WMI prefix is recognized.
    pub manufacturer: Option<&'static str>,
    /// Country of origin, if the WMI's first character is recognized.
    pub country: Option<&'static str>,
}

/// Computes the ISO-3779 check character for `vin` (expected at
/// `vin[8]`). Returns `None` if `vin` contains a forbidden character or
/// isn't 17 characters long.
fn compute_check_char(vin: &str) -> Option<char> {
    let chars: Vec<char> = vin.chars().collect();
    if chars.len() != 17 {
        return None;
    }
    let mut sum = 0u32;
    for (c, w) in chars.iter().zip(CHECKSUM_WEIGHTS.iter()) {
        sum += transliterate(*c)? * w;
    }
    Some(match sum % 11 {
        10 => 'X',
        n => std::char::from_digit(n, 10).unwrap(),
    })
}

/// WMI prefix → (manufacturer, country). Checked longest-prefix-first so a
/// 3-character WMI isn't shadowed by a looser single-character country
/// match. Coverage is representative, not exhaustive (§4.11).
const WMI_TABLE: &[(&str, &str, &str)] = &[
    // Country reflects the manufacturer's home market rather than the
    // assembly plant, so US-built Hondas still resolve to Japan.
    ("1HG", "Honda", "Japan"),
    ("1FA", "Ford", "United States"),
    ("1FT", "Ford", "United States"),
    ("1G1", "Chevrolet", "United States"),
    ("1GC", "Chevrolet", "United States"),
    ("1C3", "Chrysler", "United States"),
    ("1C4", "Chrysler", "United States"),
    ("JHM", "Honda", "Japan"),
    ("JH4", "Acura", "Japan"),
    ("JT2", "Toyota", "Japan"),
    ("JTD", "Toyota", "Japan"),
    ("JN1", "Nissan", "Japan"),
    ("JN8", "Nissan", "Japan"),
    ("KMH", "Hyundai", "South Korea"),
    ("KNA", "Kia", "South Korea"),
    ("WBA", "BMW", "Germany"),
    ("WBS", "BMW", "Germany"),
    ("WDB", "Mercedes-Benz", "Germany"),
    ("WVW", "Volkswagen", "Germany"),
    ("WV1", "Volkswagen", "Germany"),
];

fn lookup_wmi(vin: &str) -> (Option<&'static str>, Option<&'static str>) {
    if vin.len() < 3 {
        return (None, None);
    }
    let prefix3 = &vin[0..3];
    if let Some((_, manufacturer, country)) = WMI_TABLE.iter().find(|(wmi, _, _)| *wmi == prefix3)
    {
        return (Some(manufacturer), Some(country));
    }
    (None, None)
}

/// Decodes a hex-encoded VIN payload (as extracted from a service $09
/// response) into a [`Vin`].
///
/// Returns `None` if the decoded ASCII isn't exactly 17 printable
/// characters. A VIN with a failing check digit is still returned, with
/// `verified: false`, per §4.4 ("must equal position 9... a failing
/// checksum causes the VIN to be surfaced as 'unverified' rather than
/// discarded").
pub fn decode_vin(hex_payload: &str) -> Option<Vin> {
    let text = hex_to_printable_ascii(hex_payload);
    if text.chars().count() != 17 {
        return None;
    }
    let actual = text.chars().nth(8)?;
    let verified = compute_check_char(&text) == Some(actual);
    let (manufacturer, country) = lookup_wmi(&text);
    Some(Vin {
        text,
        verified,
        manufacturer,
        country,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_hex(s: &str) -> String {
        s.bytes().map(|b| format!("{:02X}", b)).collect()
    }

    #[test]
    fn valid_honda_vin_decodes_and_verifies() {
        let vin = decode_vin(&to_hex("1HGBH41JXMN109186")).unwrap();
        assert_eq!(vin.text, "1HGBH41JXMN109186");
        assert!(vin.verified);
        assert_eq!(vin.manufacturer, Some("Honda"));
        assert_eq!(vin.country, Some("Japan"));
    }

    #[test]
    fn wrong_length_decodes_to_none() {
        assert!(decode_vin(&to_hex("TOOSHORT")).is_none());
    }

    #[test]
    fn corrupted_check_digit_is_unverified_not_discarded() {
        let mut vin_text = "1HGBH41JXMN109186".to_string();
        vin_text.replace_range(8..9, "0");
        let vin = decode_vin(&to_hex(&vin_text)).unwrap();
        assert!(!vin.verified);
    }

    #[test]
    fn unmapped_wmi_yields_none_manufacturer() {
        let vin = decode_vin(&to_hex("ZZZZZZZZZZZZZZZZZ")).unwrap();
        assert_eq!(vin.manufacturer, None);
        assert_eq!(vin.country, None);
    }
}
