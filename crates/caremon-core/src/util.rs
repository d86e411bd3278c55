//! Utility functions for caremon-core.

use btleplug::platform::PeripheralId;

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or other formats. This function extracts the useful
/// identifier string.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Create an identifier string from an address and peripheral ID.
///
/// On macOS where addresses are 00:00:00:00:00:00, uses the peripheral ID.
/// On other platforms, uses the Bluetooth address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if is_null_address(address) {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

/// Whether `address` is the all-zero placeholder macOS reports.
pub fn is_null_address(address: &str) -> bool {
    address == "00:00:00:00:00:00"
}

/// Normalize a fingerprint for comparison: whitespace and hyphens are
/// stripped and the result is lowercased.
///
/// ```
/// use caremon_core::util::normalize_fingerprint;
///
/// assert_eq!(normalize_fingerprint(" SN-123 456 "), "sn123456");
/// ```
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Lowercase hex rendering of a byte payload.
pub fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_address() {
        assert!(is_null_address("00:00:00:00:00:00"));
        assert!(!is_null_address("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("SN123456"), "sn123456");
        assert_eq!(normalize_fingerprint("sn-123456"), "sn123456");
        assert_eq!(normalize_fingerprint("S N\t12-34-56"), "sn123456");
        assert_eq!(normalize_fingerprint(""), "");
    }

    #[test]
    fn test_hex_lower() {
        assert_eq!(hex_lower(&[0x0A, 0xFF, 0x00]), "0aff00");
        assert_eq!(hex_lower(&[]), "");
    }
}
