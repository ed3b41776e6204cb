//! USB vendor/product identity helpers
//!
//! Builds the `USB\VID_xxxx&PID_xxxx` match key used by discovery filters
//! and resolves friendly names for the boards the host commonly ships with.

/// Plug-and-play key for a vendor/product pair, matching the wire format of
/// discovery filters.
pub fn pnp_key(vendor_id: u16, product_id: u16) -> String {
    format!("USB\\VID_{:04X}&PID_{:04X}", vendor_id, product_id)
}

/// Friendly name for a known vendor/product pair.
pub fn resolve(vendor_id: u16, product_id: u16) -> Option<&'static str> {
    match (vendor_id, product_id) {
        (0x2341, 0x0043) => Some("Arduino Uno"),
        (0x2341, 0x0001) => Some("Arduino Uno"),
        (0x2341, 0x0042) => Some("Arduino Mega 2560"),
        (0x2341, 0x8036) => Some("Arduino Leonardo"),
        (0x0D28, 0x0204) => Some("BBC micro:bit"),
        (0x1A86, 0x7523) => Some("USB-Serial CH340"),
        (0x10C4, 0xEA60) => Some("Silicon Labs CP210x"),
        (0x0403, 0x6001) => Some("FTDI FT232R"),
        _ => None,
    }
}

/// Display name for a discovered device: friendly name plus its path, or
/// "Unknown device" when the pair is not in the table.
pub fn display_name(vendor_id: u16, product_id: u16, path: &str) -> String {
    let name = resolve(vendor_id, product_id).unwrap_or("Unknown device");
    format!("{} ({})", name, path)
}
