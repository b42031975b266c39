use crate::types::MacAddr;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

/// Calculate the directed UDP broadcast address for an interface.
///
/// An invalid IP address (0.0.0.0) yields an invalid broadcast address.
pub fn broadcast_address(netmask: Ipv4Addr, ip_addr: Ipv4Addr) -> Ipv4Addr {
    if ip_addr.is_unspecified() {
        return Ipv4Addr::UNSPECIFIED;
    }
    Ipv4Addr::from(u32::from(ip_addr) | !u32::from(netmask))
}

/// Validate that an IP address is in the range 0.0.0.1 to 223.255.255.254.
pub fn is_ipaddr_range_valid(ip_addr: Ipv4Addr) -> bool {
    let ip = u32::from(ip_addr);
    ip != 0 && ip <= 0xDFFF_FFFE
}

/// Validate that a netmask has contiguous leading ones.
pub fn is_netmask_valid(netmask: Ipv4Addr) -> bool {
    let mask = u32::from(netmask);
    mask & (!mask >> 1) == 0
}

/// Copy a MAC address in reverse byte order, as used on the SLMP wire.
pub fn reverse_mac(mac: &MacAddr) -> MacAddr {
    [mac[5], mac[4], mac[3], mac[2], mac[1], mac[0]]
}

/// Format a MAC address as `AA:BB:CC:DD:EE:FF`.
pub fn mac_to_string(mac: &MacAddr) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Render buffer contents as a hex dump with an ASCII column, for debug logs.
///
/// For example an 18 byte buffer is rendered as:
///
/// ```text
/// 0000: 41 42 43 44 45 46 47 48 49 4A 4B 4C 00 01 02 03 |ABCDEFGHIJKL....|
/// 0010: 04 05                                           |..|
/// ```
pub fn buffer_to_string(data: &[u8]) -> String {
    let mut out = String::new();
    for (line_no, line) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04X}: ", line_no * 16);
        for byte in line {
            let _ = write!(out, "{:02X} ", byte);
        }
        for _ in line.len()..16 {
            out.push_str("   ");
        }
        out.push('|');
        for byte in line {
            let c = *byte as char;
            out.push(if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            });
        }
        out.push('|');
        out.push('\n');
    }
    out
}
