//! Wire codec for SLMP management frames.
//!
//! SLMP requests start with 0x5400 (big endian) and responses with 0xD400,
//! followed by a request serial, fixed addressing fields and a length field
//! that counts every byte from offset 13 onwards. MAC addresses are stored
//! in reverse byte order on the wire.
//!
//! The request parsers and response encoders exist for simulators and
//! tests; the master itself encodes requests and parses responses.

use crate::types::{MacAddr, SLMP_PORT};
use crate::util;
use std::convert::TryInto;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Fixed size of the SLMP request and response headers.
pub const SLMP_HEADER_SIZE: usize = 15;

pub const NODE_SEARCH_REQ_SIZE: usize = 30;
pub const NODE_SEARCH_RESP_SIZE: usize = 66;
pub const SET_IP_REQ_SIZE: usize = 58;
pub const SET_IP_RESP_SIZE: usize = 21;
pub const ERROR_RESP_SIZE: usize = 24;

pub const COMMAND_NODE_SEARCH: u16 = 0x0E30;
pub const COMMAND_SET_IP: u16 = 0x0E31;
pub const SUB_COMMAND: u16 = 0x0000;

/// The header length field counts every byte from this offset onwards.
const LENGTH_OFFSET: usize = 13;

const IP_ADDR_SIZE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlmpFrameError {
    #[error("Frame is too short")]
    TooShort,
    #[error("Fixed header fields do not match")]
    BadHeader,
    #[error("Header length field does not match the frame size")]
    LengthMismatch,
    #[error("Frame size matches no known SLMP message")]
    UnknownMessage,
}

/// True when the buffer starts like an SLMP request (0x5400 big endian).
pub fn is_slmp_request(buffer: &[u8]) -> bool {
    buffer.len() >= 2 && buffer[0] == 0x54 && buffer[1] == 0x00
}

/// True when the buffer starts like an SLMP response (0xD400 big endian).
pub fn is_slmp_response(buffer: &[u8]) -> bool {
    buffer.len() >= 2 && buffer[0] == 0xD4 && buffer[1] == 0x00
}

fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buffer[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buffer[offset..offset + 4].try_into().unwrap())
}

fn read_mac(buffer: &[u8], offset: usize) -> MacAddr {
    let wire: MacAddr = buffer[offset..offset + 6].try_into().unwrap();
    util::reverse_mac(&wire)
}

fn write_u16(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_mac(buffer: &mut [u8], offset: usize, mac: &MacAddr) {
    buffer[offset..offset + 6].copy_from_slice(&util::reverse_mac(mac));
}

fn write_request_header(buffer: &mut [u8], serial: u16, total_size: usize) {
    buffer[0] = 0x54;
    buffer[1] = 0x00;
    write_u16(buffer, 2, serial);
    write_u16(buffer, 4, 0x0000);
    buffer[6] = 0x00;
    buffer[7] = 0xFF;
    write_u16(buffer, 8, 0x03FF);
    buffer[10] = 0x00;
    write_u16(buffer, 11, (total_size - LENGTH_OFFSET) as u16);
    write_u16(buffer, 13, 0x0000); // timer
}

fn write_response_header(buffer: &mut [u8], serial: u16, total_size: usize, end_code: u16) {
    buffer[0] = 0xD4;
    buffer[1] = 0x00;
    write_u16(buffer, 2, serial);
    write_u16(buffer, 4, 0x0000);
    buffer[6] = 0x00;
    buffer[7] = 0xFF;
    write_u16(buffer, 8, 0x03FF);
    buffer[10] = 0x00;
    write_u16(buffer, 11, (total_size - LENGTH_OFFSET) as u16);
    write_u16(buffer, 13, end_code);
}

fn check_header(buffer: &[u8], expected_sub1: u8) -> Result<(), SlmpFrameError> {
    if buffer.len() < SLMP_HEADER_SIZE {
        return Err(SlmpFrameError::TooShort);
    }
    if buffer[0] != expected_sub1
        || buffer[1] != 0x00
        || read_u16(buffer, 4) != 0x0000
        || buffer[6] != 0x00
        || buffer[7] != 0xFF
        || read_u16(buffer, 8) != 0x03FF
        || buffer[10] != 0x00
    {
        return Err(SlmpFrameError::BadHeader);
    }
    if usize::from(read_u16(buffer, 11)) != buffer.len() - LENGTH_OFFSET {
        return Err(SlmpFrameError::LengthMismatch);
    }
    Ok(())
}

fn check_request_header(buffer: &[u8]) -> Result<(), SlmpFrameError> {
    check_header(buffer, 0x54)
}

fn check_response_header(buffer: &[u8]) -> Result<(), SlmpFrameError> {
    check_header(buffer, 0xD4)
}

/// Encode a node search request. Returns the frame size.
pub fn encode_node_search_request(
    buffer: &mut [u8],
    serial: u16,
    master_mac: &MacAddr,
    master_ip: Ipv4Addr,
) -> usize {
    let buffer = &mut buffer[..NODE_SEARCH_REQ_SIZE];
    write_request_header(buffer, serial, NODE_SEARCH_REQ_SIZE);
    write_u16(buffer, 15, COMMAND_NODE_SEARCH);
    write_u16(buffer, 17, SUB_COMMAND);
    write_mac(buffer, 19, master_mac);
    buffer[25] = IP_ADDR_SIZE;
    write_u32(buffer, 26, u32::from(master_ip));
    NODE_SEARCH_REQ_SIZE
}

/// Encode a set IP address request. Returns the frame size.
///
/// The target slave is addressed by MAC address; the frame is sent to a
/// broadcast address since the slave IP address is not yet usable.
pub fn encode_set_ip_request(
    buffer: &mut [u8],
    serial: u16,
    master_mac: &MacAddr,
    master_ip: Ipv4Addr,
    slave_mac: &MacAddr,
    slave_new_ip: Ipv4Addr,
    slave_new_netmask: Ipv4Addr,
) -> usize {
    let buffer = &mut buffer[..SET_IP_REQ_SIZE];
    write_request_header(buffer, serial, SET_IP_REQ_SIZE);
    write_u16(buffer, 15, COMMAND_SET_IP);
    write_u16(buffer, 17, SUB_COMMAND);
    write_mac(buffer, 19, master_mac);
    buffer[25] = IP_ADDR_SIZE;
    write_u32(buffer, 26, u32::from(master_ip));
    write_mac(buffer, 30, slave_mac);
    buffer[36] = IP_ADDR_SIZE;
    write_u32(buffer, 37, u32::from(slave_new_ip));
    write_u32(buffer, 41, u32::from(slave_new_netmask));
    write_u32(buffer, 45, 0xFFFF_FFFF); // default gateway, not used
    buffer[49] = 0; // hostname size
    buffer[50] = IP_ADDR_SIZE;
    write_u32(buffer, 51, 0xFFFF_FFFF); // target IP, not used
    write_u16(buffer, 55, 0xFFFF); // target port, not used
    buffer[57] = 1; // protocol settings
    SET_IP_REQ_SIZE
}

/// A parsed node search request, as received by a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSearchRequest {
    pub serial: u16,
    pub master_mac_addr: MacAddr,
    pub master_ip_addr: Ipv4Addr,
}

pub fn parse_node_search_request(buffer: &[u8]) -> Result<NodeSearchRequest, SlmpFrameError> {
    check_request_header(buffer)?;
    if buffer.len() != NODE_SEARCH_REQ_SIZE {
        return Err(SlmpFrameError::UnknownMessage);
    }
    if read_u16(buffer, 15) != COMMAND_NODE_SEARCH || read_u16(buffer, 17) != SUB_COMMAND {
        return Err(SlmpFrameError::BadHeader);
    }
    Ok(NodeSearchRequest {
        serial: read_u16(buffer, 2),
        master_mac_addr: read_mac(buffer, 19),
        master_ip_addr: Ipv4Addr::from(read_u32(buffer, 26)),
    })
}

/// A parsed set IP address request, as received by a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetIpRequest {
    pub serial: u16,
    pub master_mac_addr: MacAddr,
    pub master_ip_addr: Ipv4Addr,
    pub slave_mac_addr: MacAddr,
    pub slave_new_ip_addr: Ipv4Addr,
    pub slave_new_netmask: Ipv4Addr,
}

pub fn parse_set_ip_request(buffer: &[u8]) -> Result<SetIpRequest, SlmpFrameError> {
    check_request_header(buffer)?;
    if buffer.len() != SET_IP_REQ_SIZE {
        return Err(SlmpFrameError::UnknownMessage);
    }
    if read_u16(buffer, 15) != COMMAND_SET_IP || read_u16(buffer, 17) != SUB_COMMAND {
        return Err(SlmpFrameError::BadHeader);
    }
    Ok(SetIpRequest {
        serial: read_u16(buffer, 2),
        master_mac_addr: read_mac(buffer, 19),
        master_ip_addr: Ipv4Addr::from(read_u32(buffer, 26)),
        slave_mac_addr: read_mac(buffer, 30),
        slave_new_ip_addr: Ipv4Addr::from(read_u32(buffer, 37)),
        slave_new_netmask: Ipv4Addr::from(read_u32(buffer, 41)),
    })
}

/// A parsed node search response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSearchResponse {
    pub serial: u16,
    pub end_code: u16,
    pub master_mac_addr: MacAddr,
    pub master_ip_addr: Ipv4Addr,
    pub slave_mac_addr: MacAddr,
    pub slave_ip_addr: Ipv4Addr,
    pub slave_netmask: Ipv4Addr,
    pub vendor_code: u16,
    pub model_code: u32,
    pub equipment_ver: u16,
    pub slave_status: u16,
}

pub fn parse_node_search_response(buffer: &[u8]) -> Result<NodeSearchResponse, SlmpFrameError> {
    check_response_header(buffer)?;
    if buffer.len() != NODE_SEARCH_RESP_SIZE {
        return Err(SlmpFrameError::UnknownMessage);
    }
    Ok(NodeSearchResponse {
        serial: read_u16(buffer, 2),
        end_code: read_u16(buffer, 13),
        master_mac_addr: read_mac(buffer, 15),
        master_ip_addr: Ipv4Addr::from(read_u32(buffer, 22)),
        slave_mac_addr: read_mac(buffer, 26),
        slave_ip_addr: Ipv4Addr::from(read_u32(buffer, 33)),
        slave_netmask: Ipv4Addr::from(read_u32(buffer, 37)),
        vendor_code: read_u16(buffer, 46),
        model_code: read_u32(buffer, 48),
        equipment_ver: read_u16(buffer, 52),
        slave_status: read_u16(buffer, 61),
    })
}

/// Encode a node search response, as sent by a slave. Returns the frame
/// size.
pub fn encode_node_search_response(
    buffer: &mut [u8],
    response: &NodeSearchResponse,
) -> usize {
    let buffer = &mut buffer[..NODE_SEARCH_RESP_SIZE];
    write_response_header(buffer, response.serial, NODE_SEARCH_RESP_SIZE, response.end_code);
    write_mac(buffer, 15, &response.master_mac_addr);
    buffer[21] = IP_ADDR_SIZE;
    write_u32(buffer, 22, u32::from(response.master_ip_addr));
    write_mac(buffer, 26, &response.slave_mac_addr);
    buffer[32] = IP_ADDR_SIZE;
    write_u32(buffer, 33, u32::from(response.slave_ip_addr));
    write_u32(buffer, 37, u32::from(response.slave_netmask));
    write_u32(buffer, 41, 0xFFFF_FFFF); // default gateway, not used
    buffer[45] = 0; // hostname size
    write_u16(buffer, 46, response.vendor_code);
    write_u32(buffer, 48, response.model_code);
    write_u16(buffer, 52, response.equipment_ver);
    buffer[54] = IP_ADDR_SIZE;
    write_u32(buffer, 55, 0xFFFF_FFFF); // target IP, not used
    write_u16(buffer, 59, 0xFFFF); // target port, not used
    write_u16(buffer, 61, response.slave_status);
    write_u16(buffer, 63, SLMP_PORT);
    buffer[65] = 1; // protocol settings
    NODE_SEARCH_RESP_SIZE
}

/// A parsed set IP address response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetIpResponse {
    pub serial: u16,
    pub end_code: u16,
    pub master_mac_addr: MacAddr,
}

pub fn parse_set_ip_response(buffer: &[u8]) -> Result<SetIpResponse, SlmpFrameError> {
    check_response_header(buffer)?;
    if buffer.len() != SET_IP_RESP_SIZE {
        return Err(SlmpFrameError::UnknownMessage);
    }
    Ok(SetIpResponse {
        serial: read_u16(buffer, 2),
        end_code: read_u16(buffer, 13),
        master_mac_addr: read_mac(buffer, 15),
    })
}

/// Encode a set IP address response, as sent by a slave. Returns the frame
/// size.
pub fn encode_set_ip_response(
    buffer: &mut [u8],
    serial: u16,
    end_code: u16,
    master_mac: &MacAddr,
) -> usize {
    let buffer = &mut buffer[..SET_IP_RESP_SIZE];
    write_response_header(buffer, serial, SET_IP_RESP_SIZE, end_code);
    write_mac(buffer, 15, master_mac);
    SET_IP_RESP_SIZE
}

/// A parsed SLMP error response, echoing the failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlmpErrorResponse {
    pub serial: u16,
    pub end_code: u16,
    pub command: u16,
    pub sub_command: u16,
}

pub fn parse_error_response(buffer: &[u8]) -> Result<SlmpErrorResponse, SlmpFrameError> {
    check_response_header(buffer)?;
    if buffer.len() != ERROR_RESP_SIZE {
        return Err(SlmpFrameError::UnknownMessage);
    }
    if buffer[15] != 0x00
        || buffer[16] != 0xFF
        || read_u16(buffer, 17) != 0x03FF
        || buffer[19] != 0x00
    {
        return Err(SlmpFrameError::BadHeader);
    }
    Ok(SlmpErrorResponse {
        serial: read_u16(buffer, 2),
        end_code: read_u16(buffer, 13),
        command: read_u16(buffer, 20),
        sub_command: read_u16(buffer, 22),
    })
}

/// Encode an SLMP error response, as sent by a slave. Returns the frame
/// size.
pub fn encode_error_response(
    buffer: &mut [u8],
    serial: u16,
    end_code: u16,
    command: u16,
    sub_command: u16,
) -> usize {
    let buffer = &mut buffer[..ERROR_RESP_SIZE];
    write_response_header(buffer, serial, ERROR_RESP_SIZE, end_code);
    buffer[15] = 0x00;
    buffer[16] = 0xFF;
    write_u16(buffer, 17, 0x03FF);
    buffer[19] = 0x00;
    write_u16(buffer, 20, command);
    write_u16(buffer, 22, sub_command);
    ERROR_RESP_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER_MAC: MacAddr = [0x1C, 0x39, 0x47, 0xCD, 0xD4, 0xEB];
    const SLAVE_MAC: MacAddr = [0x74, 0x56, 0x3C, 0x4D, 0x8A, 0x92];

    #[test]
    fn node_search_request_wire_format() {
        let mut buffer = [0_u8; NODE_SEARCH_REQ_SIZE];
        let size = encode_node_search_request(
            &mut buffer,
            0x0001,
            &MASTER_MAC,
            Ipv4Addr::new(192, 168, 0, 250),
        );
        assert_eq!(size, 30);
        assert_eq!(&buffer[0..2], &[0x54, 0x00]);
        assert_eq!(u16::from_le_bytes([buffer[2], buffer[3]]), 1);
        assert_eq!(buffer[7], 0xFF);
        assert_eq!(u16::from_le_bytes([buffer[8], buffer[9]]), 0x03FF);
        assert_eq!(u16::from_le_bytes([buffer[11], buffer[12]]), 17);
        assert_eq!(u16::from_le_bytes([buffer[15], buffer[16]]), 0x0E30);
        // MAC is reversed on the wire.
        assert_eq!(&buffer[19..25], &[0xEB, 0xD4, 0xCD, 0x47, 0x39, 0x1C]);
        assert_eq!(buffer[25], 4);
        assert_eq!(&buffer[26..30], &[0xFA, 0x00, 0xA8, 0xC0]);

        let parsed = parse_node_search_request(&buffer).unwrap();
        assert_eq!(parsed.serial, 1);
        assert_eq!(parsed.master_mac_addr, MASTER_MAC);
        assert_eq!(parsed.master_ip_addr, Ipv4Addr::new(192, 168, 0, 250));
    }

    #[test]
    fn set_ip_request_round_trip() {
        let mut buffer = [0_u8; SET_IP_REQ_SIZE];
        let size = encode_set_ip_request(
            &mut buffer,
            0x0002,
            &MASTER_MAC,
            Ipv4Addr::new(192, 168, 0, 250),
            &SLAVE_MAC,
            Ipv4Addr::new(1, 8, 3, 9),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert_eq!(size, 58);
        assert_eq!(u16::from_le_bytes([buffer[11], buffer[12]]), 45);
        assert_eq!(u16::from_le_bytes([buffer[15], buffer[16]]), 0x0E31);
        assert_eq!(buffer[57], 1);

        let parsed = parse_set_ip_request(&buffer).unwrap();
        assert_eq!(parsed.serial, 2);
        assert_eq!(parsed.master_mac_addr, MASTER_MAC);
        assert_eq!(parsed.slave_mac_addr, SLAVE_MAC);
        assert_eq!(parsed.slave_new_ip_addr, Ipv4Addr::new(1, 8, 3, 9));
        assert_eq!(parsed.slave_new_netmask, Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn node_search_response_round_trip() {
        let response = NodeSearchResponse {
            serial: 7,
            end_code: 0,
            master_mac_addr: MASTER_MAC,
            master_ip_addr: Ipv4Addr::new(192, 168, 0, 250),
            slave_mac_addr: SLAVE_MAC,
            slave_ip_addr: Ipv4Addr::new(1, 8, 3, 4),
            slave_netmask: Ipv4Addr::new(255, 255, 255, 0),
            vendor_code: 0x3456,
            model_code: 0x789A_BCDE,
            equipment_ver: 0xF012,
            slave_status: 0,
        };
        let mut buffer = [0_u8; NODE_SEARCH_RESP_SIZE];
        let size = encode_node_search_response(&mut buffer, &response);
        assert_eq!(size, 66);
        assert_eq!(u16::from_le_bytes([buffer[11], buffer[12]]), 53);
        // Slave port and protocol settings are fixed.
        assert_eq!(u16::from_le_bytes([buffer[63], buffer[64]]), 61451);
        assert_eq!(buffer[65], 1);

        assert_eq!(parse_node_search_response(&buffer).unwrap(), response);
    }

    #[test]
    fn set_ip_response_round_trip() {
        let mut buffer = [0_u8; SET_IP_RESP_SIZE];
        let size = encode_set_ip_response(&mut buffer, 9, 0xC059, &MASTER_MAC);
        assert_eq!(size, 21);

        let parsed = parse_set_ip_response(&buffer).unwrap();
        assert_eq!(parsed.serial, 9);
        assert_eq!(parsed.end_code, 0xC059);
        assert_eq!(parsed.master_mac_addr, MASTER_MAC);
    }

    #[test]
    fn error_response_round_trip() {
        let mut buffer = [0_u8; ERROR_RESP_SIZE];
        let size = encode_error_response(&mut buffer, 3, 0xC059, COMMAND_SET_IP, SUB_COMMAND);
        assert_eq!(size, 24);

        let parsed = parse_error_response(&buffer).unwrap();
        assert_eq!(parsed.serial, 3);
        assert_eq!(parsed.end_code, 0xC059);
        assert_eq!(parsed.command, COMMAND_SET_IP);
        assert_eq!(parsed.sub_command, SUB_COMMAND);
    }

    #[test]
    fn classification_by_magic() {
        let mut buffer = [0_u8; NODE_SEARCH_REQ_SIZE];
        encode_node_search_request(&mut buffer, 1, &MASTER_MAC, Ipv4Addr::new(1, 2, 3, 4));
        assert!(is_slmp_request(&buffer));
        assert!(!is_slmp_response(&buffer));
    }

    #[test]
    fn rejects_bad_length_field() {
        let mut buffer = [0_u8; SET_IP_RESP_SIZE];
        encode_set_ip_response(&mut buffer, 9, 0, &MASTER_MAC);
        buffer[11] = buffer[11].wrapping_add(1);
        assert_eq!(
            parse_set_ip_response(&buffer),
            Err(SlmpFrameError::LengthMismatch)
        );
    }

    #[test]
    fn rejects_short_frames() {
        assert_eq!(
            parse_node_search_response(&[0xD4, 0x00, 0x01]),
            Err(SlmpFrameError::TooShort)
        );
    }

    #[test]
    fn rejects_wrong_size_for_message() {
        let mut buffer = [0_u8; NODE_SEARCH_RESP_SIZE];
        let response = NodeSearchResponse {
            serial: 7,
            end_code: 0,
            master_mac_addr: MASTER_MAC,
            master_ip_addr: Ipv4Addr::new(192, 168, 0, 250),
            slave_mac_addr: SLAVE_MAC,
            slave_ip_addr: Ipv4Addr::new(1, 8, 3, 4),
            slave_netmask: Ipv4Addr::new(255, 255, 255, 0),
            vendor_code: 0,
            model_code: 0,
            equipment_ver: 0,
            slave_status: 0,
        };
        encode_node_search_response(&mut buffer, &response);
        assert_eq!(
            parse_set_ip_response(&buffer),
            Err(SlmpFrameError::UnknownMessage)
        );
    }
}
