//! Wire codec for CCIEFB cyclic frames.
//!
//! All multi-byte fields are little endian unless noted. The byte offsets
//! follow the CCIEFB specification; requests carry a 67 byte header followed
//! by a slave ID table (4 bytes per occupied station), the RWw areas (64
//! bytes per station) and the RY areas (8 bytes per station). Responses
//! carry a 59 byte header followed by the RWr areas (64 bytes per station)
//! and the RX areas (8 bytes per station).
//!
//! The response encoder exists for simulators and tests; the master itself
//! only ever parses responses.

use crate::image::{BitArea, WordArea};
use crate::types::{MAX_OCCUPIED_STATIONS_PER_GROUP, WORDS_PER_AREA};
use std::convert::TryInto;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Fixed size of the cyclic request header.
pub const CYCLIC_REQ_HEADER_SIZE: usize = 67;

/// Fixed size of the cyclic response header.
pub const CYCLIC_RESP_HEADER_SIZE: usize = 59;

/// Per-station payload bytes in a request: slave ID + RWw + RY.
pub const CYCLIC_REQ_BYTES_PER_STATION: usize = 4 + 64 + 8;

/// Per-station payload bytes in a response: RWr + RX.
pub const CYCLIC_RESP_BYTES_PER_STATION: usize = 64 + 8;

/// Cyclic data command and sub-command.
pub const CYCLIC_COMMAND: u16 = 0x0E70;
pub const CYCLIC_SUB_COMMAND: u16 = 0x0000;

/// Slave ID table value for an occupied station without a configured device.
pub const SLAVE_ID_NOT_OCCUPIED: u32 = 0xFFFF_FFFF;

/// Slave ID table value for a station belonging to a disabled device.
pub const SLAVE_ID_DISABLED: u32 = 0x0000_0000;

/// The header length field counts every byte from this offset onwards.
const DL_OFFSET: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame is too short")]
    TooShort,
    #[error("Fixed header fields do not match")]
    BadHeader,
    #[error("Header length field does not match the frame size")]
    LengthMismatch,
    #[error("Master IP address in request is invalid")]
    InvalidMasterIp,
    #[error("Number of occupied stations is out of range")]
    BadStationCount,
}

/// Total size of a cyclic request for a group.
pub fn cyclic_request_size(total_occupied: u16) -> usize {
    CYCLIC_REQ_HEADER_SIZE + usize::from(total_occupied) * CYCLIC_REQ_BYTES_PER_STATION
}

/// Total size of a cyclic response from a device.
pub fn cyclic_response_size(num_occupied: u16) -> usize {
    CYCLIC_RESP_HEADER_SIZE + usize::from(num_occupied) * CYCLIC_RESP_BYTES_PER_STATION
}

/// True when the buffer starts like a cyclic request (0x5000 big endian).
pub fn is_cyclic_request(buffer: &[u8]) -> bool {
    buffer.len() >= 2 && buffer[0] == 0x50 && buffer[1] == 0x00
}

/// True when the buffer starts like a cyclic response (0xD000 big endian).
pub fn is_cyclic_response(buffer: &[u8]) -> bool {
    buffer.len() >= 2 && buffer[0] == 0xD0 && buffer[1] == 0x00
}

fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buffer[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buffer[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buffer: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buffer[offset..offset + 8].try_into().unwrap())
}

fn write_u16(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Everything needed to build one cyclic request frame.
#[derive(Debug)]
pub struct CyclicRequest<'a> {
    pub protocol_ver: u16,
    pub master_local_unit_info: u16,
    /// Unix time in milliseconds.
    pub clock_info: u64,
    pub master_ip: Ipv4Addr,
    /// 1-based group number.
    pub group_no: u8,
    pub frame_sequence_no: u16,
    pub timeout_value: u16,
    pub parallel_off_timeout_count: u16,
    pub parameter_no: u16,
    pub cyclic_transmission_state: u16,
    /// One entry per occupied station: the device IP for the first station
    /// of an enabled device, [`SLAVE_ID_DISABLED`] for a disabled device and
    /// [`SLAVE_ID_NOT_OCCUPIED`] for the remaining stations.
    pub slave_ids: &'a [u32],
    pub rww: &'a [WordArea],
    pub ry: &'a [BitArea],
}

/// Encode a cyclic request into `buffer`. Returns the frame size.
///
/// The buffer must hold at least [`cyclic_request_size`] bytes for the
/// station count given by `slave_ids.len()`.
pub fn encode_cyclic_request(request: &CyclicRequest, buffer: &mut [u8]) -> usize {
    let total_occupied = request.slave_ids.len();
    debug_assert_eq!(request.rww.len(), total_occupied);
    debug_assert_eq!(request.ry.len(), total_occupied);
    let size = CYCLIC_REQ_HEADER_SIZE + total_occupied * CYCLIC_REQ_BYTES_PER_STATION;

    let buffer = &mut buffer[..size];
    for byte in buffer.iter_mut() {
        *byte = 0;
    }

    buffer[0] = 0x50;
    buffer[1] = 0x00;
    buffer[2] = 0x00;
    buffer[3] = 0xFF;
    write_u16(buffer, 4, 0x03FF);
    buffer[6] = 0x00;
    write_u16(buffer, 7, (size - DL_OFFSET) as u16);
    write_u16(buffer, 11, CYCLIC_COMMAND);
    write_u16(buffer, 13, CYCLIC_SUB_COMMAND);
    write_u16(buffer, 15, request.protocol_ver);
    write_u16(buffer, 35, request.master_local_unit_info);
    write_u64(buffer, 39, request.clock_info);
    write_u32(buffer, 47, u32::from(request.master_ip));
    buffer[51] = request.group_no;
    write_u16(buffer, 53, request.frame_sequence_no);
    write_u16(buffer, 55, request.timeout_value);
    write_u16(buffer, 57, request.parallel_off_timeout_count);
    write_u16(buffer, 59, request.parameter_no);
    write_u16(buffer, 61, total_occupied as u16);
    write_u16(buffer, 63, request.cyclic_transmission_state);

    let mut pos = CYCLIC_REQ_HEADER_SIZE;
    for slave_id in request.slave_ids {
        write_u32(buffer, pos, *slave_id);
        pos += 4;
    }
    for area in request.rww {
        for word in &area.0 {
            write_u16(buffer, pos, *word);
            pos += 2;
        }
    }
    for area in request.ry {
        buffer[pos..pos + 8].copy_from_slice(&area.0);
        pos += 8;
    }
    debug_assert_eq!(pos, size);

    size
}

/// Header fields of a received cyclic request, e.g. from a competing master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCyclicRequest {
    pub dl: u16,
    pub protocol_ver: u16,
    pub master_local_unit_info: u16,
    pub clock_info: u64,
    pub master_ip: Ipv4Addr,
    pub group_no: u8,
    pub frame_sequence_no: u16,
    pub timeout_value: u16,
    pub parallel_off_timeout_count: u16,
    pub parameter_no: u16,
    pub slave_total_occupied_station_count: u16,
    pub cyclic_transmission_state: u16,
    pub slave_ids: Vec<u32>,
}

/// Parse and validate a cyclic request frame.
pub fn parse_cyclic_request(buffer: &[u8]) -> Result<ParsedCyclicRequest, FrameError> {
    if buffer.len() < CYCLIC_REQ_HEADER_SIZE {
        return Err(FrameError::TooShort);
    }
    if buffer[0] != 0x50
        || buffer[1] != 0x00
        || buffer[2] != 0x00
        || buffer[3] != 0xFF
        || read_u16(buffer, 4) != 0x03FF
        || buffer[6] != 0x00
        || read_u16(buffer, 11) != CYCLIC_COMMAND
        || read_u16(buffer, 13) != CYCLIC_SUB_COMMAND
    {
        return Err(FrameError::BadHeader);
    }
    if usize::from(read_u16(buffer, 7)) != buffer.len() - DL_OFFSET {
        return Err(FrameError::LengthMismatch);
    }

    let master_ip = Ipv4Addr::from(read_u32(buffer, 47));
    if master_ip.is_unspecified() {
        return Err(FrameError::InvalidMasterIp);
    }

    let total_occupied = read_u16(buffer, 61);
    if total_occupied == 0 || total_occupied > MAX_OCCUPIED_STATIONS_PER_GROUP {
        return Err(FrameError::BadStationCount);
    }
    if buffer.len() != cyclic_request_size(total_occupied) {
        return Err(FrameError::LengthMismatch);
    }

    let slave_ids = (0..usize::from(total_occupied))
        .map(|station| read_u32(buffer, CYCLIC_REQ_HEADER_SIZE + station * 4))
        .collect();

    Ok(ParsedCyclicRequest {
        dl: read_u16(buffer, 7),
        protocol_ver: read_u16(buffer, 15),
        master_local_unit_info: read_u16(buffer, 35),
        clock_info: read_u64(buffer, 39),
        master_ip,
        group_no: buffer[51],
        frame_sequence_no: read_u16(buffer, 53),
        timeout_value: read_u16(buffer, 55),
        parallel_off_timeout_count: read_u16(buffer, 57),
        parameter_no: read_u16(buffer, 59),
        slave_total_occupied_station_count: total_occupied,
        cyclic_transmission_state: read_u16(buffer, 63),
        slave_ids,
    })
}

/// The RWw area for one station of a parsed request, as raw bytes.
pub fn request_rww_bytes(buffer: &[u8], total_occupied: u16, station: u16) -> &[u8] {
    debug_assert!(station < total_occupied);
    let start = CYCLIC_REQ_HEADER_SIZE
        + usize::from(total_occupied) * 4
        + usize::from(station) * 64;
    &buffer[start..start + 64]
}

/// The RY area for one station of a parsed request, as raw bytes.
pub fn request_ry_bytes(buffer: &[u8], total_occupied: u16, station: u16) -> &[u8] {
    debug_assert!(station < total_occupied);
    let start = CYCLIC_REQ_HEADER_SIZE
        + usize::from(total_occupied) * (4 + 64)
        + usize::from(station) * 8;
    &buffer[start..start + 8]
}

/// Header fields extracted from a cyclic response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicResponseHeader {
    pub dl: u16,
    pub protocol_ver: u16,
    pub end_code: u16,
    pub vendor_code: u16,
    pub model_code: u32,
    pub equipment_ver: u16,
    pub slave_local_unit_info: u16,
    pub slave_err_code: u16,
    pub local_management_info: u32,
    pub slave_id: Ipv4Addr,
    pub group_no: u8,
    pub frame_sequence_no: u16,
    /// Derived from the frame size.
    pub num_occupied_stations: u16,
}

/// Parse and validate a cyclic response frame.
pub fn parse_cyclic_response(buffer: &[u8]) -> Result<CyclicResponseHeader, FrameError> {
    if buffer.len() < CYCLIC_RESP_HEADER_SIZE {
        return Err(FrameError::TooShort);
    }
    if buffer[0] != 0xD0
        || buffer[1] != 0x00
        || buffer[2] != 0x00
        || buffer[3] != 0xFF
        || read_u16(buffer, 4) != 0x03FF
        || buffer[6] != 0x00
    {
        return Err(FrameError::BadHeader);
    }
    if usize::from(read_u16(buffer, 7)) != buffer.len() - DL_OFFSET {
        return Err(FrameError::LengthMismatch);
    }

    let payload = buffer.len() - CYCLIC_RESP_HEADER_SIZE;
    if payload % CYCLIC_RESP_BYTES_PER_STATION != 0 {
        return Err(FrameError::LengthMismatch);
    }
    let num_occupied = (payload / CYCLIC_RESP_BYTES_PER_STATION) as u16;
    if num_occupied == 0 || num_occupied > MAX_OCCUPIED_STATIONS_PER_GROUP {
        return Err(FrameError::BadStationCount);
    }

    Ok(CyclicResponseHeader {
        dl: read_u16(buffer, 7),
        protocol_ver: read_u16(buffer, 11),
        end_code: read_u16(buffer, 13),
        vendor_code: read_u16(buffer, 31),
        model_code: read_u32(buffer, 35),
        equipment_ver: read_u16(buffer, 39),
        slave_local_unit_info: read_u16(buffer, 43),
        slave_err_code: read_u16(buffer, 45),
        local_management_info: read_u32(buffer, 47),
        slave_id: Ipv4Addr::from(read_u32(buffer, 51)),
        group_no: buffer[55],
        frame_sequence_no: read_u16(buffer, 57),
        num_occupied_stations: num_occupied,
    })
}

/// The RWr area for one station of a parsed response, as raw little-endian
/// bytes.
pub fn response_rwr_bytes(buffer: &[u8], station: u16) -> &[u8] {
    let start = CYCLIC_RESP_HEADER_SIZE + usize::from(station) * 64;
    &buffer[start..start + 64]
}

/// The RX area for one station of a parsed response.
pub fn response_rx_bytes(buffer: &[u8], num_occupied: u16, station: u16) -> &[u8] {
    debug_assert!(station < num_occupied);
    let start =
        CYCLIC_RESP_HEADER_SIZE + usize::from(num_occupied) * 64 + usize::from(station) * 8;
    &buffer[start..start + 8]
}

/// Decode a 64 byte RWr (or RWw) wire area into word registers.
pub fn decode_word_area(bytes: &[u8]) -> WordArea {
    debug_assert_eq!(bytes.len(), 64);
    let mut area = WordArea::default();
    for word in 0..usize::from(WORDS_PER_AREA) {
        area.0[word] = u16::from_le_bytes(bytes[word * 2..word * 2 + 2].try_into().unwrap());
    }
    area
}

/// Everything needed to build one cyclic response frame.
#[derive(Debug)]
pub struct CyclicResponse<'a> {
    pub protocol_ver: u16,
    pub end_code: u16,
    pub vendor_code: u16,
    pub model_code: u32,
    pub equipment_ver: u16,
    pub slave_local_unit_info: u16,
    pub slave_err_code: u16,
    pub local_management_info: u32,
    pub slave_id: Ipv4Addr,
    pub group_no: u8,
    pub frame_sequence_no: u16,
    pub rwr: &'a [WordArea],
    pub rx: &'a [BitArea],
}

/// Encode a cyclic response into `buffer`. Returns the frame size.
pub fn encode_cyclic_response(response: &CyclicResponse, buffer: &mut [u8]) -> usize {
    let num_occupied = response.rwr.len();
    debug_assert_eq!(response.rx.len(), num_occupied);
    let size = CYCLIC_RESP_HEADER_SIZE + num_occupied * CYCLIC_RESP_BYTES_PER_STATION;

    let buffer = &mut buffer[..size];
    for byte in buffer.iter_mut() {
        *byte = 0;
    }

    buffer[0] = 0xD0;
    buffer[1] = 0x00;
    buffer[2] = 0x00;
    buffer[3] = 0xFF;
    write_u16(buffer, 4, 0x03FF);
    buffer[6] = 0x00;
    write_u16(buffer, 7, (size - DL_OFFSET) as u16);
    write_u16(buffer, 11, response.protocol_ver);
    write_u16(buffer, 13, response.end_code);
    write_u16(buffer, 31, response.vendor_code);
    write_u32(buffer, 35, response.model_code);
    write_u16(buffer, 39, response.equipment_ver);
    write_u16(buffer, 43, response.slave_local_unit_info);
    write_u16(buffer, 45, response.slave_err_code);
    write_u32(buffer, 47, response.local_management_info);
    write_u32(buffer, 51, u32::from(response.slave_id));
    buffer[55] = response.group_no;
    write_u16(buffer, 57, response.frame_sequence_no);

    let mut pos = CYCLIC_RESP_HEADER_SIZE;
    for area in response.rwr {
        for word in &area.0 {
            write_u16(buffer, pos, *word);
            pos += 2;
        }
    }
    for area in response.rx {
        buffer[pos..pos + 8].copy_from_slice(&area.0);
        pos += 8;
    }
    debug_assert_eq!(pos, size);

    size
}
