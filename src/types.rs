//! Protocol constants and shared semantic types.

use num_derive::FromPrimitive;
use std::net::Ipv4Addr;

/// UDP port for cyclic CCIEFB communication.
pub const CCIEFB_PORT: u16 = 61450;

/// UDP port for the SLMP management protocol.
pub const SLMP_PORT: u16 = 61451;

/// Lowest supported CCIEFB protocol version.
pub const MIN_PROTOCOL_VER: u16 = 1;

/// Highest supported CCIEFB protocol version.
pub const MAX_PROTOCOL_VER: u16 = 2;

/// Group numbers are 1-based and fit in a single byte on the wire.
pub const MIN_GROUP_NO: u16 = 1;
pub const MAX_GROUP_NO: u16 = 64;

/// A slave device occupies at least one station.
pub const MIN_OCCUPIED_STATIONS_PER_DEVICE: u16 = 1;

/// The cyclic transmission state bitmap is 16 bits wide, one per station.
pub const MAX_OCCUPIED_STATIONS_PER_GROUP: u16 = 16;

/// Protocol-wide cap on the number of occupied stations.
pub const MAX_OCCUPIED_STATIONS_ALL_GROUPS: u16 = 64;

/// Smallest allowed group timeout, in milliseconds.
pub const MIN_TIMEOUT_MS: u16 = 10;

/// Largest allowed timeout when constant link scan time is used, in
/// milliseconds.
pub const MAX_TIMEOUT_CONSTANT_LINKSCAN_MS: u16 = 2000;

/// Smallest allowed parallel-off timeout count.
pub const MIN_TIMEOUT_COUNT: u16 = 1;

/// Capacity of the node search result database.
pub const MAX_NODE_SEARCH_DEVICES: usize = 16;

/// Number of bit signals (RX or RY) per occupied station.
pub const BITS_PER_AREA: u16 = 64;

/// Number of word signals (RWr or RWw) per occupied station.
pub const WORDS_PER_AREA: u16 = 32;

/// MAC address in transmission byte order.
pub type MacAddr = [u8; 6];

/// Stack version, from the crate metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simplified state of the master stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Down,
    /// Listening for other masters before starting cyclic transmission.
    Arbitration,
    /// Not transmitting. Entered when another master has been detected;
    /// requires a re-init to leave.
    Standby,
    Running,
}

/// State of the link scan machinery for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    MasterDown,
    MasterListen,
    MasterArbitration,
    MasterLinkScan,
    /// Link scan finished early; waiting out the constant link scan time.
    MasterLinkScanComp,
}

/// Connection state of one configured slave device, as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    MasterDown,
    Listen,
    /// First request of the session sent, no response seen yet.
    WaitTd,
    /// Request sent to an already-connected device, response outstanding.
    CyclicSending,
    /// Response for the current link scan received.
    CyclicSent,
    /// Excluded from cyclic transmission (disabled or reserved).
    CyclicSuspend,
}

/// End codes used in CCIEFB cyclic responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum CyclicEndCode {
    Success = 0x0000,
    /// The slave sees cyclic requests from more than one master.
    MasterDuplication = 0xCFE0,
    /// The slave disagrees with the configured number of occupied stations.
    WrongNumberOccupiedStations = 0xCFE1,
    SlaveError = 0xCFF0,
    SlaveRequestsDisconnect = 0xCFFF,
}

impl CyclicEndCode {
    /// Classify a raw end code. Unknown codes yield `None`.
    pub fn from_u16(value: u16) -> Option<Self> {
        <Self as num_traits::FromPrimitive>::from_u16(value)
    }
}

/// End codes used in SLMP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum SlmpEndCode {
    Success = 0x0000,
    CommandNotSupported = 0xC059,
}

impl SlmpEndCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        <Self as num_traits::FromPrimitive>::from_u16(value)
    }
}

/// Master application status, as carried in the request header.
pub const MASTER_LOCAL_UNIT_INFO_STOPPED: u16 = 0x0000;
pub const MASTER_LOCAL_UNIT_INFO_RUNNING: u16 = 0x0001;
pub const MASTER_LOCAL_UNIT_INFO_STOPPED_BY_USER: u16 = 0x0002;

/// Calculate the master local unit info word.
///
/// The stopped-by-user distinction exists in protocol version 2 and later
/// only.
pub fn master_local_unit_info(protocol_ver: u16, running: bool, stopped_by_user: bool) -> u16 {
    if running {
        MASTER_LOCAL_UNIT_INFO_RUNNING
    } else if protocol_ver == 1 {
        MASTER_LOCAL_UNIT_INFO_STOPPED
    } else if stopped_by_user {
        MASTER_LOCAL_UNIT_INFO_STOPPED_BY_USER
    } else {
        MASTER_LOCAL_UNIT_INFO_STOPPED
    }
}

/// Snapshot of master internals, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterStatusDetails {
    pub master_state: MasterState,
    pub parameter_no: u16,
    pub node_search_serial: Option<u16>,
    pub set_ip_request_serial: Option<u16>,
    /// Master that won an arbitration against us, if any was seen.
    pub latest_conflicting_master_ip: Option<Ipv4Addr>,
}

/// Snapshot of one group, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStatusDetails {
    pub group_state: GroupState,
    pub total_occupied: u16,
    pub frame_sequence_no: u16,
    pub cyclic_transmission_state: u16,
}
