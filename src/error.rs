use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration")]
    Config,
    #[error("Duplicate slave IP address in configuration: {0}")]
    DuplicateSlaveId(Ipv4Addr),
    #[error("Could not resolve network interface settings")]
    Iface,
    #[error("Socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid group index")]
    GroupIndex,
    #[error("Invalid slave device index")]
    DeviceIndex,
    #[error("Bit or register number out of range")]
    SignalNumber,
    #[error("An SLMP request is already in flight")]
    Busy,
}

/// Stack-detected error conditions reported via the `error_ind` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A request from another master was seen during arbitration. The
    /// accompanying IP address is the conflicting master.
    ArbitrationFailed,
    /// The same frame sequence number was received twice from one slave. The
    /// accompanying IP address is the slave.
    SlaveDuplication,
    /// A slave reported that it disagrees with the configured number of
    /// occupied stations.
    SlaveReportsWrongNumberOccupied,
    /// A slave reported that another master is active.
    SlaveReportsMasterDuplication,
}
