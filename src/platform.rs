//! Platform abstraction for sockets, interface settings and wall clock.
//!
//! The core never blocks: a receive that would block is reported as "no
//! frame". Tests replace the whole platform with a scripted mock, the same
//! way the original stack mocks its OS abstraction layer.

use crate::types::MacAddr;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

/// Handle for an open UDP socket, issued by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHandle(pub usize);

/// Resolved settings of the network interface carrying the master IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub ifindex: u32,
    pub netmask: Ipv4Addr,
    pub mac_address: MacAddr,
    pub ifname: String,
}

/// Operating system services used by the master stack.
pub trait Platform {
    /// Open a UDP socket bound to the given address. The socket must be
    /// non-blocking and allowed to send broadcasts. Port 0 requests an
    /// ephemeral port.
    fn udp_open(&mut self, local_ip: Ipv4Addr, port: u16) -> io::Result<UdpHandle>;

    fn udp_send_to(
        &mut self,
        handle: UdpHandle,
        dest_ip: Ipv4Addr,
        dest_port: u16,
        data: &[u8],
    ) -> io::Result<usize>;

    /// Receive one datagram. Returns `None` when no datagram is pending.
    fn udp_recv_from(
        &mut self,
        handle: UdpHandle,
        buffer: &mut [u8],
    ) -> io::Result<Option<(usize, Ipv4Addr, u16)>>;

    fn udp_close(&mut self, handle: UdpHandle);

    /// Look up the interface settings for the given IP address.
    fn network_settings(&mut self, ip_addr: Ipv4Addr) -> io::Result<NetworkSettings>;

    /// Wall clock as Unix milliseconds, for the clock info field in cyclic
    /// requests.
    fn unix_time_ms(&self) -> u64;
}

/// `Platform` implementation over `std::net::UdpSocket`.
///
/// Interface discovery is out of scope for the core, so the interface
/// settings are supplied at construction time by the application.
pub struct OsPlatform {
    settings: NetworkSettings,
    sockets: Vec<Option<UdpSocket>>,
}

impl OsPlatform {
    pub fn new(settings: NetworkSettings) -> Self {
        Self {
            settings,
            sockets: Vec::new(),
        }
    }

    fn socket(&self, handle: UdpHandle) -> io::Result<&UdpSocket> {
        self.sockets
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))
    }
}

impl Platform for OsPlatform {
    fn udp_open(&mut self, local_ip: Ipv4Addr, port: u16) -> io::Result<UdpHandle> {
        let socket = UdpSocket::bind((local_ip, port))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        let handle = UdpHandle(self.sockets.len());
        self.sockets.push(Some(socket));
        Ok(handle)
    }

    fn udp_send_to(
        &mut self,
        handle: UdpHandle,
        dest_ip: Ipv4Addr,
        dest_port: u16,
        data: &[u8],
    ) -> io::Result<usize> {
        self.socket(handle)?.send_to(data, (dest_ip, dest_port))
    }

    fn udp_recv_from(
        &mut self,
        handle: UdpHandle,
        buffer: &mut [u8],
    ) -> io::Result<Option<(usize, Ipv4Addr, u16)>> {
        match self.socket(handle)?.recv_from(buffer) {
            Ok((size, SocketAddr::V4(source))) => Ok(Some((size, *source.ip(), source.port()))),
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn udp_close(&mut self, handle: UdpHandle) {
        if let Some(slot) = self.sockets.get_mut(handle.0) {
            *slot = None;
        }
    }

    fn network_settings(&mut self, _ip_addr: Ipv4Addr) -> io::Result<NetworkSettings> {
        Ok(self.settings.clone())
    }

    fn unix_time_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}
