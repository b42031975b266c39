//! SLMP engine: node discovery and slave IP assignment.
//!
//! At most one node search and one set IP request can be in flight at a
//! time. Requests are sent to the SLMP broadcast address from the SLMP
//! port, or from a short-lived ephemeral socket when a separate send
//! socket is configured; responses arrive on the SLMP port which is bound
//! to 0.0.0.0. Node search responses are collected in a bounded database
//! until the configured delay window closes, then the result callback
//! fires. A set IP confirmation fires as soon as a matching response
//! arrives; its timer only produces the timeout outcome.

use crate::callbacks::{MasterCallbacks, SetIpStatus};
use crate::config::Config;
use crate::error::Error;
use crate::platform::{Platform, UdpHandle};
use crate::slmp_frame;
use crate::timer::Timer;
use crate::types::{MacAddr, SlmpEndCode, MAX_NODE_SEARCH_DEVICES, SLMP_PORT};
use std::io;
use std::net::Ipv4Addr;

const RECV_BUFFER_SIZE: usize = 1500;

/// One slave found by a node search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSearchEntry {
    pub slave_mac_addr: MacAddr,
    pub slave_id: Ipv4Addr,
    pub slave_netmask: Ipv4Addr,
    pub vendor_code: u16,
    pub model_code: u32,
    pub equipment_ver: u16,
    pub slave_status: u16,
}

/// Bounded collection of node search responses.
///
/// `count` is the number of responses seen, `stored` the number kept.
/// Responses arriving when the database is full are counted but dropped.
#[derive(Debug, Clone, Default)]
pub struct NodeSearchDb {
    pub entries: Vec<NodeSearchEntry>,
    pub count: u16,
    pub stored: u16,
}

impl NodeSearchDb {
    fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
        self.stored = 0;
    }

    fn add(&mut self, entry: NodeSearchEntry) {
        self.count = self.count.saturating_add(1);
        if self.entries.len() < MAX_NODE_SEARCH_DEVICES {
            self.entries.push(entry);
            self.stored = self.entries.len() as u16;
        } else {
            log::warn!(
                "Node search database is full ({} entries), dropping response from {}",
                MAX_NODE_SEARCH_DEVICES,
                entry.slave_id
            );
        }
    }
}

/// SLMP engine state. Never touches CCIEFB state.
pub(crate) struct Slmp {
    socket: Option<UdpHandle>,
    /// Last allocated request serial. Serials are 1..=0xFFFF; 0 is never
    /// used.
    request_serial: u16,
    node_search_serial: Option<u16>,
    set_ip_serial: Option<u16>,
    node_search_timer: Timer,
    set_ip_timer: Timer,
    db: NodeSearchDb,
}

impl Slmp {
    pub fn new() -> Self {
        Self {
            socket: None,
            request_serial: 0,
            node_search_serial: None,
            set_ip_serial: None,
            node_search_timer: Timer::new(),
            set_ip_timer: Timer::new(),
            db: NodeSearchDb::default(),
        }
    }

    pub fn init<P: Platform>(&mut self, platform: &mut P) -> Result<(), Error> {
        log::debug!("Open SLMP socket on 0.0.0.0:{}", SLMP_PORT);
        self.socket = Some(platform.udp_open(Ipv4Addr::UNSPECIFIED, SLMP_PORT)?);
        Ok(())
    }

    pub fn exit<P: Platform>(&mut self, platform: &mut P) {
        if let Some(socket) = self.socket.take() {
            platform.udp_close(socket);
        }
        self.node_search_serial = None;
        self.set_ip_serial = None;
        self.node_search_timer.stop();
        self.set_ip_timer.stop();
    }

    pub fn node_search_serial(&self) -> Option<u16> {
        self.node_search_serial
    }

    pub fn set_ip_request_serial(&self) -> Option<u16> {
        self.set_ip_serial
    }

    pub fn node_search_db(&self) -> &NodeSearchDb {
        &self.db
    }

    fn next_serial(&mut self) -> u16 {
        self.request_serial = if self.request_serial == u16::MAX {
            1
        } else {
            self.request_serial + 1
        };
        self.request_serial
    }

    /// Send one request frame. With a separate send socket configured this
    /// opens, uses and closes an ephemeral broadcast socket; otherwise the
    /// frame goes out from the bound SLMP port.
    fn send_request<P: Platform>(
        &mut self,
        platform: &mut P,
        config: &Config,
        broadcast_ip: Ipv4Addr,
        frame: &[u8],
    ) -> Result<(), Error> {
        if config.use_separate_arbitration_socket {
            let socket = platform.udp_open(config.master_ip, 0)?;
            let result = platform.udp_send_to(socket, broadcast_ip, SLMP_PORT, frame);
            platform.udp_close(socket);
            result?;
        } else {
            let socket = self.socket.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "SLMP socket is not open")
            })?;
            platform.udp_send_to(socket, broadcast_ip, SLMP_PORT, frame)?;
        }
        Ok(())
    }

    /// Start a node search.
    ///
    /// Fails with `Error::Busy` when a previous search has not yet
    /// delivered its result.
    pub fn perform_node_search<P: Platform>(
        &mut self,
        platform: &mut P,
        config: &Config,
        master_mac: &MacAddr,
        broadcast_ip: Ipv4Addr,
        now: u32,
    ) -> Result<(), Error> {
        if self.node_search_serial.is_some() {
            log::warn!("A node search is already in flight");
            return Err(Error::Busy);
        }

        let serial = self.next_serial();
        self.db.clear();

        let mut frame = [0_u8; slmp_frame::NODE_SEARCH_REQ_SIZE];
        let size =
            slmp_frame::encode_node_search_request(&mut frame, serial, master_mac, config.master_ip);
        self.send_request(platform, config, broadcast_ip, &frame[..size])?;

        log::debug!(
            "Node search with serial {} sent to {}",
            serial,
            broadcast_ip
        );
        self.node_search_serial = Some(serial);
        self.node_search_timer
            .start(now, u32::from(config.callback_time_node_search_ms) * 1000);
        Ok(())
    }

    /// Send a set IP address request to the slave with the given MAC
    /// address.
    ///
    /// Fails with `Error::Busy` when a previous request has not yet been
    /// confirmed.
    pub fn perform_set_ip_request<P: Platform>(
        &mut self,
        platform: &mut P,
        config: &Config,
        master_mac: &MacAddr,
        broadcast_ip: Ipv4Addr,
        slave_mac: &MacAddr,
        slave_new_ip: Ipv4Addr,
        slave_new_netmask: Ipv4Addr,
        now: u32,
    ) -> Result<(), Error> {
        if self.set_ip_serial.is_some() {
            log::warn!("A set IP request is already in flight");
            return Err(Error::Busy);
        }

        let serial = self.next_serial();
        let mut frame = [0_u8; slmp_frame::SET_IP_REQ_SIZE];
        let size = slmp_frame::encode_set_ip_request(
            &mut frame,
            serial,
            master_mac,
            config.master_ip,
            slave_mac,
            slave_new_ip,
            slave_new_netmask,
        );
        self.send_request(platform, config, broadcast_ip, &frame[..size])?;

        log::debug!(
            "Set IP request with serial {} for slave {} (new IP {})",
            serial,
            crate::util::mac_to_string(slave_mac),
            slave_new_ip
        );
        self.set_ip_serial = Some(serial);
        self.set_ip_timer
            .start(now, u32::from(config.callback_time_set_ip_ms) * 1000);
        Ok(())
    }

    /// Drain the SLMP socket and run the callback timers.
    pub fn periodic<P: Platform>(
        &mut self,
        platform: &mut P,
        callbacks: &mut dyn MasterCallbacks,
        now: u32,
    ) {
        let socket = match self.socket {
            Some(socket) => socket,
            None => return,
        };

        let mut buffer = [0_u8; RECV_BUFFER_SIZE];
        loop {
            let (size, source_ip) = match platform.udp_recv_from(socket, &mut buffer) {
                Ok(Some((size, source_ip, _source_port))) => (size, source_ip),
                Ok(None) => break,
                Err(err) => {
                    log::warn!("SLMP receive failed: {}", err);
                    break;
                }
            };
            self.handle_input_frame(callbacks, &buffer[..size], source_ip);
        }

        self.check_timeouts(callbacks, now);
    }

    fn handle_input_frame(
        &mut self,
        callbacks: &mut dyn MasterCallbacks,
        frame: &[u8],
        source_ip: Ipv4Addr,
    ) {
        if slmp_frame::is_slmp_request(frame) {
            // Node search from another master, or our own broadcast echo.
            log::debug!("Ignoring SLMP request from {}", source_ip);
            return;
        }
        if !slmp_frame::is_slmp_response(frame) {
            log::debug!("Dropping non-SLMP frame from {}", source_ip);
            return;
        }

        match frame.len() {
            slmp_frame::NODE_SEARCH_RESP_SIZE => self.handle_node_search_response(frame, source_ip),
            slmp_frame::SET_IP_RESP_SIZE => self.handle_set_ip_response(callbacks, frame, source_ip),
            slmp_frame::ERROR_RESP_SIZE => self.handle_error_response(callbacks, frame, source_ip),
            size => log::debug!(
                "Dropping SLMP response with unexpected size {} from {}",
                size,
                source_ip
            ),
        }
    }

    fn handle_node_search_response(&mut self, frame: &[u8], source_ip: Ipv4Addr) {
        let response = match slmp_frame::parse_node_search_response(frame) {
            Ok(response) => response,
            Err(err) => {
                log::debug!("Invalid node search response from {}: {}", source_ip, err);
                return;
            }
        };

        if self.node_search_serial != Some(response.serial) {
            log::debug!(
                "Node search response from {} with wrong serial {} (expected {:?})",
                source_ip,
                response.serial,
                self.node_search_serial
            );
            return;
        }

        log::debug!(
            "Node search response from {} ({})",
            response.slave_ip_addr,
            crate::util::mac_to_string(&response.slave_mac_addr)
        );
        self.db.add(NodeSearchEntry {
            slave_mac_addr: response.slave_mac_addr,
            slave_id: response.slave_ip_addr,
            slave_netmask: response.slave_netmask,
            vendor_code: response.vendor_code,
            model_code: response.model_code,
            equipment_ver: response.equipment_ver,
            slave_status: response.slave_status,
        });
    }

    fn handle_set_ip_response(
        &mut self,
        callbacks: &mut dyn MasterCallbacks,
        frame: &[u8],
        source_ip: Ipv4Addr,
    ) {
        let response = match slmp_frame::parse_set_ip_response(frame) {
            Ok(response) => response,
            Err(err) => {
                log::debug!("Invalid set IP response from {}: {}", source_ip, err);
                return;
            }
        };

        if self.set_ip_serial != Some(response.serial) {
            log::debug!(
                "Set IP response from {} with wrong serial {} (expected {:?})",
                source_ip,
                response.serial,
                self.set_ip_serial
            );
            return;
        }

        let status = if SlmpEndCode::from_u16(response.end_code) == Some(SlmpEndCode::Success) {
            SetIpStatus::Success
        } else {
            log::warn!(
                "Set IP response from {} with end code 0x{:04X}",
                source_ip,
                response.end_code
            );
            SetIpStatus::ErrorResponse
        };
        self.set_ip_serial = None;
        self.set_ip_timer.stop();
        callbacks.set_ip_cfm(status);
    }

    fn handle_error_response(
        &mut self,
        callbacks: &mut dyn MasterCallbacks,
        frame: &[u8],
        source_ip: Ipv4Addr,
    ) {
        let response = match slmp_frame::parse_error_response(frame) {
            Ok(response) => response,
            Err(err) => {
                log::debug!("Invalid SLMP error response from {}: {}", source_ip, err);
                return;
            }
        };

        if self.set_ip_serial == Some(response.serial) {
            log::warn!(
                "SLMP error response from {} for set IP request, end code 0x{:04X}",
                source_ip,
                response.end_code
            );
            self.set_ip_serial = None;
            self.set_ip_timer.stop();
            callbacks.set_ip_cfm(SetIpStatus::ErrorResponse);
        } else if self.node_search_serial == Some(response.serial) {
            // Keep collecting; the database is delivered when the delay
            // window closes.
            log::warn!(
                "SLMP error response from {} for node search, end code 0x{:04X}",
                source_ip,
                response.end_code
            );
        } else {
            log::debug!(
                "SLMP error response from {} with unknown serial {}",
                source_ip,
                response.serial
            );
        }
    }

    fn check_timeouts(&mut self, callbacks: &mut dyn MasterCallbacks, now: u32) {
        if self.node_search_timer.is_expired(now) {
            self.node_search_timer.stop();
            self.node_search_serial = None;
            log::debug!(
                "Node search finished with {} responses ({} stored)",
                self.db.count,
                self.db.stored
            );
            callbacks.node_search_result_cfm(&self.db);
        }

        if self.set_ip_timer.is_expired(now) {
            self.set_ip_timer.stop();
            self.set_ip_serial = None;
            log::warn!("Set IP request timed out");
            callbacks.set_ip_cfm(SetIpStatus::Timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_allocation_skips_zero() {
        let mut slmp = Slmp::new();
        assert_eq!(slmp.next_serial(), 1);
        assert_eq!(slmp.next_serial(), 2);

        slmp.request_serial = u16::MAX - 1;
        assert_eq!(slmp.next_serial(), u16::MAX);
        assert_eq!(slmp.next_serial(), 1);
    }

    #[test]
    fn db_is_bounded_but_keeps_counting() {
        let mut db = NodeSearchDb::default();
        let entry = NodeSearchEntry {
            slave_mac_addr: [0; 6],
            slave_id: Ipv4Addr::new(1, 8, 3, 4),
            slave_netmask: Ipv4Addr::new(255, 255, 255, 0),
            vendor_code: 0,
            model_code: 0,
            equipment_ver: 0,
            slave_status: 0,
        };
        for _ in 0..MAX_NODE_SEARCH_DEVICES + 3 {
            db.add(entry);
        }
        assert_eq!(db.count, (MAX_NODE_SEARCH_DEVICES + 3) as u16);
        assert_eq!(db.stored, MAX_NODE_SEARCH_DEVICES as u16);
        assert_eq!(db.entries.len(), MAX_NODE_SEARCH_DEVICES);

        db.clear();
        assert_eq!(db.count, 0);
        assert_eq!(db.stored, 0);
        assert!(db.entries.is_empty());
    }
}
