//! Shared test fixtures: a scripted platform mock and callback counters.
#![allow(dead_code)]

use cclink_master::{
    Config, ErrorKind, GroupSetting, Master, MasterCallbacks, MasterState, NetworkSettings,
    NodeSearchEntry, Platform, SetIpStatus, SlaveDeviceSetting, UdpHandle,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::rc::Rc;

pub const MASTER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 250);
pub const MASTER_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const MASTER_MAC: [u8; 6] = [0x1C, 0x39, 0x47, 0xCD, 0xD4, 0xEB];
pub const SLAVE_IP_0: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 201);
pub const SLAVE_IP_1: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 202);
pub const SLAVE_MAC: [u8; 6] = [0x74, 0x56, 0x3C, 0x4D, 0x8A, 0x92];
pub const BROADCAST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 255);

pub const TICK_US: u32 = 1000;
pub const TIMEOUT_MS: u16 = 500;
pub const ARBITRATION_MS: u16 = 2500;

/// Socket handle indices as opened by `Master::init` with the default
/// configuration: the CCIEFB socket first, then the SLMP socket. With
/// `use_separate_arbitration_socket` the arbitration socket takes index 1
/// and short-lived SLMP send sockets are appended per request.
pub const CCIEFB_SOCKET: usize = 0;
pub const SLMP_SOCKET: usize = 1;

#[derive(Debug)]
pub struct MockPort {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub open: bool,
    pub sent: Vec<(Ipv4Addr, u16, Vec<u8>)>,
    pub inbox: VecDeque<(Ipv4Addr, u16, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct MockNet {
    unix_ms: u64,
    ports: Vec<MockPort>,
}

/// Scripted `Platform`: records transmissions, delivers injected frames and
/// serves a fixed wall clock.
#[derive(Clone)]
pub struct MockPlatform {
    settings: NetworkSettings,
    net: Rc<RefCell<MockNet>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            settings: NetworkSettings {
                ifindex: 2,
                netmask: MASTER_NETMASK,
                mac_address: MASTER_MAC,
                ifname: "eth0".to_string(),
            },
            net: Rc::new(RefCell::new(MockNet::default())),
        }
    }

    pub fn port_count(&self) -> usize {
        self.net.borrow().ports.len()
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.net.borrow().ports[index].open
    }

    pub fn local_addr(&self, index: usize) -> (Ipv4Addr, u16) {
        let net = self.net.borrow();
        (net.ports[index].local_ip, net.ports[index].local_port)
    }

    /// Everything sent on a socket so far: (destination IP, port, frame).
    pub fn sent(&self, index: usize) -> Vec<(Ipv4Addr, u16, Vec<u8>)> {
        self.net.borrow().ports[index].sent.clone()
    }

    /// Drain the transmission record of a socket.
    pub fn take_sent(&self, index: usize) -> Vec<(Ipv4Addr, u16, Vec<u8>)> {
        std::mem::take(&mut self.net.borrow_mut().ports[index].sent)
    }

    /// Queue a frame for reception on a socket.
    pub fn inject(&self, index: usize, source_ip: Ipv4Addr, source_port: u16, data: &[u8]) {
        self.net.borrow_mut().ports[index]
            .inbox
            .push_back((source_ip, source_port, data.to_vec()));
    }

    pub fn set_unix_ms(&self, unix_ms: u64) {
        self.net.borrow_mut().unix_ms = unix_ms;
    }
}

impl Platform for MockPlatform {
    fn udp_open(&mut self, local_ip: Ipv4Addr, port: u16) -> io::Result<UdpHandle> {
        let mut net = self.net.borrow_mut();
        let handle = UdpHandle(net.ports.len());
        net.ports.push(MockPort {
            local_ip,
            local_port: port,
            open: true,
            sent: Vec::new(),
            inbox: VecDeque::new(),
        });
        Ok(handle)
    }

    fn udp_send_to(
        &mut self,
        handle: UdpHandle,
        dest_ip: Ipv4Addr,
        dest_port: u16,
        data: &[u8],
    ) -> io::Result<usize> {
        let mut net = self.net.borrow_mut();
        let port = net
            .ports
            .get_mut(handle.0)
            .filter(|port| port.open)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "socket is closed"))?;
        port.sent.push((dest_ip, dest_port, data.to_vec()));
        Ok(data.len())
    }

    fn udp_recv_from(
        &mut self,
        handle: UdpHandle,
        buffer: &mut [u8],
    ) -> io::Result<Option<(usize, Ipv4Addr, u16)>> {
        let mut net = self.net.borrow_mut();
        let port = net
            .ports
            .get_mut(handle.0)
            .filter(|port| port.open)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "socket is closed"))?;
        match port.inbox.pop_front() {
            Some((source_ip, source_port, data)) => {
                let size = data.len().min(buffer.len());
                buffer[..size].copy_from_slice(&data[..size]);
                Ok(Some((size, source_ip, source_port)))
            }
            None => Ok(None),
        }
    }

    fn udp_close(&mut self, handle: UdpHandle) {
        if let Some(port) = self.net.borrow_mut().ports.get_mut(handle.0) {
            port.open = false;
        }
    }

    fn network_settings(&mut self, _ip_addr: Ipv4Addr) -> io::Result<NetworkSettings> {
        Ok(self.settings.clone())
    }

    fn unix_time_ms(&self) -> u64 {
        self.net.borrow().unix_ms
    }
}

#[derive(Debug, Default)]
pub struct CallbackCounters {
    pub states: Vec<MasterState>,
    pub connects: Vec<(u16, u16, Ipv4Addr)>,
    pub disconnects: Vec<(u16, u16, Ipv4Addr)>,
    pub linkscans: Vec<(u16, bool)>,
    pub alarms: Vec<(u16, u16, u16, u16, u32)>,
    pub changed_infos: Vec<(u16, u16, u16, u16, u32)>,
    pub errors: Vec<(ErrorKind, Ipv4Addr, u16)>,
    pub node_search_results: Vec<(u16, u16, Vec<NodeSearchEntry>)>,
    pub set_ip_results: Vec<SetIpStatus>,
}

/// `MasterCallbacks` receiver that records every indication into shared
/// counters.
pub struct SharedCallbacks(pub Rc<RefCell<CallbackCounters>>);

impl MasterCallbacks for SharedCallbacks {
    fn state_ind(&mut self, state: MasterState) {
        self.0.borrow_mut().states.push(state);
    }

    fn connect_ind(&mut self, group_index: u16, device_index: u16, slave_id: Ipv4Addr) {
        self.0
            .borrow_mut()
            .connects
            .push((group_index, device_index, slave_id));
    }

    fn disconnect_ind(&mut self, group_index: u16, device_index: u16, slave_id: Ipv4Addr) {
        self.0
            .borrow_mut()
            .disconnects
            .push((group_index, device_index, slave_id));
    }

    fn linkscan_complete_ind(&mut self, group_index: u16, success: bool) {
        self.0.borrow_mut().linkscans.push((group_index, success));
    }

    fn alarm_ind(
        &mut self,
        group_index: u16,
        device_index: u16,
        end_code: u16,
        slave_err_code: u16,
        local_management_info: u32,
    ) {
        self.0.borrow_mut().alarms.push((
            group_index,
            device_index,
            end_code,
            slave_err_code,
            local_management_info,
        ));
    }

    fn changed_slave_info_ind(
        &mut self,
        group_index: u16,
        device_index: u16,
        end_code: u16,
        slave_err_code: u16,
        local_management_info: u32,
    ) {
        self.0.borrow_mut().changed_infos.push((
            group_index,
            device_index,
            end_code,
            slave_err_code,
            local_management_info,
        ));
    }

    fn error_ind(&mut self, kind: ErrorKind, ip_addr: Ipv4Addr, argument_2: u16) {
        self.0.borrow_mut().errors.push((kind, ip_addr, argument_2));
    }

    fn node_search_result_cfm(&mut self, db: &cclink_master::NodeSearchDb) {
        self.0
            .borrow_mut()
            .node_search_results
            .push((db.count, db.stored, db.entries.clone()));
    }

    fn set_ip_cfm(&mut self, status: SetIpStatus) {
        self.0.borrow_mut().set_ip_results.push(status);
    }
}

/// Master configuration with one group of two slave devices occupying
/// 1 + 2 = 3 stations.
pub fn sample_config() -> Config {
    let mut config = Config::new(MASTER_IP);
    config.groups = vec![GroupSetting {
        timeout_value_ms: TIMEOUT_MS,
        parallel_off_timeout_count: 3,
        use_constant_link_scan_time: false,
        slave_devices: vec![
            SlaveDeviceSetting::new(SLAVE_IP_0, 1),
            SlaveDeviceSetting::new(SLAVE_IP_1, 2),
        ],
    }];
    config
}

pub struct Fixture {
    pub master: Master<MockPlatform>,
    pub net: MockPlatform,
    pub counters: Rc<RefCell<CallbackCounters>>,
    pub now: u32,
    _file_directory: tempfile::TempDir,
}

/// Initialise a master on the mock platform, with the parameter file kept
/// in a scratch directory. Set RUST_LOG to see the stack logs while a test
/// runs.
pub fn start_master(mut config: Config) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let file_directory = tempfile::tempdir().expect("tempdir");
    if config.file_directory.is_none() {
        config.file_directory = Some(file_directory.path().to_path_buf());
    }
    let net = MockPlatform::new();
    let counters = Rc::new(RefCell::new(CallbackCounters::default()));
    let master = Master::init(
        config,
        net.clone(),
        Box::new(SharedCallbacks(counters.clone())),
        0,
    )
    .expect("master init");
    Fixture {
        master,
        net,
        counters,
        now: 0,
        _file_directory: file_directory,
    }
}

impl Fixture {
    /// Advance time and run one tick.
    pub fn tick(&mut self, advance_us: u32) {
        self.now = self.now.wrapping_add(advance_us);
        self.master.periodic(self.now);
    }

    /// Run ticks until arbitration is over and the first request is out.
    pub fn run_until_running(&mut self) {
        self.tick(TICK_US);
        self.tick(u32::from(ARBITRATION_MS) * 1000 + TICK_US);
        assert_eq!(
            self.master.master_status().master_state,
            MasterState::Running
        );
    }

    /// Inject a frame on the CCIEFB socket.
    pub fn inject_cciefb(&self, source_ip: Ipv4Addr, data: &[u8]) {
        self.net
            .inject(CCIEFB_SOCKET, source_ip, cclink_master::types::CCIEFB_PORT, data);
    }

    /// Inject a frame on the SLMP socket.
    pub fn inject_slmp(&self, source_ip: Ipv4Addr, data: &[u8]) {
        self.net
            .inject(SLMP_SOCKET, source_ip, cclink_master::types::SLMP_PORT, data);
    }
}

/// Encode a cyclic response into a fresh buffer.
pub fn build_cyclic_response(response: &cclink_master::frame::CyclicResponse) -> Vec<u8> {
    let mut buffer = vec![0_u8; 1500];
    let size = cclink_master::frame::encode_cyclic_response(response, &mut buffer);
    buffer.truncate(size);
    buffer
}

/// A successful single-station response from a slave, with default
/// identification codes.
pub fn simple_response(slave_ip: Ipv4Addr, frame_sequence_no: u16) -> Vec<u8> {
    use cclink_master::{frame, BitArea, WordArea};
    build_cyclic_response(&frame::CyclicResponse {
        protocol_ver: 2,
        end_code: 0x0000,
        vendor_code: 0x3456,
        model_code: 0x789A_BCDE,
        equipment_ver: 0xF012,
        slave_local_unit_info: 0x0001,
        slave_err_code: 0,
        local_management_info: 0,
        slave_id: slave_ip,
        group_no: 1,
        frame_sequence_no,
        rwr: &[WordArea::default()],
        rx: &[BitArea::default()],
    })
}
