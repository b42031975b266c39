//! CCIEFB engine: request emission, response handling and the coupled
//! device and group state machines.
//!
//! Each group runs one link scan at a time: a broadcast request followed by
//! unicast responses from the slaves. The group state machine drives
//! arbitration and the scan cadence; the device state machine tracks the
//! connection to each configured slave. Both are exhaustive matches over
//! (state, event) pairs, with every unlisted pair a no-op.

use crate::callbacks::MasterCallbacks;
use crate::config::{Config, SlaveDeviceSetting};
use crate::error::ErrorKind;
use crate::frame;
use crate::image::ProcessImage;
use crate::platform::{Platform, UdpHandle};
use crate::stats::Statistics;
use crate::timer::Timer;
use crate::types::{self, CyclicEndCode, DeviceState, GroupState, MasterState};
use std::net::Ipv4Addr;

const RECV_BUFFER_SIZE: usize = 1500;

/// Shared per-call context: configuration, OS services, callbacks and the
/// current timestamp in microseconds.
pub(crate) struct Ctx<'a, P: Platform> {
    pub cfg: &'a Config,
    pub platform: &'a mut P,
    pub callbacks: &'a mut dyn MasterCallbacks,
    pub now: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceEvent {
    GroupStartup,
    ScanStartDeviceStart,
    ScanStartDeviceStop,
    ReceiveOk,
    ReceiveError,
    GroupTimeout,
    GroupStandby,
    GroupAllResponded,
    SlaveDuplication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupEvent {
    Startup,
    NewConfig,
    ReqFromOther,
    /// Only a re-init changes parameters today; nothing emits this event.
    #[allow(dead_code)]
    ParameterChange,
    ArbitrationDone,
    LinkscanComplete,
    LinkscanTimeout,
    LinkscanStart,
    MasterDuplAlarm,
}

/// Snapshot of the last accepted response from a slave device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestFrame {
    pub has_been_received: bool,
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
    pub num_occupied_stations: u16,
    pub frame_sequence_no: u16,
    pub response_time_us: u32,
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self {
            has_been_received: false,
            protocol_ver: 0,
            end_code: 0,
            vendor_code: 0,
            model_code: 0,
            equipment_ver: 0,
            slave_local_unit_info: 0,
            slave_err_code: 0,
            local_management_info: 0,
            slave_id: Ipv4Addr::UNSPECIFIED,
            group_no: 0,
            num_occupied_stations: 0,
            frame_sequence_no: 0,
            response_time_us: 0,
        }
    }
}

/// Runtime state for one configured slave device.
#[derive(Debug, Clone)]
pub struct DeviceData {
    pub device_index: u16,
    /// 1-based station number of the device's first occupied station.
    pub slave_station_no: u16,
    /// Cleared via `set_slave_communication_status`.
    pub enabled: bool,
    /// Bit value used for this device in the current transmission bitmap.
    pub transmission_bit: bool,
    /// Application override, independent of `enabled`.
    pub force_transmission_bit: bool,
    pub device_state: DeviceState,
    /// Consecutive link scan timeouts since the last response.
    pub timeout_count: u16,
    pub statistics: Statistics,
    pub latest_frame: LatestFrame,
    pub(crate) connected: bool,
    pub(crate) duplication_error_reported: bool,
}

impl DeviceData {
    pub(crate) fn new(device_index: u16, slave_station_no: u16) -> Self {
        Self {
            device_index,
            slave_station_no,
            enabled: true,
            transmission_bit: false,
            force_transmission_bit: false,
            device_state: DeviceState::MasterDown,
            timeout_count: 0,
            statistics: Statistics::default(),
            latest_frame: LatestFrame::default(),
            connected: false,
            duplication_error_reported: false,
        }
    }
}

/// Runtime state for one group of slave devices.
pub(crate) struct GroupData {
    pub group_index: u16,
    pub group_state: GroupState,
    /// 0 for the initial probe, then 1..=0xFFFF (0 is skipped on wrap).
    pub frame_sequence_no: u16,
    pub cyclic_transmission_state: u16,
    pub total_occupied: u16,
    pub devices: Vec<DeviceData>,
    pub image: ProcessImage,
    /// Preallocated request frame, reused for every transmission.
    send_buffer: Vec<u8>,
    arbitration_timer: Timer,
    linkscan_timer: Timer,
    constant_linkscan_timer: Timer,
    /// Timestamp of the most recent request transmission.
    linkscan_start_time: u32,
}

/// Advance a frame sequence number, skipping 0 after the first wrap.
pub(crate) fn next_frame_sequence_no(sequence_no: u16) -> u16 {
    if sequence_no == u16::MAX {
        1
    } else {
        sequence_no + 1
    }
}

fn fire_connect(
    callbacks: &mut dyn MasterCallbacks,
    group_index: u16,
    setting: &SlaveDeviceSetting,
    device: &mut DeviceData,
) {
    if !device.connected {
        device.connected = true;
        device.statistics.number_of_connects += 1;
        log::debug!(
            "Slave {} connected (group index {} device index {})",
            setting.slave_id,
            group_index,
            device.device_index
        );
        callbacks.connect_ind(group_index, device.device_index, setting.slave_id);
    }
}

fn fire_disconnect(
    callbacks: &mut dyn MasterCallbacks,
    group_index: u16,
    setting: &SlaveDeviceSetting,
    device: &mut DeviceData,
) {
    if device.connected {
        device.connected = false;
        device.statistics.number_of_disconnects += 1;
        log::debug!(
            "Slave {} disconnected (group index {} device index {})",
            setting.slave_id,
            group_index,
            device.device_index
        );
        callbacks.disconnect_ind(group_index, device.device_index, setting.slave_id);
    }
}

/// Run one event through the device state machine.
fn device_event(
    callbacks: &mut dyn MasterCallbacks,
    group_index: u16,
    setting: &SlaveDeviceSetting,
    parallel_off_timeout_count: u16,
    device: &mut DeviceData,
    event: DeviceEvent,
) {
    use DeviceEvent::*;
    use DeviceState::*;

    match (device.device_state, event) {
        (MasterDown, GroupStartup) => {
            device.timeout_count = 0;
            device.statistics.clear();
            device.device_state = Listen;
        }
        (Listen, ScanStartDeviceStart) => {
            fire_disconnect(callbacks, group_index, setting, device);
            device.device_state = WaitTd;
        }
        (Listen, ScanStartDeviceStop) => {
            fire_disconnect(callbacks, group_index, setting, device);
            device.device_state = CyclicSuspend;
        }
        (WaitTd, ReceiveOk) => {
            fire_connect(callbacks, group_index, setting, device);
            device.timeout_count = 0;
            device.device_state = CyclicSent;
        }
        (WaitTd, ReceiveError) => device.device_state = Listen,
        (WaitTd, GroupTimeout) => {
            // Never responded in this session: give up on the first
            // deadline instead of counting up to the parallel-off limit.
            device.statistics.number_of_timeouts += 1;
            device.timeout_count = 0;
            device.device_state = Listen;
        }
        (WaitTd, GroupStandby)
        | (WaitTd, GroupAllResponded)
        | (WaitTd, SlaveDuplication) => device.device_state = Listen,
        (CyclicSending, ReceiveOk) => {
            fire_connect(callbacks, group_index, setting, device);
            device.timeout_count = 0;
            device.device_state = CyclicSent;
        }
        (CyclicSending, ReceiveError) => {
            fire_disconnect(callbacks, group_index, setting, device);
            device.device_state = Listen;
        }
        (CyclicSending, GroupStandby) => device.device_state = Listen,
        (CyclicSending, GroupTimeout) => {
            device.statistics.number_of_timeouts += 1;
            device.timeout_count += 1;
            if device.timeout_count >= parallel_off_timeout_count {
                fire_disconnect(callbacks, group_index, setting, device);
                device.timeout_count = 0;
                device.device_state = Listen;
            } else {
                device.device_state = CyclicSent;
            }
        }
        (CyclicSending, SlaveDuplication) => {
            fire_disconnect(callbacks, group_index, setting, device);
            device.device_state = Listen;
        }
        (CyclicSent, ScanStartDeviceStart) => {
            fire_connect(callbacks, group_index, setting, device);
            device.device_state = CyclicSending;
        }
        (CyclicSent, ScanStartDeviceStop) => device.device_state = CyclicSuspend,
        (CyclicSent, GroupStandby) | (CyclicSent, SlaveDuplication) => {
            device.device_state = Listen
        }
        (CyclicSuspend, GroupTimeout)
        | (CyclicSuspend, GroupAllResponded)
        | (CyclicSuspend, GroupStandby)
        | (CyclicSuspend, SlaveDuplication) => device.device_state = Listen,
        _ => {}
    }
}

/// True when every participating device has answered the current scan.
fn have_received_from_all_devices(group: &GroupData) -> bool {
    if group.frame_sequence_no == 0 {
        // Initial probe: done once no device is still waiting for its
        // first response.
        group
            .devices
            .iter()
            .all(|device| device.device_state != DeviceState::WaitTd)
    } else {
        group.devices.iter().all(|device| {
            device.device_state == DeviceState::CyclicSuspend
                || (device.device_state == DeviceState::CyclicSent && device.transmission_bit)
        })
    }
}

/// CCIEFB engine state.
pub(crate) struct Iefb {
    pub master_state: MasterState,
    pub parameter_no: u16,
    app_running: bool,
    app_stopped_by_user: bool,
    pub latest_conflicting_master_ip: Option<Ipv4Addr>,
    socket: Option<UdpHandle>,
    arbitration_socket: Option<UdpHandle>,
    broadcast_ip: Ipv4Addr,
    pub groups: Vec<GroupData>,
}

impl Iefb {
    pub fn new() -> Self {
        Self {
            master_state: MasterState::Down,
            parameter_no: 0,
            app_running: false,
            app_stopped_by_user: false,
            latest_conflicting_master_ip: None,
            socket: None,
            arbitration_socket: None,
            broadcast_ip: Ipv4Addr::UNSPECIFIED,
            groups: Vec::new(),
        }
    }

    /// Open sockets, build the per-group runtime state and bring every
    /// group from MASTER_DOWN to MASTER_LISTEN.
    pub fn init<P: Platform>(
        &mut self,
        ctx: &mut Ctx<P>,
        broadcast_ip: Ipv4Addr,
    ) -> Result<(), crate::error::Error> {
        self.broadcast_ip = broadcast_ip;

        self.groups = ctx
            .cfg
            .groups
            .iter()
            .enumerate()
            .map(|(group_index, group_setting)| {
                let total_occupied = group_setting.total_occupied();
                let mut station_no = 1;
                let devices = group_setting
                    .slave_devices
                    .iter()
                    .enumerate()
                    .map(|(device_index, device_setting)| {
                        let device = DeviceData::new(device_index as u16, station_no);
                        station_no += device_setting.num_occupied_stations;
                        device
                    })
                    .collect();
                GroupData {
                    group_index: group_index as u16,
                    group_state: GroupState::MasterDown,
                    frame_sequence_no: 0,
                    cyclic_transmission_state: 0,
                    total_occupied,
                    devices,
                    image: ProcessImage::new(total_occupied),
                    send_buffer: vec![0; frame::cyclic_request_size(total_occupied)],
                    arbitration_timer: Timer::new(),
                    linkscan_timer: Timer::new(),
                    constant_linkscan_timer: Timer::new(),
                    linkscan_start_time: 0,
                }
            })
            .collect();

        log::debug!(
            "Open CCIEFB socket on {}:{}",
            ctx.cfg.master_ip,
            types::CCIEFB_PORT
        );
        self.socket = Some(ctx.platform.udp_open(ctx.cfg.master_ip, types::CCIEFB_PORT)?);

        if ctx.cfg.use_separate_arbitration_socket {
            log::debug!(
                "Open CCIEFB arbitration socket on {}:{}",
                broadcast_ip,
                types::CCIEFB_PORT
            );
            match ctx.platform.udp_open(broadcast_ip, types::CCIEFB_PORT) {
                Ok(socket) => self.arbitration_socket = Some(socket),
                Err(err) => {
                    self.exit(ctx.platform);
                    return Err(err.into());
                }
            }
        }

        for group_index in 0..self.groups.len() {
            self.group_event(ctx, group_index, GroupEvent::Startup);
        }
        Ok(())
    }

    pub fn exit<P: Platform>(&mut self, platform: &mut P) {
        if let Some(socket) = self.socket.take() {
            platform.udp_close(socket);
        }
        if let Some(socket) = self.arbitration_socket.take() {
            platform.udp_close(socket);
        }
        self.broadcast_ip = Ipv4Addr::UNSPECIFIED;
    }

    /// Start arbitration in every group.
    pub fn apply_new_config<P: Platform>(&mut self, ctx: &mut Ctx<P>) {
        for group_index in 0..self.groups.len() {
            self.group_event(ctx, group_index, GroupEvent::NewConfig);
        }
    }

    pub fn set_master_application_status(&mut self, running: bool, stopped_by_user: bool) {
        self.app_running = running;
        self.app_stopped_by_user = stopped_by_user;
    }

    pub fn master_application_status(&self, cfg: &Config) -> u16 {
        types::master_local_unit_info(cfg.protocol_ver, self.app_running, self.app_stopped_by_user)
    }

    /// Enable or disable cyclic communication with one device.
    ///
    /// Enabling an already enabled device is a no-op. After a re-enable the
    /// next request carries transmission bit 0 and the connect indication
    /// fires on the next actual response.
    pub fn set_slave_communication_status(
        &mut self,
        group_index: usize,
        device_index: usize,
        enabled: bool,
    ) {
        let device = &mut self.groups[group_index].devices[device_index];
        if device.enabled == enabled {
            return;
        }
        device.enabled = enabled;
        if enabled {
            device.latest_frame.has_been_received = false;
        }
        log::debug!(
            "Slave device index {} in group index {} is now {}",
            device_index,
            group_index,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn force_cyclic_transmission_bit(
        &mut self,
        group_index: usize,
        device_index: usize,
        force: bool,
    ) {
        self.groups[group_index].devices[device_index].force_transmission_bit = force;
    }

    pub fn statistics_clear_all(&mut self) {
        for group in &mut self.groups {
            for device in &mut group.devices {
                device.statistics.clear();
            }
        }
    }

    fn set_master_state(&mut self, callbacks: &mut dyn MasterCallbacks, new_state: MasterState) {
        if self.master_state != new_state {
            log::debug!(
                "Master state changed from {:?} to {:?}",
                self.master_state,
                new_state
            );
            self.master_state = new_state;
            callbacks.state_ind(new_state);
        }
    }

    fn send_device_event_to_all<P: Platform>(
        &mut self,
        ctx: &mut Ctx<P>,
        group_index: usize,
        event: DeviceEvent,
    ) {
        let group_setting = &ctx.cfg.groups[group_index];
        let group = &mut self.groups[group_index];
        let group_no = group.group_index;
        for (device_index, device) in group.devices.iter_mut().enumerate() {
            device_event(
                ctx.callbacks,
                group_no,
                &group_setting.slave_devices[device_index],
                group_setting.parallel_off_timeout_count,
                device,
                event,
            );
        }
    }

    /// Run one event through the group state machine.
    pub(crate) fn group_event<P: Platform>(
        &mut self,
        ctx: &mut Ctx<P>,
        group_index: usize,
        event: GroupEvent,
    ) {
        use GroupEvent::*;
        use GroupState::*;

        let state = self.groups[group_index].group_state;
        match (state, event) {
            (MasterDown, Startup) => {
                self.groups[group_index].group_state = MasterListen;
                let group_setting = &ctx.cfg.groups[group_index];
                let group = &mut self.groups[group_index];
                let group_no = group.group_index;
                for (device_index, device) in group.devices.iter_mut().enumerate() {
                    if group_setting.slave_devices[device_index].reserved_slave_device {
                        // Reserved devices occupy their stations but are
                        // never polled.
                        device.timeout_count = 0;
                        device.statistics.clear();
                        device.device_state = DeviceState::CyclicSuspend;
                    } else {
                        device_event(
                            ctx.callbacks,
                            group_no,
                            &group_setting.slave_devices[device_index],
                            group_setting.parallel_off_timeout_count,
                            device,
                            DeviceEvent::GroupStartup,
                        );
                    }
                }
                self.set_master_state(ctx.callbacks, MasterState::Standby);
            }
            (MasterListen, NewConfig) => {
                self.groups[group_index].group_state = MasterArbitration;
                self.groups[group_index]
                    .arbitration_timer
                    .start(ctx.now, u32::from(ctx.cfg.arbitration_time_ms) * 1000);
                log::debug!(
                    "Group index {} starts arbitration ({} ms)",
                    group_index,
                    ctx.cfg.arbitration_time_ms
                );
                self.set_master_state(ctx.callbacks, MasterState::Arbitration);
            }
            (MasterArbitration, ReqFromOther) | (MasterArbitration, ParameterChange) => {
                self.groups[group_index].group_state = MasterListen;
                self.groups[group_index].arbitration_timer.stop();
                self.set_master_state(ctx.callbacks, MasterState::Standby);
            }
            (MasterArbitration, ArbitrationDone) => {
                self.groups[group_index].group_state = MasterLinkScan;
                self.groups[group_index].arbitration_timer.stop();
                log::debug!(
                    "Group index {} finished arbitration, starting link scans",
                    group_index
                );
                self.set_master_state(ctx.callbacks, MasterState::Running);
                self.emit_request(ctx, group_index, true);
            }
            (MasterLinkScan, LinkscanComplete) => {
                let group_no = self.groups[group_index].group_index;
                ctx.callbacks.linkscan_complete_ind(group_no, true);
                if ctx.cfg.groups[group_index].use_constant_link_scan_time {
                    let group = &mut self.groups[group_index];
                    group.group_state = MasterLinkScanComp;
                    group.linkscan_timer.stop();
                    let timeout_us =
                        u32::from(ctx.cfg.groups[group_index].timeout_value_ms) * 1000;
                    let elapsed = ctx.now.wrapping_sub(group.linkscan_start_time);
                    group
                        .constant_linkscan_timer
                        .start(ctx.now, timeout_us.saturating_sub(elapsed));
                } else {
                    self.emit_request(ctx, group_index, false);
                }
            }
            (MasterLinkScan, LinkscanTimeout) => {
                let group_no = self.groups[group_index].group_index;
                ctx.callbacks.linkscan_complete_ind(group_no, false);
                self.emit_request(ctx, group_index, false);
            }
            (MasterLinkScanComp, LinkscanStart) => {
                self.groups[group_index].group_state = MasterLinkScan;
                self.groups[group_index].constant_linkscan_timer.stop();
                self.emit_request(ctx, group_index, false);
            }
            (MasterLinkScan, MasterDuplAlarm)
            | (MasterLinkScanComp, MasterDuplAlarm)
            | (MasterLinkScan, ParameterChange)
            | (MasterLinkScanComp, ParameterChange) => {
                let group = &mut self.groups[group_index];
                group.group_state = MasterListen;
                group.linkscan_timer.stop();
                group.constant_linkscan_timer.stop();
                group.cyclic_transmission_state = 0;
                self.send_device_event_to_all(ctx, group_index, DeviceEvent::GroupStandby);
                self.set_master_state(ctx.callbacks, MasterState::Standby);
            }
            _ => {}
        }
    }

    /// Build and transmit the next request for a group, then start the new
    /// scan in every device.
    fn emit_request<P: Platform>(&mut self, ctx: &mut Ctx<P>, group_index: usize, first: bool) {
        let socket = match self.socket {
            Some(socket) => socket,
            None => return,
        };
        let broadcast_ip = self.broadcast_ip;
        let master_local_unit_info = types::master_local_unit_info(
            ctx.cfg.protocol_ver,
            self.app_running,
            self.app_stopped_by_user,
        );
        let clock_info = ctx.platform.unix_time_ms();
        let parameter_no = self.parameter_no;

        let group_setting = &ctx.cfg.groups[group_index];
        let group = &mut self.groups[group_index];

        if !first {
            group.frame_sequence_no = next_frame_sequence_no(group.frame_sequence_no);
        }

        // Rebuild the slave ID table and the transmission bitmap. Only the
        // first station of each device carries its IP address; the
        // remaining stations of multi-station devices read as unoccupied.
        // The first scan is a pure probe: its bitmap stays 0 even for
        // forced bits.
        let mut slave_ids =
            [frame::SLAVE_ID_NOT_OCCUPIED; types::MAX_OCCUPIED_STATIONS_PER_GROUP as usize];
        let mut bitmap: u16 = 0;
        for (device_index, device) in group.devices.iter_mut().enumerate() {
            let setting = &group_setting.slave_devices[device_index];
            let participating = device.enabled && !setting.reserved_slave_device;
            let first_station = usize::from(device.slave_station_no - 1);
            slave_ids[first_station] = if participating {
                u32::from(setting.slave_id)
            } else {
                frame::SLAVE_ID_DISABLED
            };
            device.transmission_bit = !first
                && ((participating && device.latest_frame.has_been_received)
                    || device.force_transmission_bit);
            if device.transmission_bit {
                for station in 0..usize::from(setting.num_occupied_stations) {
                    bitmap |= 1 << (first_station + station);
                }
            }
            if participating {
                device.statistics.number_of_sent_frames += 1;
            }
        }
        group.cyclic_transmission_state = bitmap;

        let request = frame::CyclicRequest {
            protocol_ver: ctx.cfg.protocol_ver,
            master_local_unit_info,
            clock_info,
            master_ip: ctx.cfg.master_ip,
            group_no: (group.group_index + 1) as u8,
            frame_sequence_no: group.frame_sequence_no,
            timeout_value: group_setting.timeout_value_ms,
            parallel_off_timeout_count: group_setting.parallel_off_timeout_count,
            parameter_no,
            cyclic_transmission_state: bitmap,
            slave_ids: &slave_ids[..usize::from(group.total_occupied)],
            rww: &group.image.rww,
            ry: &group.image.ry,
        };
        let size = frame::encode_cyclic_request(&request, &mut group.send_buffer);

        log::debug!(
            "Group index {} sends request with sequence {} (bitmap 0x{:04X})",
            group_index,
            group.frame_sequence_no,
            bitmap
        );
        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "Request frame:\n{}",
                crate::util::buffer_to_string(&group.send_buffer[..size])
            );
        }
        if let Err(err) = ctx.platform.udp_send_to(
            socket,
            broadcast_ip,
            types::CCIEFB_PORT,
            &group.send_buffer[..size],
        ) {
            // Transient send failures do not change any state; the next
            // scan retries after the timeout.
            log::warn!("Could not send cyclic request: {}", err);
        }

        group.linkscan_start_time = ctx.now;
        group
            .linkscan_timer
            .start(ctx.now, u32::from(group_setting.timeout_value_ms) * 1000);

        let group_no = self.groups[group_index].group_index;
        let parallel_off_timeout_count = group_setting.parallel_off_timeout_count;
        for device_index in 0..self.groups[group_index].devices.len() {
            let setting = &ctx.cfg.groups[group_index].slave_devices[device_index];
            let device = &mut self.groups[group_index].devices[device_index];
            let event = if device.enabled && !setting.reserved_slave_device {
                DeviceEvent::ScanStartDeviceStart
            } else {
                DeviceEvent::ScanStartDeviceStop
            };
            device_event(
                ctx.callbacks,
                group_no,
                setting,
                parallel_off_timeout_count,
                device,
                event,
            );
        }
    }

    /// Drain both sockets and run the group timers.
    pub fn periodic<P: Platform>(&mut self, ctx: &mut Ctx<P>) {
        if let Some(socket) = self.socket {
            self.drain_socket(ctx, socket);
        }
        if let Some(socket) = self.arbitration_socket {
            self.drain_socket(ctx, socket);
        }
        self.monitor_group_timers(ctx);
    }

    fn drain_socket<P: Platform>(&mut self, ctx: &mut Ctx<P>, socket: UdpHandle) {
        let mut buffer = [0_u8; RECV_BUFFER_SIZE];
        loop {
            let (size, source_ip) = match ctx.platform.udp_recv_from(socket, &mut buffer) {
                Ok(Some((size, source_ip, _source_port))) => (size, source_ip),
                Ok(None) => break,
                Err(err) => {
                    log::warn!("CCIEFB receive failed: {}", err);
                    break;
                }
            };
            self.handle_input_frame(ctx, &buffer[..size], source_ip);
        }
    }

    fn handle_input_frame<P: Platform>(
        &mut self,
        ctx: &mut Ctx<P>,
        buffer: &[u8],
        source_ip: Ipv4Addr,
    ) {
        if source_ip == ctx.cfg.master_ip {
            // Our own broadcast, looped back.
            return;
        }
        if frame::is_cyclic_response(buffer) {
            self.handle_cyclic_response(ctx, buffer, source_ip);
        } else if frame::is_cyclic_request(buffer) {
            self.handle_cyclic_request(ctx, buffer, source_ip);
        } else {
            log::debug!("Dropping non-CCIEFB frame from {}", source_ip);
            self.count_invalid_frame(ctx.cfg, source_ip);
        }
    }

    /// A cyclic request seen on the broadcast: another master is active.
    fn handle_cyclic_request<P: Platform>(
        &mut self,
        ctx: &mut Ctx<P>,
        buffer: &[u8],
        source_ip: Ipv4Addr,
    ) {
        let request = match frame::parse_cyclic_request(buffer) {
            Ok(request) => request,
            Err(err) => {
                log::debug!("Invalid cyclic request from {}: {}", source_ip, err);
                return;
            }
        };

        let arbitrating: Vec<usize> = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, group)| group.group_state == GroupState::MasterArbitration)
            .map(|(group_index, _)| group_index)
            .collect();
        if arbitrating.is_empty() {
            // Already running (or in standby): this master is
            // authoritative and the frame is ignored.
            log::debug!(
                "Ignoring cyclic request from other master {} (group {})",
                request.master_ip,
                request.group_no
            );
            return;
        }

        log::warn!(
            "Detected another master {} during arbitration",
            request.master_ip
        );
        self.latest_conflicting_master_ip = Some(request.master_ip);
        ctx.callbacks.error_ind(
            ErrorKind::ArbitrationFailed,
            request.master_ip,
            u16::from(request.group_no),
        );
        for group_index in arbitrating {
            self.group_event(ctx, group_index, GroupEvent::ReqFromOther);
        }
    }

    fn count_invalid_frame(&mut self, cfg: &Config, source_ip: Ipv4Addr) {
        if let Some((group_index, device_index)) = find_device_by_ip(cfg, source_ip) {
            self.groups[group_index].devices[device_index]
                .statistics
                .number_of_incoming_invalid_frames += 1;
        }
    }

    fn handle_cyclic_response<P: Platform>(
        &mut self,
        ctx: &mut Ctx<P>,
        buffer: &[u8],
        source_ip: Ipv4Addr,
    ) {
        let header = match frame::parse_cyclic_response(buffer) {
            Ok(header) => header,
            Err(err) => {
                log::debug!("Invalid cyclic response from {}: {}", source_ip, err);
                self.count_invalid_frame(ctx.cfg, source_ip);
                return;
            }
        };

        let group_index = match usize::from(header.group_no).checked_sub(1) {
            Some(group_index) if group_index < self.groups.len() => group_index,
            _ => {
                log::debug!(
                    "Cyclic response from {} for unknown group {}",
                    source_ip,
                    header.group_no
                );
                self.count_invalid_frame(ctx.cfg, source_ip);
                return;
            }
        };
        let group_setting = &ctx.cfg.groups[group_index];
        let device_index = match group_setting
            .slave_devices
            .iter()
            .position(|setting| setting.slave_id == source_ip)
        {
            Some(device_index) => device_index,
            None => {
                log::debug!(
                    "Cyclic response from {} which is not in group {}",
                    source_ip,
                    header.group_no
                );
                return;
            }
        };
        let setting = &group_setting.slave_devices[device_index];
        let parallel_off_timeout_count = group_setting.parallel_off_timeout_count;
        let max_statistics_samples = ctx.cfg.max_statistics_samples;

        let group_sequence_no = self.groups[group_index].frame_sequence_no;
        let scan_start_time = self.groups[group_index].linkscan_start_time;
        let group_no = self.groups[group_index].group_index;

        let mut master_duplication = false;
        {
            let GroupData {
                devices, image, ..
            } = &mut self.groups[group_index];
            let device = &mut devices[device_index];

            device.statistics.number_of_incoming_frames += 1;

            if header.slave_id != source_ip {
                log::debug!(
                    "Cyclic response from {} carries wrong slave ID {}",
                    source_ip,
                    header.slave_id
                );
                device.statistics.number_of_incoming_invalid_frames += 1;
                return;
            }

            if device.latest_frame.has_been_received
                && header.frame_sequence_no == device.latest_frame.frame_sequence_no
            {
                log::warn!(
                    "Duplicate frame sequence number {} from slave {}",
                    header.frame_sequence_no,
                    source_ip
                );
                if !device.duplication_error_reported {
                    device.duplication_error_reported = true;
                    ctx.callbacks.error_ind(
                        ErrorKind::SlaveDuplication,
                        source_ip,
                        header.frame_sequence_no,
                    );
                }
                device_event(
                    ctx.callbacks,
                    group_no,
                    setting,
                    parallel_off_timeout_count,
                    device,
                    DeviceEvent::SlaveDuplication,
                );
                return;
            }

            if header.frame_sequence_no != group_sequence_no {
                log::debug!(
                    "Stale cyclic response from {} (sequence {} but current is {})",
                    source_ip,
                    header.frame_sequence_no,
                    group_sequence_no
                );
                device.statistics.number_of_incoming_invalid_frames += 1;
                return;
            }

            let response_time = ctx.now.wrapping_sub(scan_start_time);

            match CyclicEndCode::from_u16(header.end_code) {
                Some(CyclicEndCode::Success) => {
                    if header.num_occupied_stations != setting.num_occupied_stations {
                        log::debug!(
                            "Cyclic response from {} with {} stations, {} configured",
                            source_ip,
                            header.num_occupied_stations,
                            setting.num_occupied_stations
                        );
                        device.statistics.number_of_incoming_invalid_frames += 1;
                        return;
                    }

                    if device.latest_frame.has_been_received
                        && (device.latest_frame.slave_err_code != header.slave_err_code
                            || device.latest_frame.local_management_info
                                != header.local_management_info)
                    {
                        ctx.callbacks.changed_slave_info_ind(
                            group_no,
                            device.device_index,
                            header.end_code,
                            header.slave_err_code,
                            header.local_management_info,
                        );
                    }

                    device
                        .statistics
                        .measured_time
                        .update(response_time, max_statistics_samples);
                    device.latest_frame = LatestFrame {
                        has_been_received: true,
                        protocol_ver: header.protocol_ver,
                        end_code: header.end_code,
                        vendor_code: header.vendor_code,
                        model_code: header.model_code,
                        equipment_ver: header.equipment_ver,
                        slave_local_unit_info: header.slave_local_unit_info,
                        slave_err_code: header.slave_err_code,
                        local_management_info: header.local_management_info,
                        slave_id: header.slave_id,
                        group_no: header.group_no,
                        num_occupied_stations: header.num_occupied_stations,
                        frame_sequence_no: header.frame_sequence_no,
                        response_time_us: response_time,
                    };
                    device.duplication_error_reported = false;

                    let first_station = usize::from(device.slave_station_no - 1);
                    for station in 0..header.num_occupied_stations {
                        let target = first_station + usize::from(station);
                        image.rwr[target] =
                            frame::decode_word_area(frame::response_rwr_bytes(buffer, station));
                        image.rx[target].0.copy_from_slice(frame::response_rx_bytes(
                            buffer,
                            header.num_occupied_stations,
                            station,
                        ));
                    }

                    device_event(
                        ctx.callbacks,
                        group_no,
                        setting,
                        parallel_off_timeout_count,
                        device,
                        DeviceEvent::ReceiveOk,
                    );
                }
                Some(CyclicEndCode::WrongNumberOccupiedStations) => {
                    log::warn!(
                        "Slave {} disagrees with the configured number of occupied stations",
                        source_ip
                    );
                    ctx.callbacks.error_ind(
                        ErrorKind::SlaveReportsWrongNumberOccupied,
                        source_ip,
                        header.end_code,
                    );
                    device_event(
                        ctx.callbacks,
                        group_no,
                        setting,
                        parallel_off_timeout_count,
                        device,
                        DeviceEvent::ReceiveError,
                    );
                }
                Some(CyclicEndCode::MasterDuplication) => {
                    log::warn!("Slave {} reports another active master", source_ip);
                    ctx.callbacks.error_ind(
                        ErrorKind::SlaveReportsMasterDuplication,
                        source_ip,
                        header.end_code,
                    );
                    master_duplication = true;
                }
                Some(CyclicEndCode::SlaveError) | Some(CyclicEndCode::SlaveRequestsDisconnect) => {
                    log::warn!(
                        "Alarm end code 0x{:04X} from slave {}",
                        header.end_code,
                        source_ip
                    );
                    device.statistics.number_of_incoming_alarm_frames += 1;
                    ctx.callbacks.alarm_ind(
                        group_no,
                        device.device_index,
                        header.end_code,
                        header.slave_err_code,
                        header.local_management_info,
                    );
                    device_event(
                        ctx.callbacks,
                        group_no,
                        setting,
                        parallel_off_timeout_count,
                        device,
                        DeviceEvent::ReceiveError,
                    );
                }
                None => {
                    log::warn!(
                        "Unknown end code 0x{:04X} from slave {}",
                        header.end_code,
                        source_ip
                    );
                    device.statistics.number_of_incoming_alarm_frames += 1;
                }
            }
        }

        if master_duplication {
            self.group_event(ctx, group_index, GroupEvent::MasterDuplAlarm);
            return;
        }

        if self.groups[group_index].group_state == GroupState::MasterLinkScan
            && have_received_from_all_devices(&self.groups[group_index])
        {
            self.link_scan_complete(ctx, group_index);
        }
    }

    fn link_scan_complete<P: Platform>(&mut self, ctx: &mut Ctx<P>, group_index: usize) {
        log::debug!("Group index {} received from all devices", group_index);
        self.send_device_event_to_all(ctx, group_index, DeviceEvent::GroupAllResponded);
        self.group_event(ctx, group_index, GroupEvent::LinkscanComplete);
    }

    fn monitor_group_timers<P: Platform>(&mut self, ctx: &mut Ctx<P>) {
        for group_index in 0..self.groups.len() {
            match self.groups[group_index].group_state {
                GroupState::MasterArbitration => {
                    if self.groups[group_index].arbitration_timer.is_expired(ctx.now) {
                        self.groups[group_index].arbitration_timer.stop();
                        self.group_event(ctx, group_index, GroupEvent::ArbitrationDone);
                    }
                }
                GroupState::MasterLinkScan => {
                    if self.groups[group_index].linkscan_timer.is_expired(ctx.now) {
                        self.groups[group_index].linkscan_timer.stop();
                        log::debug!("Group index {} link scan timed out", group_index);
                        self.handle_link_scan_timeout(ctx, group_index);
                    }
                }
                GroupState::MasterLinkScanComp => {
                    if self.groups[group_index]
                        .constant_linkscan_timer
                        .is_expired(ctx.now)
                    {
                        self.groups[group_index].constant_linkscan_timer.stop();
                        self.group_event(ctx, group_index, GroupEvent::LinkscanStart);
                    }
                }
                _ => {}
            }
        }
    }

    fn handle_link_scan_timeout<P: Platform>(&mut self, ctx: &mut Ctx<P>, group_index: usize) {
        // Every device sees the end of the scan; the state machine decides
        // what it means (a missed deadline for WAIT_TD and CYCLIC_SENDING,
        // the release point for CYCLIC_SUSPEND, nothing for the rest).
        self.send_device_event_to_all(ctx, group_index, DeviceEvent::GroupTimeout);
        self.group_event(ctx, group_index, GroupEvent::LinkscanTimeout);
    }
}

fn find_device_by_ip(cfg: &Config, ip_addr: Ipv4Addr) -> Option<(usize, usize)> {
    for (group_index, group) in cfg.groups.iter().enumerate() {
        for (device_index, device) in group.slave_devices.iter().enumerate() {
            if device.slave_id == ip_addr {
                return Some((group_index, device_index));
            }
        }
    }
    None
}
