//! CC-Link IE Field Basic (CCIEFB) master stack.
//!
//! The master drives one periodic link scan per configured group of slave
//! devices: it broadcasts a cyclic request, collects the unicast responses,
//! surfaces the process image (bit and word registers) to the application
//! and tracks per-group and per-device connection state. An SLMP engine
//! performs out-of-band node discovery and slave IP assignment.
//!
//! The core is single threaded and cooperative: all forward progress
//! happens inside [`Master::periodic`], which the application calls at a
//! cadence short relative to the smallest configured timeout (typically
//! every millisecond). Timestamps are monotonic microseconds in a wrapping
//! `u32`.
//!
//! ```no_run
//! use cclink_master::{
//!     Config, GroupSetting, Master, NetworkSettings, NoCallbacks, OsPlatform,
//!     SlaveDeviceSetting,
//! };
//! use std::net::Ipv4Addr;
//!
//! let mut config = Config::new(Ipv4Addr::new(192, 168, 0, 250));
//! config.groups = vec![GroupSetting {
//!     slave_devices: vec![SlaveDeviceSetting::new(Ipv4Addr::new(192, 168, 0, 201), 1)],
//!     ..GroupSetting::default()
//! }];
//!
//! let platform = OsPlatform::new(NetworkSettings {
//!     ifindex: 2,
//!     netmask: Ipv4Addr::new(255, 255, 255, 0),
//!     mac_address: [0x1C, 0x39, 0x47, 0xCD, 0xD4, 0xEB],
//!     ifname: "eth0".to_string(),
//! });
//!
//! let mut master = Master::init(config, platform, Box::new(NoCallbacks), 0).unwrap();
//! loop {
//!     master.periodic(now_microseconds());
//!     master.set_rww_value(0, 0, 2, 0x8765).unwrap();
//! }
//! # fn now_microseconds() -> u32 { 0 }
//! ```

mod callbacks;
mod config;
mod error;
mod file;
pub mod frame;
mod iefb;
pub mod image;
mod platform;
mod slmp;
pub mod slmp_frame;
mod stats;
mod timer;
pub mod types;
pub mod util;

pub use self::{
    callbacks::{MasterCallbacks, NoCallbacks, SetIpStatus},
    config::{Config, GroupSetting, SlaveDeviceSetting},
    error::{Error, ErrorKind},
    iefb::{DeviceData, LatestFrame},
    image::{BitArea, WordArea},
    platform::{NetworkSettings, OsPlatform, Platform, UdpHandle},
    slmp::{NodeSearchDb, NodeSearchEntry},
    stats::{ResponseTimeStats, Statistics},
    types::{
        DeviceState, GroupState, GroupStatusDetails, MacAddr, MasterState, MasterStatusDetails,
    },
};

use crate::iefb::Iefb;
use crate::slmp::Slmp;
use std::net::Ipv4Addr;

type Result<T> = std::result::Result<T, Error>;

/// Saturating parameter number increment: every successful re-init yields a
/// new value until the counter saturates at 0xFFFF.
fn next_parameter_no(parameter_no: u16) -> u16 {
    parameter_no.saturating_add(1)
}

/// A CCIEFB master stack instance.
///
/// Several instances may coexist in one process as long as each binds to a
/// different master IP address and uses its own parameter file directory.
pub struct Master<P: Platform> {
    cfg: Config,
    platform: P,
    callbacks: Box<dyn MasterCallbacks>,
    network: NetworkSettings,
    iefb_broadcast_ip: Ipv4Addr,
    slmp_broadcast_ip: Ipv4Addr,
    iefb: Iefb,
    slmp: Slmp,
    last_tick: u32,
}

impl<P: Platform> Master<P> {
    /// Initialise the master stack.
    ///
    /// Validates the configuration, loads the persisted parameter number,
    /// resolves the network interface, opens the CCIEFB and SLMP sockets
    /// and starts arbitration in every group. `now` is the current
    /// monotonic timestamp in microseconds.
    pub fn init(
        cfg: Config,
        mut platform: P,
        callbacks: Box<dyn MasterCallbacks>,
        now: u32,
    ) -> Result<Self> {
        log::debug!("Initialising CCIEFB master stack {}", types::VERSION);

        cfg.validate()?;
        if log::log_enabled!(log::Level::Debug) {
            cfg.show();
        }

        let file_directory = cfg.file_directory.clone();
        let parameter_no = match file::load_parameter_no(file_directory.as_deref()) {
            Some(parameter_no) => {
                log::debug!("Did read parameter number {} from file", parameter_no);
                parameter_no
            }
            None => {
                log::info!("Could not read parameter number from file. Using default 0.");
                0
            }
        };

        let network = platform.network_settings(cfg.master_ip).map_err(|err| {
            log::error!(
                "Could not resolve interface settings for {}: {}",
                cfg.master_ip,
                err
            );
            Error::Iface
        })?;
        if !util::is_netmask_valid(network.netmask) {
            log::error!("Invalid netmask {} for {}", network.netmask, cfg.master_ip);
            return Err(Error::Iface);
        }
        let iefb_broadcast_ip = util::broadcast_address(network.netmask, cfg.master_ip);
        let slmp_broadcast_ip = if cfg.use_slmp_directed_broadcast {
            iefb_broadcast_ip
        } else {
            Ipv4Addr::BROADCAST
        };
        log::debug!(
            "Interface {} (MAC {}), CCIEFB broadcast {}, SLMP broadcast {}",
            network.ifname,
            util::mac_to_string(&network.mac_address),
            iefb_broadcast_ip,
            slmp_broadcast_ip
        );

        cfg.validate_duplicates()?;

        let mut master = Self {
            cfg,
            platform,
            callbacks,
            network,
            iefb_broadcast_ip,
            slmp_broadcast_ip,
            iefb: Iefb::new(),
            slmp: Slmp::new(),
            last_tick: now,
        };
        master.iefb.parameter_no = parameter_no;

        {
            let (iefb, mut ctx) = master.iefb_parts(now);
            iefb.init(&mut ctx, iefb_broadcast_ip)?;
        }

        if let Err(err) = master.slmp.init(&mut master.platform) {
            master.iefb.exit(&mut master.platform);
            return Err(err);
        }

        let parameter_no = next_parameter_no(parameter_no);
        master.iefb.parameter_no = parameter_no;
        match file::save_parameter_no_if_modified(file_directory.as_deref(), parameter_no) {
            Ok(true) => log::debug!("Persisted parameter number {}", parameter_no),
            Ok(false) => {}
            Err(err) => log::warn!("Could not persist parameter number: {}", err),
        }

        let (iefb, mut ctx) = master.iefb_parts(now);
        iefb.apply_new_config(&mut ctx);

        Ok(master)
    }

    /// Shut down the stack and release its sockets. The parameter file is
    /// left untouched.
    pub fn exit(mut self) {
        log::debug!("Exiting CCIEFB master stack");
        self.slmp.exit(&mut self.platform);
        self.iefb.exit(&mut self.platform);
    }

    fn iefb_parts(&mut self, now: u32) -> (&mut Iefb, iefb::Ctx<'_, P>) {
        (
            &mut self.iefb,
            iefb::Ctx {
                cfg: &self.cfg,
                platform: &mut self.platform,
                callbacks: self.callbacks.as_mut(),
                now,
            },
        )
    }

    /// Drive the stack. Call this every tick with the current monotonic
    /// timestamp in microseconds.
    ///
    /// SLMP processing runs before CCIEFB processing; callbacks fire
    /// synchronously from within this call.
    pub fn periodic(&mut self, now: u32) {
        self.last_tick = now;
        self.slmp
            .periodic(&mut self.platform, self.callbacks.as_mut(), now);
        let (iefb, mut ctx) = self.iefb_parts(now);
        iefb.periodic(&mut ctx);
    }

    /// Set the application status carried in every cyclic request.
    ///
    /// `stopped_by_user` only has an effect when `running` is false and for
    /// protocol version 2 or later.
    pub fn set_master_application_status(&mut self, running: bool, stopped_by_user: bool) {
        self.iefb
            .set_master_application_status(running, stopped_by_user);
    }

    /// Read back the master application status word.
    pub fn master_application_status(&self) -> u16 {
        self.iefb.master_application_status(&self.cfg)
    }

    fn check_indices(&self, group_index: u16, device_index: u16) -> Result<(usize, usize)> {
        let group_index = usize::from(group_index);
        let group = self.cfg.groups.get(group_index).ok_or(Error::GroupIndex)?;
        let device_index = usize::from(device_index);
        if device_index >= group.slave_devices.len() {
            return Err(Error::DeviceIndex);
        }
        Ok((group_index, device_index))
    }

    /// Enable or disable cyclic communication with one slave device.
    ///
    /// Takes effect at the start of the next link scan. Enabling an already
    /// enabled device is a no-op.
    pub fn set_slave_communication_status(
        &mut self,
        group_index: u16,
        device_index: u16,
        enabled: bool,
    ) -> Result<()> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        self.iefb
            .set_slave_communication_status(group_index, device_index, enabled);
        Ok(())
    }

    /// Force the cyclic transmission bit for one slave device, independent
    /// of its enabled state.
    pub fn force_cyclic_transmission_bit(
        &mut self,
        group_index: u16,
        device_index: u16,
        force: bool,
    ) -> Result<()> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        self.iefb
            .force_cyclic_transmission_bit(group_index, device_index, force);
        Ok(())
    }

    /// Clear the statistics of every slave device.
    pub fn clear_statistics(&mut self) {
        self.iefb.statistics_clear_all();
    }

    /// Master internals, for diagnostics and tests.
    pub fn master_status(&self) -> MasterStatusDetails {
        MasterStatusDetails {
            master_state: self.iefb.master_state,
            parameter_no: self.iefb.parameter_no,
            node_search_serial: self.slmp.node_search_serial(),
            set_ip_request_serial: self.slmp.set_ip_request_serial(),
            latest_conflicting_master_ip: self.iefb.latest_conflicting_master_ip,
        }
    }

    /// Group internals, for diagnostics and tests.
    pub fn group_status(&self, group_index: u16) -> Result<GroupStatusDetails> {
        let group = self
            .iefb
            .groups
            .get(usize::from(group_index))
            .ok_or(Error::GroupIndex)?;
        Ok(GroupStatusDetails {
            group_state: group.group_state,
            total_occupied: group.total_occupied,
            frame_sequence_no: group.frame_sequence_no,
            cyclic_transmission_state: group.cyclic_transmission_state,
        })
    }

    /// Connection details for one slave device.
    pub fn device_connection_details(
        &self,
        group_index: u16,
        device_index: u16,
    ) -> Result<&DeviceData> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        Ok(&self.iefb.groups[group_index].devices[device_index])
    }

    /// Start a node search. The result is delivered via
    /// `node_search_result_cfm` after the configured delay window.
    pub fn perform_node_search(&mut self) -> Result<()> {
        self.slmp.perform_node_search(
            &mut self.platform,
            &self.cfg,
            &self.network.mac_address,
            self.slmp_broadcast_ip,
            self.last_tick,
        )
    }

    /// The node search database collected by the most recent search.
    pub fn node_search_result(&self) -> &NodeSearchDb {
        self.slmp.node_search_db()
    }

    /// Assign a new IP address and netmask to the slave with the given MAC
    /// address. The outcome is delivered via `set_ip_cfm`.
    pub fn set_slave_ipaddr(
        &mut self,
        slave_mac_addr: &MacAddr,
        slave_new_ip_addr: Ipv4Addr,
        slave_new_netmask: Ipv4Addr,
    ) -> Result<()> {
        self.slmp.perform_set_ip_request(
            &mut self.platform,
            &self.cfg,
            &self.network.mac_address,
            self.slmp_broadcast_ip,
            slave_mac_addr,
            slave_new_ip_addr,
            slave_new_netmask,
            self.last_tick,
        )
    }

    fn group(&self, group_index: u16) -> Result<&iefb::GroupData> {
        self.iefb
            .groups
            .get(usize::from(group_index))
            .ok_or(Error::GroupIndex)
    }

    /// All RX areas of a group (input bits from the slaves), indexed by
    /// occupied station.
    pub fn rx_area(&self, group_index: u16) -> Result<&[BitArea]> {
        Ok(&self.group(group_index)?.image.rx)
    }

    /// All RY areas of a group (output bits to the slaves).
    pub fn ry_area(&self, group_index: u16) -> Result<&[BitArea]> {
        Ok(&self.group(group_index)?.image.ry)
    }

    pub fn ry_area_mut(&mut self, group_index: u16) -> Result<&mut [BitArea]> {
        let group_index = usize::from(group_index);
        if group_index >= self.iefb.groups.len() {
            return Err(Error::GroupIndex);
        }
        Ok(&mut self.iefb.groups[group_index].image.ry)
    }

    /// All RWr areas of a group (input registers from the slaves).
    pub fn rwr_area(&self, group_index: u16) -> Result<&[WordArea]> {
        Ok(&self.group(group_index)?.image.rwr)
    }

    /// All RWw areas of a group (output registers to the slaves).
    pub fn rww_area(&self, group_index: u16) -> Result<&[WordArea]> {
        Ok(&self.group(group_index)?.image.rww)
    }

    pub fn rww_area_mut(&mut self, group_index: u16) -> Result<&mut [WordArea]> {
        let group_index = usize::from(group_index);
        if group_index >= self.iefb.groups.len() {
            return Err(Error::GroupIndex);
        }
        Ok(&mut self.iefb.groups[group_index].image.rww)
    }

    fn device_station_range(&self, group_index: usize, device_index: usize) -> (usize, usize) {
        let device = &self.iefb.groups[group_index].devices[device_index];
        let first = usize::from(device.slave_station_no - 1);
        let count =
            usize::from(self.cfg.groups[group_index].slave_devices[device_index].num_occupied_stations);
        (first, first + count)
    }

    /// The RX areas of one device.
    pub fn device_rx_area(&self, group_index: u16, device_index: u16) -> Result<&[BitArea]> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        let (first, end) = self.device_station_range(group_index, device_index);
        Ok(&self.iefb.groups[group_index].image.rx[first..end])
    }

    /// The RY areas of one device.
    pub fn device_ry_area(&self, group_index: u16, device_index: u16) -> Result<&[BitArea]> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        let (first, end) = self.device_station_range(group_index, device_index);
        Ok(&self.iefb.groups[group_index].image.ry[first..end])
    }

    pub fn device_ry_area_mut(
        &mut self,
        group_index: u16,
        device_index: u16,
    ) -> Result<&mut [BitArea]> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        let (first, end) = self.device_station_range(group_index, device_index);
        Ok(&mut self.iefb.groups[group_index].image.ry[first..end])
    }

    /// The RWr areas of one device.
    pub fn device_rwr_area(&self, group_index: u16, device_index: u16) -> Result<&[WordArea]> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        let (first, end) = self.device_station_range(group_index, device_index);
        Ok(&self.iefb.groups[group_index].image.rwr[first..end])
    }

    /// The RWw areas of one device.
    pub fn device_rww_area(&self, group_index: u16, device_index: u16) -> Result<&[WordArea]> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        let (first, end) = self.device_station_range(group_index, device_index);
        Ok(&self.iefb.groups[group_index].image.rww[first..end])
    }

    pub fn device_rww_area_mut(
        &mut self,
        group_index: u16,
        device_index: u16,
    ) -> Result<&mut [WordArea]> {
        let (group_index, device_index) = self.check_indices(group_index, device_index)?;
        let (first, end) = self.device_station_range(group_index, device_index);
        Ok(&mut self.iefb.groups[group_index].image.rww[first..end])
    }

    /// Read an individual input bit from a slave. Use number 0 for RX0.
    pub fn rx_bit(&self, group_index: u16, device_index: u16, number: u16) -> Result<bool> {
        let areas = self.device_rx_area(group_index, device_index)?;
        if usize::from(number) >= areas.len() * usize::from(types::BITS_PER_AREA) {
            return Err(Error::SignalNumber);
        }
        Ok(image::get_bit(areas, number))
    }

    /// Set an individual output bit for a slave. Use number 0 for RY0.
    pub fn set_ry_bit(
        &mut self,
        group_index: u16,
        device_index: u16,
        number: u16,
        value: bool,
    ) -> Result<()> {
        let areas = self.device_ry_area_mut(group_index, device_index)?;
        if usize::from(number) >= areas.len() * usize::from(types::BITS_PER_AREA) {
            return Err(Error::SignalNumber);
        }
        image::set_bit(areas, number, value);
        Ok(())
    }

    /// Read back an individual output bit.
    pub fn ry_bit(&self, group_index: u16, device_index: u16, number: u16) -> Result<bool> {
        let areas = self.device_ry_area(group_index, device_index)?;
        if usize::from(number) >= areas.len() * usize::from(types::BITS_PER_AREA) {
            return Err(Error::SignalNumber);
        }
        Ok(image::get_bit(areas, number))
    }

    /// Read an input register value from a slave. Use number 0 for RWr0.
    pub fn rwr_value(&self, group_index: u16, device_index: u16, number: u16) -> Result<u16> {
        let areas = self.device_rwr_area(group_index, device_index)?;
        if usize::from(number) >= areas.len() * usize::from(types::WORDS_PER_AREA) {
            return Err(Error::SignalNumber);
        }
        Ok(image::get_word(areas, number))
    }

    /// Set an output register value for a slave. Use number 0 for RWw0.
    pub fn set_rww_value(
        &mut self,
        group_index: u16,
        device_index: u16,
        number: u16,
        value: u16,
    ) -> Result<()> {
        let areas = self.device_rww_area_mut(group_index, device_index)?;
        if usize::from(number) >= areas.len() * usize::from(types::WORDS_PER_AREA) {
            return Err(Error::SignalNumber);
        }
        image::set_word(areas, number, value);
        Ok(())
    }

    /// Read back an output register value.
    pub fn rww_value(&self, group_index: u16, device_index: u16, number: u16) -> Result<u16> {
        let areas = self.device_rww_area(group_index, device_index)?;
        if usize::from(number) >= areas.len() * usize::from(types::WORDS_PER_AREA) {
            return Err(Error::SignalNumber);
        }
        Ok(image::get_word(areas, number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_no_increments_and_saturates() {
        assert_eq!(next_parameter_no(0), 1);
        assert_eq!(next_parameter_no(1), 2);
        assert_eq!(next_parameter_no(0xFFFE), 0xFFFF);
        assert_eq!(next_parameter_no(0xFFFF), 0xFFFF);
    }
}
