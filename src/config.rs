//! Master configuration and its validation.

use crate::error::Error;
use crate::types;
use crate::util;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Default arbitration time, in milliseconds.
pub const DEFAULT_ARBITRATION_TIME_MS: u16 = 2500;

/// Default delay before the node search result callback fires, in
/// milliseconds.
pub const DEFAULT_CALLBACK_TIME_NODE_SEARCH_MS: u16 = 2000;

/// Default response timeout for the set IP command, in milliseconds.
pub const DEFAULT_CALLBACK_TIME_SET_IP_MS: u16 = 500;

pub const DEFAULT_TIMEOUT_VALUE_MS: u16 = 500;
pub const DEFAULT_PARALLEL_OFF_TIMEOUT_COUNT: u16 = 3;
pub const DEFAULT_MAX_STATISTICS_SAMPLES: u16 = 1000;

/// Settings for one slave device within a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveDeviceSetting {
    /// Slave IP address. Must be unique across the whole configuration.
    pub slave_id: Ipv4Addr,
    /// Number of occupied stations, 1..=16.
    pub num_occupied_stations: u16,
    /// Reserved devices occupy their stations but are never polled.
    pub reserved_slave_device: bool,
}

impl SlaveDeviceSetting {
    pub fn new(slave_id: Ipv4Addr, num_occupied_stations: u16) -> Self {
        Self {
            slave_id,
            num_occupied_stations,
            reserved_slave_device: false,
        }
    }
}

/// Settings for one group of slave devices sharing a link scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSetting {
    /// Link scan timeout, in milliseconds.
    pub timeout_value_ms: u16,
    /// Number of consecutive timeouts before a device is disconnected.
    pub parallel_off_timeout_count: u16,
    /// When set, every link scan takes exactly `timeout_value_ms`.
    pub use_constant_link_scan_time: bool,
    pub slave_devices: Vec<SlaveDeviceSetting>,
}

impl Default for GroupSetting {
    fn default() -> Self {
        Self {
            timeout_value_ms: DEFAULT_TIMEOUT_VALUE_MS,
            parallel_off_timeout_count: DEFAULT_PARALLEL_OFF_TIMEOUT_COUNT,
            use_constant_link_scan_time: false,
            slave_devices: Vec::new(),
        }
    }
}

impl GroupSetting {
    /// Total number of occupied slave stations in this group.
    pub fn total_occupied(&self) -> u16 {
        self.slave_devices
            .iter()
            .map(|device| device.num_occupied_stations)
            .sum()
    }
}

/// Master stack configuration. Immutable after `Master::init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// CCIEFB protocol version, 1 or 2.
    pub protocol_ver: u16,
    /// IP address the CCIEFB socket binds to.
    pub master_ip: Ipv4Addr,
    /// Directory for the parameter number file. `None` means the current
    /// directory.
    pub file_directory: Option<PathBuf>,
    pub arbitration_time_ms: u16,
    pub callback_time_node_search_ms: u16,
    pub callback_time_set_ip_ms: u16,
    /// Cap on the number of response time samples kept per device.
    pub max_statistics_samples: u16,
    /// Send SLMP broadcasts to the directed broadcast address instead of
    /// 255.255.255.255.
    pub use_slmp_directed_broadcast: bool,
    /// Open a second CCIEFB socket bound to the broadcast address, for
    /// listening to other masters during arbitration.
    pub use_separate_arbitration_socket: bool,
    pub groups: Vec<GroupSetting>,
}

impl Config {
    pub fn new(master_ip: Ipv4Addr) -> Self {
        Self {
            protocol_ver: types::MAX_PROTOCOL_VER,
            master_ip,
            file_directory: None,
            arbitration_time_ms: DEFAULT_ARBITRATION_TIME_MS,
            callback_time_node_search_ms: DEFAULT_CALLBACK_TIME_NODE_SEARCH_MS,
            callback_time_set_ip_ms: DEFAULT_CALLBACK_TIME_SET_IP_MS,
            max_statistics_samples: DEFAULT_MAX_STATISTICS_SAMPLES,
            use_slmp_directed_broadcast: false,
            use_separate_arbitration_socket: false,
            groups: Vec::new(),
        }
    }

    /// Validate everything except slave IP address uniqueness.
    pub fn validate(&self) -> Result<(), Error> {
        if self.protocol_ver < types::MIN_PROTOCOL_VER
            || self.protocol_ver > types::MAX_PROTOCOL_VER
        {
            log::error!(
                "Wrong protocol version in the configuration. Given {} but min is {} and max is {}.",
                self.protocol_ver,
                types::MIN_PROTOCOL_VER,
                types::MAX_PROTOCOL_VER
            );
            return Err(Error::Config);
        }

        if !util::is_ipaddr_range_valid(self.master_ip) {
            log::error!("The master IP address is invalid. Given {}", self.master_ip);
            return Err(Error::Config);
        }

        let number_of_groups = self.groups.len() as u16;
        if number_of_groups < types::MIN_GROUP_NO || number_of_groups > types::MAX_GROUP_NO {
            log::error!(
                "Wrong number of groups in the configuration. Given {} but min is {} and max is {}.",
                number_of_groups,
                types::MIN_GROUP_NO,
                types::MAX_GROUP_NO
            );
            return Err(Error::Config);
        }

        let mut total_occupied_for_all_groups = 0_u16;
        for (group_index, group) in self.groups.iter().enumerate() {
            if group.timeout_value_ms < types::MIN_TIMEOUT_MS {
                log::error!(
                    "Wrong timeout for group {} (index {}). Given {} ms but min is {} ms.",
                    group_index + 1,
                    group_index,
                    group.timeout_value_ms,
                    types::MIN_TIMEOUT_MS
                );
                return Err(Error::Config);
            }

            if group.use_constant_link_scan_time
                && group.timeout_value_ms > types::MAX_TIMEOUT_CONSTANT_LINKSCAN_MS
            {
                log::error!(
                    "Too large constant link scan time in group {} (index {}). Given {} ms but max is {} ms.",
                    group_index + 1,
                    group_index,
                    group.timeout_value_ms,
                    types::MAX_TIMEOUT_CONSTANT_LINKSCAN_MS
                );
                return Err(Error::Config);
            }

            if group.parallel_off_timeout_count < types::MIN_TIMEOUT_COUNT {
                log::error!(
                    "Wrong timeout count setting for group {} (index {}). Given {} but min is {}.",
                    group_index + 1,
                    group_index,
                    group.parallel_off_timeout_count,
                    types::MIN_TIMEOUT_COUNT
                );
                return Err(Error::Config);
            }

            let num_slave_devices = group.slave_devices.len() as u16;
            if num_slave_devices == 0
                || num_slave_devices > types::MAX_OCCUPIED_STATIONS_PER_GROUP
            {
                log::error!(
                    "Wrong number of slave devices for group {} (index {}). Given {} but min is 1 and max is {}.",
                    group_index + 1,
                    group_index,
                    num_slave_devices,
                    types::MAX_OCCUPIED_STATIONS_PER_GROUP
                );
                return Err(Error::Config);
            }

            for (device_index, device) in group.slave_devices.iter().enumerate() {
                if !util::is_ipaddr_range_valid(device.slave_id) {
                    log::error!(
                        "Invalid IP address for group index {} slave index {}. Given {}",
                        group_index,
                        device_index,
                        device.slave_id
                    );
                    return Err(Error::Config);
                }

                if device.slave_id == self.master_ip {
                    log::error!(
                        "The slave IP address for group index {} slave index {} is the same as the master IP address {}.",
                        group_index,
                        device_index,
                        self.master_ip
                    );
                    return Err(Error::Config);
                }

                if device.num_occupied_stations < types::MIN_OCCUPIED_STATIONS_PER_DEVICE
                    || device.num_occupied_stations > types::MAX_OCCUPIED_STATIONS_PER_GROUP
                {
                    log::error!(
                        "Wrong number of occupied slave stations for group index {} slave index {}. Given {} but min is 1 and max is {}.",
                        group_index,
                        device_index,
                        device.num_occupied_stations,
                        types::MAX_OCCUPIED_STATIONS_PER_GROUP
                    );
                    return Err(Error::Config);
                }

                total_occupied_for_all_groups = total_occupied_for_all_groups
                    .saturating_add(device.num_occupied_stations);
            }

            if group.total_occupied() > types::MAX_OCCUPIED_STATIONS_PER_GROUP {
                log::error!(
                    "Too many occupied slave stations in group {} (index {}). Given {} but max is {}.",
                    group_index + 1,
                    group_index,
                    group.total_occupied(),
                    types::MAX_OCCUPIED_STATIONS_PER_GROUP
                );
                return Err(Error::Config);
            }
        }

        if total_occupied_for_all_groups > types::MAX_OCCUPIED_STATIONS_ALL_GROUPS {
            log::error!(
                "Too many occupied slave stations in total. Given {} but max is {}.",
                total_occupied_for_all_groups,
                types::MAX_OCCUPIED_STATIONS_ALL_GROUPS
            );
            return Err(Error::Config);
        }

        Ok(())
    }

    /// Validate that the configuration is free from slave IP address
    /// duplicates.
    ///
    /// The configuration must have passed `validate` before. The scan is
    /// O(n²) but lean on memory, which is fine for at most 64 devices.
    pub fn validate_duplicates(&self) -> Result<(), Error> {
        let all_ids = || {
            self.groups
                .iter()
                .flat_map(|group| group.slave_devices.iter().map(|device| device.slave_id))
        };

        for (position, slave_id) in all_ids().enumerate() {
            if all_ids().skip(position + 1).any(|other| other == slave_id) {
                log::error!("Slave IP address duplicates found in the config: {}", slave_id);
                return Err(Error::DuplicateSlaveId(slave_id));
            }
        }
        Ok(())
    }

    /// Log a summary of the configuration, for debugging.
    pub(crate) fn show(&self) {
        log::debug!("Valid configuration:");
        log::debug!("  Master IP address: {}", self.master_ip);
        log::debug!("  Arbitration time: {} ms", self.arbitration_time_ms);
        log::debug!(
            "  Delay time node search callback: {} ms",
            self.callback_time_node_search_ms
        );
        log::debug!(
            "  Response timeout for set IP command: {} ms",
            self.callback_time_set_ip_ms
        );
        log::debug!("  Protocol version: {}", self.protocol_ver);
        log::debug!("  Max statistics samples: {}", self.max_statistics_samples);
        log::debug!("  Number of groups: {}", self.groups.len());
        for (group_index, group) in self.groups.iter().enumerate() {
            log::debug!("    Group {} (group index {}):", group_index + 1, group_index);
            log::debug!("      Timeout: {} ms", group.timeout_value_ms);
            log::debug!("      Timeout count: {}", group.parallel_off_timeout_count);
            log::debug!(
                "      Constant link scan time: {}",
                if group.use_constant_link_scan_time {
                    "Yes"
                } else {
                    "No"
                }
            );
            log::debug!(
                "      Occupied slave stations in this group: {}",
                group.total_occupied()
            );
            for (device_index, device) in group.slave_devices.iter().enumerate() {
                log::debug!(
                    "        Slave device index: {}  IP: {}  Num occupied: {}",
                    device_index,
                    device.slave_id,
                    device.num_occupied_stations
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        let mut config = Config::new(Ipv4Addr::new(192, 168, 0, 250));
        config.groups = vec![GroupSetting {
            slave_devices: vec![
                SlaveDeviceSetting::new(Ipv4Addr::new(192, 168, 0, 201), 1),
                SlaveDeviceSetting::new(Ipv4Addr::new(192, 168, 0, 202), 2),
            ],
            ..GroupSetting::default()
        }];
        config
    }

    #[test]
    fn accepts_valid_config() {
        let config = sample_config();
        assert!(config.validate().is_ok());
        assert!(config.validate_duplicates().is_ok());
        assert_eq!(config.groups[0].total_occupied(), 3);
    }

    #[test]
    fn rejects_bad_protocol_version() {
        let mut config = sample_config();
        config.protocol_ver = 0;
        assert!(config.validate().is_err());
        config.protocol_ver = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_master_ip() {
        let mut config = sample_config();
        config.master_ip = Ipv4Addr::UNSPECIFIED;
        assert!(config.validate().is_err());
        config.master_ip = Ipv4Addr::new(224, 0, 0, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_groups() {
        let mut config = sample_config();
        config.groups.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_small_timeout() {
        let mut config = sample_config();
        config.groups[0].timeout_value_ms = types::MIN_TIMEOUT_MS - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_large_constant_link_scan_time() {
        let mut config = sample_config();
        config.groups[0].timeout_value_ms = types::MAX_TIMEOUT_CONSTANT_LINKSCAN_MS + 1;
        assert!(config.validate().is_ok());
        config.groups[0].use_constant_link_scan_time = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeout_count() {
        let mut config = sample_config();
        config.groups[0].parallel_off_timeout_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_slave_with_master_ip() {
        let mut config = sample_config();
        config.groups[0].slave_devices[0].slave_id = config.master_ip;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_occupied_station_counts() {
        let mut config = sample_config();
        config.groups[0].slave_devices[0].num_occupied_stations = 0;
        assert!(config.validate().is_err());
        config.groups[0].slave_devices[0].num_occupied_stations = 17;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_many_occupied_in_group() {
        let mut config = sample_config();
        config.groups[0].slave_devices[0].num_occupied_stations = 15;
        // 15 + 2 > 16
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_many_occupied_in_total() {
        let mut config = sample_config();
        config.groups = (0..5)
            .map(|group_no| GroupSetting {
                slave_devices: vec![SlaveDeviceSetting::new(
                    Ipv4Addr::new(192, 168, group_no, 1),
                    14,
                )],
                ..GroupSetting::default()
            })
            .collect();
        // 5 * 14 = 70 > 64
        assert!(config.validate().is_err());
    }

    #[test]
    fn finds_duplicate_slave_ids_across_groups() {
        let mut config = sample_config();
        config.groups.push(GroupSetting {
            slave_devices: vec![SlaveDeviceSetting::new(Ipv4Addr::new(192, 168, 0, 201), 1)],
            ..GroupSetting::default()
        });
        assert!(config.validate().is_ok());
        match config.validate_duplicates() {
            Err(Error::DuplicateSlaveId(ip)) => {
                assert_eq!(ip, Ipv4Addr::new(192, 168, 0, 201))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
