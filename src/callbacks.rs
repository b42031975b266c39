//! Application callbacks.
//!
//! All hooks are optional and default to no-ops; the application implements
//! the trait on one receiver object and hands it to `Master::init`.
//! Callbacks are invoked synchronously from within `Master::periodic` (and,
//! for state changes, from `Master::init`). A callback must not call back
//! into the master other than through idempotent getters.

use crate::error::ErrorKind;
use crate::slmp::NodeSearchDb;
use crate::types::MasterState;
use std::net::Ipv4Addr;

/// Outcome of a set IP address request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetIpStatus {
    Success,
    /// No response arrived before the configured callback time.
    Timeout,
    ErrorResponse,
}

#[allow(unused_variables)]
pub trait MasterCallbacks {
    /// The simplified master state changed.
    fn state_ind(&mut self, state: MasterState) {}

    /// A slave device started cyclic communication.
    fn connect_ind(&mut self, group_index: u16, device_index: u16, slave_id: Ipv4Addr) {}

    /// A slave device stopped cyclic communication.
    fn disconnect_ind(&mut self, group_index: u16, device_index: u16, slave_id: Ipv4Addr) {}

    /// A link scan finished. `success` is false when the scan ended by
    /// timeout.
    fn linkscan_complete_ind(&mut self, group_index: u16, success: bool) {}

    /// A slave reported an alarm end code.
    fn alarm_ind(
        &mut self,
        group_index: u16,
        device_index: u16,
        end_code: u16,
        slave_err_code: u16,
        local_management_info: u32,
    ) {}

    /// The error code or local management info reported by a slave changed.
    fn changed_slave_info_ind(
        &mut self,
        group_index: u16,
        device_index: u16,
        end_code: u16,
        slave_err_code: u16,
        local_management_info: u32,
    ) {}

    /// The stack detected an error condition. The meaning of `ip_addr` and
    /// `argument_2` depends on the kind, see [`ErrorKind`].
    fn error_ind(&mut self, kind: ErrorKind, ip_addr: Ipv4Addr, argument_2: u16) {}

    /// A node search finished; the database holds the collected responses.
    fn node_search_result_cfm(&mut self, db: &NodeSearchDb) {}

    /// A set IP address request finished.
    fn set_ip_cfm(&mut self, status: SetIpStatus) {}
}

/// Callbacks implementation that ignores every indication.
pub struct NoCallbacks;

impl MasterCallbacks for NoCallbacks {}
