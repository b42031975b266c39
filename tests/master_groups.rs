//! Integration tests for multiple groups, forced transmission bits and
//! timing edge cases.

mod common;

use cclink_master::{
    frame, BitArea, Config, DeviceState, GroupSetting, Master, MasterState, NoCallbacks,
    SlaveDeviceSetting, WordArea,
};
use common::*;
use std::net::Ipv4Addr;

const SLAVE_IP_G2: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 203);

fn two_group_config() -> Config {
    let mut config = Config::new(MASTER_IP);
    config.groups = vec![
        GroupSetting {
            slave_devices: vec![SlaveDeviceSetting::new(SLAVE_IP_0, 1)],
            ..GroupSetting::default()
        },
        GroupSetting {
            slave_devices: vec![SlaveDeviceSetting::new(SLAVE_IP_G2, 2)],
            ..GroupSetting::default()
        },
    ];
    config
}

fn sent_requests(fixture: &Fixture) -> Vec<frame::ParsedCyclicRequest> {
    fixture
        .net
        .sent(CCIEFB_SOCKET)
        .iter()
        .map(|(_, _, data)| frame::parse_cyclic_request(data).expect("request"))
        .collect()
}

#[test]
fn groups_scan_independently() {
    let mut fixture = start_master(two_group_config());
    fixture.run_until_running();

    // One request per group, in configuration order.
    let requests = sent_requests(&fixture);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].group_no, 1);
    assert_eq!(requests[0].slave_total_occupied_station_count, 1);
    assert_eq!(requests[0].slave_ids, vec![u32::from(SLAVE_IP_0)]);
    assert_eq!(requests[1].group_no, 2);
    assert_eq!(requests[1].slave_total_occupied_station_count, 2);
    assert_eq!(
        requests[1].slave_ids,
        vec![u32::from(SLAVE_IP_G2), frame::SLAVE_ID_NOT_OCCUPIED]
    );

    // Only group 2's device answers; its scan completes and the next
    // request goes out while group 1 keeps waiting.
    let response = build_cyclic_response(&cclink_master::frame::CyclicResponse {
        protocol_ver: 2,
        end_code: 0x0000,
        vendor_code: 1,
        model_code: 2,
        equipment_ver: 3,
        slave_local_unit_info: 0x0001,
        slave_err_code: 0,
        local_management_info: 0,
        slave_id: SLAVE_IP_G2,
        group_no: 2,
        frame_sequence_no: 0,
        rwr: &[WordArea::default(); 2],
        rx: &[BitArea::default(); 2],
    });
    fixture.inject_cciefb(SLAVE_IP_G2, &response);
    fixture.tick(TICK_US);

    assert_eq!(fixture.master.group_status(0).unwrap().frame_sequence_no, 0);
    assert_eq!(fixture.master.group_status(1).unwrap().frame_sequence_no, 1);
    let requests = sent_requests(&fixture);
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].group_no, 2);
    assert_eq!(requests[2].cyclic_transmission_state, 0x0003);

    // Group 1's device is untouched by group 2's traffic.
    let untouched = fixture.master.device_connection_details(0, 0).unwrap();
    assert_eq!(untouched.statistics.number_of_incoming_frames, 0);
    assert_eq!(untouched.device_state, DeviceState::WaitTd);
}

#[test]
fn response_for_the_wrong_group_is_dropped() {
    let mut fixture = start_master(two_group_config());
    fixture.run_until_running();

    // Source IP belongs to group 1, frame claims group 2.
    let mut response = simple_response(SLAVE_IP_0, 0);
    response[55] = 2;
    fixture.inject_cciefb(SLAVE_IP_0, &response);
    fixture.tick(TICK_US);

    let group1_device = fixture.master.device_connection_details(0, 0).unwrap();
    let group2_device = fixture.master.device_connection_details(1, 0).unwrap();
    assert_eq!(group1_device.statistics.number_of_incoming_frames, 0);
    assert_eq!(group2_device.statistics.number_of_incoming_frames, 0);
    assert_eq!(group1_device.device_state, DeviceState::WaitTd);
}

#[test]
fn first_scan_is_a_pure_probe_even_with_forced_bits() {
    let mut fixture = start_master(sample_config());

    // Forced during arbitration, before any request went out.
    fixture
        .master
        .force_cyclic_transmission_bit(0, 1, true)
        .unwrap();
    fixture.run_until_running();

    let sent = fixture.net.sent(CCIEFB_SOCKET);
    let request = frame::parse_cyclic_request(&sent[0].2).unwrap();
    assert_eq!(request.frame_sequence_no, 0);
    assert_eq!(request.cyclic_transmission_state, 0x0000);

    // The forced bits appear from the second scan on.
    fixture.tick(u32::from(TIMEOUT_MS) * 1000 + TICK_US);
    let sent = fixture.net.sent(CCIEFB_SOCKET);
    let request = frame::parse_cyclic_request(&sent.last().unwrap().2).unwrap();
    assert_eq!(request.frame_sequence_no, 1);
    assert_eq!(request.cyclic_transmission_state, 0x0006);
}

#[test]
fn forced_transmission_bit_overrides_connection_state() {
    let mut fixture = start_master(sample_config());
    fixture.run_until_running();

    // Device 1 (stations 2 and 3) never responded, but its bits are
    // forced on.
    fixture
        .master
        .force_cyclic_transmission_bit(0, 1, true)
        .unwrap();
    fixture.tick(u32::from(TIMEOUT_MS) * 1000 + TICK_US);
    let sent = fixture.net.sent(CCIEFB_SOCKET);
    let request = frame::parse_cyclic_request(&sent.last().unwrap().2).unwrap();
    assert_eq!(request.cyclic_transmission_state, 0x0006);
    let forced = fixture.master.device_connection_details(0, 1).unwrap();
    assert!(forced.transmission_bit);

    // Releasing the override clears the bits again.
    fixture
        .master
        .force_cyclic_transmission_bit(0, 1, false)
        .unwrap();
    fixture.tick(u32::from(TIMEOUT_MS) * 1000 + TICK_US);
    let sent = fixture.net.sent(CCIEFB_SOCKET);
    let request = frame::parse_cyclic_request(&sent.last().unwrap().2).unwrap();
    assert_eq!(request.cyclic_transmission_state, 0x0000);
}

#[test]
fn response_time_sampling_respects_the_configured_cap() {
    let mut config = sample_config();
    config.max_statistics_samples = 2;
    config.groups[0].slave_devices.truncate(1);
    let mut fixture = start_master(config);
    fixture.run_until_running();

    for _ in 0..3 {
        let sequence_no = fixture.master.group_status(0).unwrap().frame_sequence_no;
        fixture.inject_cciefb(SLAVE_IP_0, &simple_response(SLAVE_IP_0, sequence_no));
        fixture.tick(TICK_US);
    }

    let device = fixture.master.device_connection_details(0, 0).unwrap();
    assert_eq!(device.statistics.number_of_incoming_frames, 3);
    assert_eq!(device.statistics.measured_time.number_of_samples, 2);
    assert!(device.statistics.measured_time.min <= device.statistics.measured_time.max);
}

#[test]
fn arbitration_works_across_the_clock_wrap() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sample_config();
    config.file_directory = Some(dir.path().to_path_buf());

    let start = u32::MAX - 1_000_000;
    let net = MockPlatform::new();
    let mut master =
        Master::init(config, net.clone(), Box::new(NoCallbacks), start).expect("init");

    // Half way through arbitration, before the clock wraps.
    master.periodic(start.wrapping_add(1_000_000));
    assert_eq!(master.master_status().master_state, MasterState::Arbitration);
    assert!(net.sent(CCIEFB_SOCKET).is_empty());

    // The arbitration deadline lies beyond the wrap.
    master.periodic(start.wrapping_add(2_501_000));
    assert_eq!(master.master_status().master_state, MasterState::Running);
    assert_eq!(net.sent(CCIEFB_SOCKET).len(), 1);
}

#[test]
fn sequence_number_advances_once_per_completed_scan() {
    let mut config = sample_config();
    config.groups[0].slave_devices.truncate(1);
    let mut fixture = start_master(config);
    fixture.run_until_running();

    // Walk the sequence number close to the wrap by completing scans.
    let mut last_sequence = 0;
    for _ in 0..4 {
        let sequence_no = fixture.master.group_status(0).unwrap().frame_sequence_no;
        fixture.inject_cciefb(SLAVE_IP_0, &simple_response(SLAVE_IP_0, sequence_no));
        fixture.tick(TICK_US);
        last_sequence = fixture.master.group_status(0).unwrap().frame_sequence_no;
        assert_eq!(last_sequence, sequence_no + 1);
    }
    assert_eq!(last_sequence, 4);
}
