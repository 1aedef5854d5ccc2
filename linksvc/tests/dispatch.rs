//! Commands, raw writes and telemetry routed through the bus

mod common;

use std::sync::Arc;
use std::time::Duration;

use linkgs::{BusMessage, CommandAck, ConnectionState, MessageBus, MicroserviceKind};
use linksvc_lib::SimConfig;

use common::{test_link_config, wait_until, Harness, SCOPE};

const ACK_WAIT: Duration = Duration::from_secs(1);

#[test]
fn forwards_command_when_connected() {
    let h = Harness::interface("CMD_INT", test_link_config());
    let run = h.start();
    assert!(h.wait_for_state(ConnectionState::Connected, Duration::from_secs(1)));

    let ack = h.bus.send_command(SCOPE, "INST", vec![0xC0, 0xDE]).unwrap();
    assert_eq!(ack.wait(ACK_WAIT).unwrap(), CommandAck::Success);
    assert_eq!(h.sim.written(), vec![vec![0xC0, 0xDE]]);
    assert_eq!(h.service.status().write_count, 1);
    assert_eq!(h.service.status().bytes_written, 2);

    h.service.shutdown();
    run.join().unwrap().unwrap();
}

#[test]
fn rejects_command_when_not_connected() {
    let h = Harness::interface("NOCONN_INT", test_link_config());

    let ack = h.bus.send_command(SCOPE, "INST", vec![1]).unwrap();
    match ack.wait(ACK_WAIT).unwrap() {
        CommandAck::Rejected(reason) => assert!(reason.contains("not connected")),
        other => panic!("unexpected ack {:?}", other),
    }
    assert!(h.sim.written().is_empty());
    assert!(h.log.contains("Write rejected"));
    // The worker never touches the connection state
    assert_eq!(h.published_state(), Some(ConnectionState::Attempting));

    h.service.shutdown();
}

#[test]
fn writes_raw_bytes() {
    let h = Harness::interface("RAW_INT", test_link_config());
    let run = h.start();
    assert!(h.wait_for_state(ConnectionState::Connected, Duration::from_secs(1)));

    let ack = h
        .bus
        .control(SCOPE, MicroserviceKind::Interface, "RAW_INT", BusMessage::WriteRaw(vec![7, 7, 7]))
        .unwrap();
    assert!(ack.wait(ACK_WAIT).unwrap().is_success());
    assert!(h.log.contains("Write raw"));
    assert_eq!(h.sim.written(), vec![vec![7, 7, 7]]);

    h.service.shutdown();
    run.join().unwrap().unwrap();
}

#[test]
fn shutdown_message_stops_only_the_worker() {
    let h = Harness::interface("STOPCMD_INT", test_link_config());
    let ack = h
        .bus
        .control(SCOPE, MicroserviceKind::Interface, "STOPCMD_INT", BusMessage::Shutdown)
        .unwrap();
    assert!(ack.wait(ACK_WAIT).unwrap().is_success());
    assert!(h.log.contains("Shutdown requested"));
    assert!(wait_until(Duration::from_secs(1), || h.service.background_threads() == 1));

    h.service.shutdown();
    assert_eq!(h.service.background_threads(), 0);
}

#[test]
fn router_redistributes_interface_telemetry() {
    let bus = Arc::new(MessageBus::new(64));
    let interface = Harness::build(
        MicroserviceKind::Interface,
        "TLM_INT",
        test_link_config(),
        SimConfig {
            interval: Duration::from_millis(20),
            ..SimConfig::default()
        },
        Some(Arc::clone(&bus)),
    );
    let router = Harness::build(
        MicroserviceKind::Router,
        "TLM_ROUTE",
        test_link_config(),
        SimConfig {
            read_allowed: false,
            ..SimConfig::default()
        },
        Some(Arc::clone(&bus)),
    );

    let router_run = router.start();
    assert!(router.wait_for_state(ConnectionState::Connected, Duration::from_secs(1)));
    let interface_run = interface.start();

    assert!(wait_until(Duration::from_secs(2), || router.sim.written().len() >= 3));
    let written = router.sim.written();
    // Sequence numbers arrive in order
    let sequences: Vec<u32> = written
        .iter()
        .map(|buffer| u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]))
        .collect();
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));

    interface.service.shutdown();
    interface_run.join().unwrap().unwrap();
    router.service.shutdown();
    router_run.join().unwrap().unwrap();
}

#[test]
fn router_rejects_commands() {
    let h = Harness::build(
        MicroserviceKind::Router,
        "CMD_ROUTE",
        test_link_config(),
        SimConfig {
            read_allowed: false,
            ..SimConfig::default()
        },
        None,
    );
    let ack = h
        .bus
        .control(
            SCOPE,
            MicroserviceKind::Router,
            "CMD_ROUTE",
            BusMessage::Command {
                target_name: "INST".to_string(),
                payload: vec![1],
            },
        )
        .unwrap();
    assert!(matches!(ack.wait(ACK_WAIT).unwrap(), CommandAck::Rejected(_)));

    h.service.shutdown();
}
