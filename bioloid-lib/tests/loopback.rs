//! Controller and simulated servos wired together in memory

mod common;

use bioloid_lib::constants::{DEV_ID_OFFSET, LED_OFFSET};
use bioloid_lib::io_adapter::{
    GPIO_CFG_OFFSET, GPIO_IDR_OFFSET, GPIO_ODR_OFFSET, GPIO_PIN_OFFSET, IO_ADAPTER_MODEL, SimulatedAdcs,
    SimulatedPins, fake_io_adapter,
};
use bioloid_lib::scan::{DeviceSummary, Scanner};
use bioloid_lib::servo::SERVO_MODEL;
use common::*;

fn led(bus: &Bus<LoopbackBus>, dev_id: u8) -> u8 {
    bus.transport()
        .device(dev_id)
        .expect("device not attached")
        .table()
        .as_bytes()[LED_OFFSET]
}

#[tokio::test]
async fn test_ping_servos() {
    let mut bus = loopback_bus(&[1, 2]);
    assert!(bus.ping(1u8).await.unwrap());
    assert!(bus.ping(2u8).await.unwrap());
    assert!(!bus.ping(3u8).await.unwrap());
}

#[tokio::test]
async fn test_read_model_and_version() {
    let mut bus = loopback_bus(&[1]);
    let data = bus.read(1u8, 0, 3).await.unwrap();
    assert_eq!(data.as_ref(), &[12, 0, 1]);
}

#[tokio::test]
async fn test_out_of_range_read_is_reported() {
    let mut bus = loopback_bus(&[1]);
    match bus.read(1u8, 30, 4).await {
        Err(BusError::Status(code)) => assert_eq!(code, ErrorCode::RANGE),
        other => panic!("Expected RANGE, got {other:?}"),
    }
}

#[tokio::test]
async fn test_write_then_read_back() {
    let mut bus = loopback_bus(&[1]);
    assert_eq!(bus.write(1u8, LED_OFFSET as u8, &[1], false).await.unwrap(), ErrorCode::NONE);
    assert_eq!(bus.read(1u8, LED_OFFSET as u8, 1).await.unwrap().as_ref(), &[1]);
}

#[tokio::test]
async fn test_broadcast_write_reaches_everyone() {
    let mut bus = loopback_bus(&[1, 2]);
    bus.write(Id::BROADCAST, LED_OFFSET as u8, &[1], false).await.unwrap();
    assert_eq!(bus.transport().pending(), 0);
    assert_eq!(led(&bus, 1), 1);
    assert_eq!(led(&bus, 2), 1);
}

#[tokio::test]
async fn test_deferred_write_and_action() {
    let mut bus = loopback_bus(&[1, 2]);
    bus.write(1u8, LED_OFFSET as u8, &[1], true).await.unwrap();
    bus.write(2u8, LED_OFFSET as u8, &[1], true).await.unwrap();
    assert_eq!(led(&bus, 1), 0);
    assert_eq!(led(&bus, 2), 0);

    bus.action().await.unwrap();
    assert_eq!(bus.transport().pending(), 0);
    assert_eq!(led(&bus, 1), 1);
    assert_eq!(led(&bus, 2), 1);
}

#[tokio::test]
async fn test_sync_write_targets_each_servo() {
    let mut bus = loopback_bus(&[1, 2, 3]);
    bus.sync_write(&[1, 2, 3], LED_OFFSET as u8, &[[0x11u8], [0x22], [0x33]])
        .await
        .unwrap();
    assert_eq!(bus.transport().pending(), 0);
    assert_eq!(led(&bus, 1), 0x11);
    assert_eq!(led(&bus, 2), 0x22);
    assert_eq!(led(&bus, 3), 0x33);
}

#[tokio::test]
async fn test_change_id_and_reset() {
    let mut bus = loopback_bus(&[1]);
    bus.write(1u8, DEV_ID_OFFSET as u8, &[42], false).await.unwrap();
    assert!(!bus.ping(1u8).await.unwrap());
    assert!(bus.ping(42u8).await.unwrap());

    assert_eq!(bus.reset(42u8).await.unwrap(), ErrorCode::NONE);
    assert!(bus.ping(1u8).await.unwrap());
}

#[tokio::test]
async fn test_broadcast_reset() {
    let mut bus = loopback_bus(&[1]);
    bus.write(1u8, LED_OFFSET as u8, &[1], false).await.unwrap();
    assert_eq!(bus.reset(Id::BROADCAST).await.unwrap(), ErrorCode::NONE);
    assert_eq!(led(&bus, 1), 0);

    // The servo still answers a broadcast RESET; the controller leaves it unread.
    assert_eq!(bus.transport().pending(), 6);
    let status = bus.read_status_packet().await.unwrap();
    assert_eq!(hex::encode(status.as_bytes()), "ffff010200fc");
}

#[tokio::test]
async fn test_unknown_instruction() {
    let mut bus = loopback_bus(&[1]);
    let packet = Packet::request(1u8, 0x20, &[]).unwrap();
    bus.transport_mut().write_bytes(packet.as_bytes()).await.unwrap();
    assert!(matches!(
        bus.read_status_packet().await,
        Err(BusError::Status(ErrorCode::INSTRUCTION))
    ));
}

#[tokio::test]
async fn test_device_reports_bad_checksum() {
    let mut bus = loopback_bus(&[1]);
    bus.transport_mut()
        .write_bytes(&hex_to_bytes("ffff010201fa"))
        .await
        .unwrap();
    assert!(matches!(
        bus.read_status_packet().await,
        Err(BusError::Status(ErrorCode::CHECKSUM))
    ));
}

#[tokio::test]
async fn test_scanner() {
    let mut bus = loopback_bus(&[1, 101]);
    let devices = Scanner::new(&mut bus).scan().await.unwrap();
    assert_eq!(
        devices,
        vec![
            DeviceSummary {
                id: Id(1),
                model: SERVO_MODEL,
                version: 1
            },
            DeviceSummary {
                id: Id(101),
                model: SERVO_MODEL,
                version: 1
            },
        ]
    );
    assert_eq!(devices[0].to_string(), "ID:   1 Model:    12 Version:     1");
}

#[tokio::test]
async fn test_scanner_finds_nothing() {
    let mut bus = loopback_bus(&[]);
    let mut scanner = Scanner::new(&mut bus);
    assert!(scanner.scan().await.unwrap().is_empty());
    assert!(scanner.devices().is_empty());
}

#[tokio::test]
async fn test_scanner_range_up_to_broadcast() {
    let mut bus = loopback_bus(&[1]);
    let mut scanner = Scanner::new(&mut bus);
    scanner.scan_range(250, usize::MAX).await.unwrap();
    scanner.scan_range(0, 0).await.unwrap();
    assert!(scanner.devices().is_empty());
}

#[tokio::test]
async fn test_io_adapter_output_reads_back() {
    let mut bus = loopback_bus(&[1]);
    let adapter = fake_io_adapter(2, MemoryStorage::new(), SimulatedPins::default(), SimulatedAdcs::default()).unwrap();
    bus.transport_mut().add_device(adapter);

    let devices = Scanner::new(&mut bus).scan().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1].id, Id(2));
    assert_eq!(devices[1].model, IO_ADAPTER_MODEL);

    // gpio 0 on A1, push-pull output, driven high
    bus.write(2u8, GPIO_PIN_OFFSET as u8, &[0x11], false).await.unwrap();
    bus.write(2u8, GPIO_CFG_OFFSET as u8, &[0x00], false).await.unwrap();
    bus.write(2u8, GPIO_ODR_OFFSET as u8, &[0x01], false).await.unwrap();
    assert_eq!(bus.read(2u8, GPIO_IDR_OFFSET as u8, 4).await.unwrap().as_ref(), &[1, 0, 0, 0]);
}
