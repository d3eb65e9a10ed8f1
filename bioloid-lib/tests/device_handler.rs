//! Device-side command dispatch

mod common;

use bioloid_lib::constants::{DEV_ID_OFFSET, LED_OFFSET, RDT_OFFSET};
use bioloid_lib::servo::SERVO_PERSISTENT_LEN;
use common::*;
use std::io;
use zerocopy::IntoBytes;

fn request(id: u8, command: Command, params: &[u8]) -> Vec<u8> {
    Packet::instruction(id, command, params).unwrap().as_bytes().to_vec()
}

/// Feeds `bytes` and returns the hex of every status packet produced.
fn feed(device: &mut DeviceProtocolHandler, bytes: &[u8]) -> Vec<String> {
    device
        .process_bytes(bytes)
        .iter()
        .map(|p| hex::encode(p.as_bytes()))
        .collect()
}

#[test]
fn test_ping() {
    let mut dev = servo(1);
    assert_eq!(feed(&mut dev, &hex_to_bytes("ffff010201fb")), vec!["ffff010200fc"]);
}

#[test]
fn test_other_ids_are_ignored() {
    let mut dev = servo(1);
    assert!(feed(&mut dev, &request(2, Command::Ping, &[])).is_empty());
    assert!(feed(&mut dev, &request(2, Command::Write, &[LED_OFFSET as u8, 1])).is_empty());
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 0);
}

#[test]
fn test_broadcast_ping_is_silent() {
    let mut dev = servo(1);
    assert!(feed(&mut dev, &request(0xfe, Command::Ping, &[])).is_empty());
}

#[test]
fn test_read() {
    let mut dev = servo(1);
    assert_eq!(
        feed(&mut dev, &request(1, Command::Read, &[0, 3])),
        vec!["ffff0105000c0001ec"]
    );
}

#[test]
fn test_read_out_of_range() {
    let mut dev = servo(1);
    assert_eq!(feed(&mut dev, &request(1, Command::Read, &[30, 3])), vec!["ffff010208fc"]);
    assert_eq!(feed(&mut dev, &request(1, Command::Read, &[0])), vec!["ffff010208fc"]);
}

#[test]
fn test_write_applies_and_answers() {
    let mut dev = servo(1);
    assert_eq!(
        feed(&mut dev, &request(1, Command::Write, &[LED_OFFSET as u8, 1])),
        vec!["ffff010200fc"]
    );
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 1);
}

#[test]
fn test_broadcast_write_is_silent() {
    let mut dev = servo(1);
    assert!(feed(&mut dev, &request(0xfe, Command::Write, &[LED_OFFSET as u8, 1])).is_empty());
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 1);
}

#[test]
fn test_write_out_of_range_leaves_table() {
    let mut dev = servo(1);
    let before = dev.table().as_bytes().to_vec();
    assert_eq!(
        feed(&mut dev, &request(1, Command::Write, &[0x1f, 1, 2])),
        vec!["ffff010208fc"]
    );
    assert_eq!(feed(&mut dev, &request(1, Command::Write, &[])), vec!["ffff010208fc"]);
    assert_eq!(dev.table().as_bytes(), before.as_slice());
}

#[test]
fn test_id_change_answers_from_old_id() {
    let mut dev = servo(1);
    assert_eq!(
        feed(&mut dev, &request(1, Command::Write, &[DEV_ID_OFFSET as u8, 7])),
        vec!["ffff010200fc"]
    );
    assert_eq!(dev.dev_id(), 7);
    assert!(feed(&mut dev, &request(1, Command::Ping, &[])).is_empty());
    assert_eq!(feed(&mut dev, &request(7, Command::Ping, &[])), vec!["ffff070200f6"]);
}

#[test]
fn test_deferred_write_needs_action() {
    let mut dev = servo(1);
    assert_eq!(
        feed(&mut dev, &request(1, Command::RegWrite, &[LED_OFFSET as u8, 1])),
        vec!["ffff010200fc"]
    );
    assert!(dev.has_deferred());
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 0);

    assert!(feed(&mut dev, &request(0xfe, Command::Action, &[])).is_empty());
    assert!(!dev.has_deferred());
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 1);

    // Committed once; a second ACTION has nothing to apply
    dev.table_mut().write(LED_OFFSET, &[0], true).unwrap();
    assert!(feed(&mut dev, &request(0xfe, Command::Action, &[])).is_empty());
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 0);
}

#[test]
fn test_broadcast_reg_write_is_ignored() {
    let mut dev = servo(1);
    assert!(feed(&mut dev, &request(0xfe, Command::RegWrite, &[LED_OFFSET as u8, 1])).is_empty());
    assert!(!dev.has_deferred());
}

#[test]
fn test_unicast_action_is_tolerated() {
    let mut dev = servo(1);
    feed(&mut dev, &request(1, Command::RegWrite, &[LED_OFFSET as u8, 1]));
    assert!(feed(&mut dev, &request(1, Command::Action, &[])).is_empty());
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 1);
}

#[test]
fn test_reset() {
    let mut dev = servo(1);
    feed(&mut dev, &request(1, Command::Write, &[DEV_ID_OFFSET as u8, 9]));
    feed(&mut dev, &request(9, Command::Write, &[LED_OFFSET as u8, 1]));

    // The status goes out under the id in use before the reset
    assert_eq!(feed(&mut dev, &request(9, Command::Reset, &[])), vec!["ffff090200f4"]);
    assert_eq!(dev.dev_id(), 1);
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 0);
}

#[test]
fn test_broadcast_reset_answers() {
    let mut dev = servo(1);
    feed(&mut dev, &request(1, Command::Write, &[LED_OFFSET as u8, 1]));
    assert_eq!(feed(&mut dev, &request(0xfe, Command::Reset, &[])), vec!["ffff010200fc"]);
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 0);
}

#[test]
fn test_sync_write_picks_own_entry() {
    let mut dev = servo(2);
    let params = [LED_OFFSET as u8, 1, 1, 0x11, 2, 0x22, 3, 0x33];
    assert!(feed(&mut dev, &request(0xfe, Command::SyncWrite, &params)).is_empty());
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 0x22);
}

#[test]
fn test_sync_write_without_our_id() {
    let mut dev = servo(5);
    let params = [LED_OFFSET as u8, 1, 1, 0x11, 2, 0x22];
    assert!(feed(&mut dev, &request(0xfe, Command::SyncWrite, &params)).is_empty());
    assert_eq!(dev.table().as_bytes()[LED_OFFSET], 0);
}

#[test]
fn test_unknown_opcode() {
    let mut dev = servo(1);
    let unicast = Packet::request(1u8, 0x07, &[]).unwrap();
    assert_eq!(feed(&mut dev, unicast.as_bytes()), vec!["ffff010240fc"]);

    let broadcast = Packet::request(Id::BROADCAST, 0x07, &[]).unwrap();
    assert_eq!(feed(&mut dev, broadcast.as_bytes()), vec!["ffff010240fc"]);
}

#[test]
fn test_bad_checksum_addressed_to_us() {
    let mut dev = servo(1);
    assert_eq!(feed(&mut dev, &hex_to_bytes("ffff010201fa")), vec!["ffff010210fc"]);
    assert!(feed(&mut dev, &hex_to_bytes("ffff020201f0")).is_empty());
}

#[test]
fn test_sticky_status() {
    let mut dev = servo(1);
    dev.set_status(ErrorCode::OVERHEATING);
    assert_eq!(feed(&mut dev, &request(1, Command::Ping, &[])), vec!["ffff010204fc"]);
    assert_eq!(
        feed(&mut dev, &request(1, Command::Read, &[30, 3])),
        vec!["ffff01020cfc"]
    );

    dev.set_status(ErrorCode::TIMEOUT);
    assert_eq!(dev.status(), ErrorCode::OVERHEATING);
}

#[test]
fn test_back_to_back_requests() {
    let mut dev = servo(1);
    let mut stream = request(1, Command::Ping, &[]);
    stream.extend(request(2, Command::Ping, &[]));
    stream.extend(request(1, Command::Read, &[0, 1]));
    assert_eq!(feed(&mut dev, &stream), vec!["ffff010200fc", "ffff0103000cef"]);
}

/// Holds a valid saved table but refuses every save.
struct ReadOnlyStorage;

impl Storage for ReadOnlyStorage {
    fn load(&mut self) -> Option<Vec<u8>> {
        Some(ServoRegisters::defaults(1).as_bytes()[..SERVO_PERSISTENT_LEN].to_vec())
    }

    fn save(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
    }
}

#[test]
fn test_failed_save_is_reported() {
    let mut dev = fake_servo(1, ReadOnlyStorage, LogPeripherals).unwrap();
    assert_eq!(
        feed(&mut dev, &request(1, Command::Write, &[RDT_OFFSET as u8, 10])),
        vec!["ffff010208fc"]
    );
    // Volatile registers don't touch storage.
    assert_eq!(
        feed(&mut dev, &request(1, Command::Write, &[LED_OFFSET as u8, 1])),
        vec!["ffff010200fc"]
    );
}
