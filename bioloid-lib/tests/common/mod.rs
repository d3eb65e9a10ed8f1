//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bioloid_lib::control_table::{ControlTable, FileStorage, MemoryStorage, Storage, Subscription};
#[allow(unused_imports)]
pub use bioloid_lib::device::DeviceProtocolHandler;
#[allow(unused_imports)]
pub use bioloid_lib::error::BusError;
#[allow(unused_imports)]
pub use bioloid_lib::packet::{Command, ErrorCode, Id, Packet, PacketKind};
#[allow(unused_imports)]
pub use bioloid_lib::servo::{LogPeripherals, ServoRegisters, fake_servo};
#[allow(unused_imports)]
pub use bioloid_lib::transport::{LoopbackBus, Transport};
#[allow(unused_imports)]
pub use bioloid_lib::{Bus, BusConfig};
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;

use std::collections::VecDeque;

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("Failed to decode hex")
}

/// Routes library logs to the test output. Safe to call from every test.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A transport that records everything written and plays back canned
/// responses. Running out of responses reads as a timeout.
#[derive(Debug, Default)]
#[allow(dead_code)]
pub struct ScriptedTransport {
    pub written: Vec<u8>,
    responses: VecDeque<u8>,
    /// Number of `read_byte` calls made so far
    pub reads: usize,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the bytes of `hex_data` for the controller to read.
    pub fn respond(mut self, hex_data: &str) -> Self {
        self.responses.extend(hex_to_bytes(hex_data));
        self
    }

    pub fn written_hex(&self) -> String {
        hex::encode(&self.written)
    }

    pub fn unread(&self) -> usize {
        self.responses.len()
    }
}

impl Transport for ScriptedTransport {
    async fn read_byte(&mut self) -> Result<Option<u8>, BusError> {
        self.reads += 1;
        Ok(self.responses.pop_front())
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn bytes_available(&self) -> bool {
        !self.responses.is_empty()
    }
}

/// A bus with a scripted transport behind it.
#[allow(dead_code)]
pub fn scripted_bus(responses: &str) -> Bus<ScriptedTransport> {
    init_tracing();
    Bus::new(ScriptedTransport::new().respond(responses))
}

/// A simulated servo with in-memory storage.
#[allow(dead_code)]
pub fn servo(dev_id: u8) -> DeviceProtocolHandler {
    fake_servo(dev_id, MemoryStorage::new(), LogPeripherals).expect("Failed to build servo")
}

/// A loopback bus with one simulated servo per id.
#[allow(dead_code)]
pub fn loopback_bus(ids: &[u8]) -> Bus<LoopbackBus> {
    init_tracing();
    let mut loopback = LoopbackBus::new();
    for &id in ids {
        loopback.add_device(servo(id));
    }
    Bus::new(loopback)
}
