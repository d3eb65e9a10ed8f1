//! A simulated servo: the smallest device worth talking to.
//!
//! The register layout follows the common servo control table for the
//! addresses it implements. Writes to the LED and baud rate registers are
//! forwarded to a [`ServoPeripherals`] implementation.

use crate::constants::*;
use crate::control_table::{ControlTable, Storage, Subscription};
use crate::device::DeviceProtocolHandler;
use crate::error::BusError;
use std::sync::{Arc, Mutex};
use tracing::info;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Model number reported at [`MODEL_OFFSET`]
pub const SERVO_MODEL: u16 = 12;
pub const SERVO_VERSION: u8 = 1;

pub const TORQUE_ENABLE_OFFSET: usize = 0x18;

/// Size of the servo control table
pub const SERVO_TABLE_SIZE: usize = 32;

/// Registers below this offset are kept across power cycles
pub const SERVO_PERSISTENT_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ServoRegisters {
    pub model: U16,            // 0x00
    pub version: u8,           // 0x02
    pub dev_id: u8,            // 0x03
    pub baud_rate: u8,         // 0x04
    pub return_delay: u8,      // 0x05, 2 usec units
    pub reserved: [u8; 18],    // 0x06..0x18, limits and alarms (unimplemented)
    pub torque_enable: u8,     // 0x18
    pub led: u8,               // 0x19
    pub reserved_tail: [u8; 6],
}

const _: () = assert!(size_of::<ServoRegisters>() == SERVO_TABLE_SIZE);
const _: () = assert!(std::mem::offset_of!(ServoRegisters, dev_id) == DEV_ID_OFFSET);
const _: () = assert!(std::mem::offset_of!(ServoRegisters, baud_rate) == BAUD_OFFSET);
const _: () = assert!(std::mem::offset_of!(ServoRegisters, return_delay) == RDT_OFFSET);
const _: () = assert!(std::mem::offset_of!(ServoRegisters, torque_enable) == TORQUE_ENABLE_OFFSET);
const _: () = assert!(std::mem::offset_of!(ServoRegisters, led) == LED_OFFSET);

impl ServoRegisters {
    /// Factory defaults for a servo answering to `dev_id`.
    pub fn defaults(dev_id: u8) -> Self {
        Self {
            model: U16::new(SERVO_MODEL),
            version: SERVO_VERSION,
            dev_id,
            baud_rate: INITIAL_BAUD,
            return_delay: INITIAL_RDT,
            reserved: [0; 18],
            torque_enable: 0,
            led: 0,
            reserved_tail: [0; 6],
        }
    }

    /// Typed view of a servo's control table.
    pub fn view(table: &ControlTable) -> Result<&Self, BusError> {
        Self::ref_from_bytes(table.as_bytes()).map_err(|_| BusError::OutOfRange {
            offset: 0,
            len: SERVO_TABLE_SIZE,
            size: table.len(),
        })
    }

    pub fn baud(&self) -> u32 {
        baud_from_register(self.baud_rate)
    }

    pub fn led_on(&self) -> bool {
        self.led != 0
    }
}

/// Hardware a servo drives when its registers change.
pub trait ServoPeripherals: Send {
    fn set_led(&mut self, on: bool);

    /// Called with the new bus speed in bits per second.
    fn set_baud(&mut self, baud: u32);
}

/// Peripherals that only log what real hardware would do.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPeripherals;

impl ServoPeripherals for LogPeripherals {
    fn set_led(&mut self, on: bool) {
        info!("LED {}", if on { "on" } else { "off" });
    }

    fn set_baud(&mut self, baud: u32) {
        info!("Baud rate {baud}");
    }
}

/// Builds a simulated servo. Its persistent registers live in `storage`;
/// `dev_id` is only the factory default and is overridden by saved state.
pub fn fake_servo<P>(
    dev_id: u8,
    storage: impl Storage + 'static,
    peripherals: P,
) -> Result<DeviceProtocolHandler, BusError>
where
    P: ServoPeripherals + 'static,
{
    let peripherals = Arc::new(Mutex::new(peripherals));

    let led = Arc::clone(&peripherals);
    let baud = peripherals;
    let subscriptions = vec![
        Subscription::new(BAUD_OFFSET, 1, move |_, bytes| {
            if let Ok(mut p) = baud.lock() {
                p.set_baud(baud_from_register(bytes[0]));
            }
        }),
        Subscription::new(LED_OFFSET, 1, move |_, bytes| {
            if let Ok(mut p) = led.lock() {
                p.set_led(bytes[0] != 0);
            }
        }),
    ];

    let defaults = ServoRegisters::defaults(dev_id);
    let table = ControlTable::new(defaults.as_bytes(), SERVO_PERSISTENT_LEN, subscriptions, storage)?;
    Ok(DeviceProtocolHandler::new(table))
}
