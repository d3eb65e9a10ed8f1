//! A simulated I/O adapter: a bus device exposing GPIOs and ADC inputs.
//!
//! Each GPIO and ADC channel is mapped onto a physical pin through a
//! persistent register (`port << 4 | pin`, port 0 meaning unassigned).
//! Writes to the pin, config and output registers are forwarded to a
//! [`PinController`]; ADC channels are sampled through an [`AdcReader`].
//! Input registers are refreshed before every request the adapter handles.

use crate::constants::*;
use crate::control_table::{ControlTable, Storage, Subscription};
use crate::device::DeviceProtocolHandler;
use crate::error::BusError;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const IO_ADAPTER_MODEL: u16 = 123;
pub const IO_ADAPTER_VERSION: u8 = 1;

pub const NUM_ADCS: usize = 16;
pub const NUM_GPIOS: usize = 32;

pub const NUM_ADCS_OFFSET: usize = 0x10;
pub const NUM_GPIOS_OFFSET: usize = 0x11;
pub const ADC_PIN_OFFSET: usize = 0x20;
pub const GPIO_PIN_OFFSET: usize = 0x30;
pub const GPIO_CFG_OFFSET: usize = 0x50;
pub const ADC_VALUE_OFFSET: usize = 0x80;
pub const GPIO_SET_OFFSET: usize = 0xB0;
pub const GPIO_CLEAR_OFFSET: usize = 0xB4;
pub const GPIO_ODR_OFFSET: usize = 0xB8;
pub const GPIO_IDR_OFFSET: usize = 0xBC;

/// Registers below this offset are kept across power cycles
pub const IO_ADAPTER_PERSISTENT_LEN: usize = 0x80;
pub const IO_ADAPTER_TABLE_SIZE: usize = 0xC0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IoAdapterRegisters {
    pub model: U16,                   // 0x00
    pub version: u8,                  // 0x02
    pub dev_id: u8,                   // 0x03
    pub baud_rate: u8,                // 0x04
    pub return_delay: u8,             // 0x05
    pub reserved0: [u8; 10],          // 0x06
    pub num_adcs: u8,                 // 0x10
    pub num_gpios: u8,                // 0x11
    pub reserved1: [u8; 7],           // 0x12
    pub led: u8,                      // 0x19
    pub reserved2: [u8; 6],           // 0x1A
    pub adc_pin: [u8; NUM_ADCS],      // 0x20
    pub gpio_pin: [u8; NUM_GPIOS],    // 0x30
    pub gpio_cfg: [u8; NUM_GPIOS],    // 0x50
    pub reserved3: [u8; 16],          // 0x70
    pub adc_value: [U16; NUM_ADCS],   // 0x80
    pub reserved4: [u8; 16],          // 0xA0
    pub gpio_set: U32,                // 0xB0
    pub gpio_clear: U32,              // 0xB4
    pub gpio_odr: U32,                // 0xB8
    pub gpio_idr: U32,                // 0xBC
}

const _: () = assert!(size_of::<IoAdapterRegisters>() == IO_ADAPTER_TABLE_SIZE);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, dev_id) == DEV_ID_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, num_adcs) == NUM_ADCS_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, led) == LED_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, adc_pin) == ADC_PIN_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, gpio_pin) == GPIO_PIN_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, gpio_cfg) == GPIO_CFG_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, adc_value) == ADC_VALUE_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, gpio_set) == GPIO_SET_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, gpio_clear) == GPIO_CLEAR_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, gpio_odr) == GPIO_ODR_OFFSET);
const _: () = assert!(std::mem::offset_of!(IoAdapterRegisters, gpio_idr) == GPIO_IDR_OFFSET);

impl IoAdapterRegisters {
    /// Factory defaults: nothing assigned, every GPIO an input.
    pub fn defaults(dev_id: u8) -> Self {
        Self {
            model: U16::new(IO_ADAPTER_MODEL),
            version: IO_ADAPTER_VERSION,
            dev_id,
            baud_rate: INITIAL_BAUD,
            return_delay: INITIAL_RDT,
            reserved0: [0; 10],
            num_adcs: NUM_ADCS as u8,
            num_gpios: NUM_GPIOS as u8,
            reserved1: [0; 7],
            led: 0,
            reserved2: [0; 6],
            adc_pin: [0; NUM_ADCS],
            gpio_pin: [0; NUM_GPIOS],
            gpio_cfg: [GpioConfig::INPUT.0; NUM_GPIOS],
            reserved3: [0; 16],
            adc_value: [U16::new(0); NUM_ADCS],
            reserved4: [0; 16],
            gpio_set: U32::new(0),
            gpio_clear: U32::new(0),
            gpio_odr: U32::new(0),
            gpio_idr: U32::new(0),
        }
    }

    /// Typed view of an I/O adapter's control table.
    pub fn view(table: &ControlTable) -> Result<&Self, BusError> {
        Self::ref_from_bytes(table.as_bytes()).map_err(|_| BusError::OutOfRange {
            offset: 0,
            len: IO_ADAPTER_TABLE_SIZE,
            size: table.len(),
        })
    }
}

/// A physical pin, e.g. `A3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinId {
    /// 1 for port A, 2 for port B, ...
    pub port: u8,
    pub pin: u8,
}

impl PinId {
    /// Decodes a pin register; `None` when the port nibble is 0.
    pub fn from_register(value: u8) -> Option<Self> {
        let port = value >> 4;
        (port != 0).then_some(Self { port, pin: value & 0x0F })
    }

    pub fn register(self) -> u8 {
        (self.port << 4) | (self.pin & 0x0F)
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", char::from(b'@' + self.port), self.pin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    PushPull,
    OpenDrain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

/// One `gpio_cfg` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpioConfig(pub u8);

impl GpioConfig {
    pub const INPUT: GpioConfig = GpioConfig(0x01);
    pub const PULL_UP: GpioConfig = GpioConfig(0x02);
    pub const PULL_DOWN: GpioConfig = GpioConfig(0x04);
    pub const OPEN_DRAIN: GpioConfig = GpioConfig(0x08);

    fn has(self, flag: GpioConfig) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn mode(self) -> PinMode {
        if self.has(Self::INPUT) {
            PinMode::Input
        } else if self.has(Self::OPEN_DRAIN) {
            PinMode::OpenDrain
        } else {
            PinMode::PushPull
        }
    }

    /// Pull-up wins when both pulls are set.
    pub fn pull(self) -> Pull {
        if self.has(Self::PULL_UP) {
            Pull::Up
        } else if self.has(Self::PULL_DOWN) {
            Pull::Down
        } else {
            Pull::None
        }
    }
}

/// Digital pins driven by the adapter's GPIO registers.
pub trait PinController: Send {
    /// Connects GPIO channel `gpio` to `pin`, or disconnects it.
    fn assign(&mut self, gpio: usize, pin: Option<PinId>);

    fn configure(&mut self, gpio: usize, mode: PinMode, pull: Pull);

    fn set(&mut self, gpio: usize, high: bool);

    fn get(&mut self, gpio: usize) -> bool;
}

/// Analog inputs sampled into `adc_value`.
pub trait AdcReader: Send {
    /// Connects ADC channel `adc` to `pin`, or disconnects it.
    fn assign(&mut self, adc: usize, pin: Option<PinId>);

    fn read(&mut self, adc: usize) -> u16;
}

/// Pins that log what they are told and read back their last output level.
#[derive(Debug, Clone)]
pub struct SimulatedPins {
    levels: [bool; NUM_GPIOS],
}

impl Default for SimulatedPins {
    fn default() -> Self {
        Self {
            levels: [false; NUM_GPIOS],
        }
    }
}

impl PinController for SimulatedPins {
    fn assign(&mut self, gpio: usize, pin: Option<PinId>) {
        match pin {
            Some(pin) => info!("Set gpio[{gpio}] to {pin}"),
            None => debug!("Set gpio[{gpio}] to None"),
        }
    }

    fn configure(&mut self, gpio: usize, mode: PinMode, pull: Pull) {
        info!("Configured gpio[{gpio}] as {mode:?} with pull {pull:?}");
    }

    fn set(&mut self, gpio: usize, high: bool) {
        info!("Set gpio[{gpio}] to {}", u8::from(high));
        if let Some(level) = self.levels.get_mut(gpio) {
            *level = high;
        }
    }

    fn get(&mut self, gpio: usize) -> bool {
        self.levels.get(gpio).copied().unwrap_or(false)
    }
}

/// ADC channels that read fixed values.
#[derive(Debug, Clone, Default)]
pub struct SimulatedAdcs {
    values: [u16; NUM_ADCS],
}

impl SimulatedAdcs {
    pub fn with_values(values: [u16; NUM_ADCS]) -> Self {
        Self { values }
    }
}

impl AdcReader for SimulatedAdcs {
    fn assign(&mut self, adc: usize, pin: Option<PinId>) {
        match pin {
            Some(pin) => info!("Set adc[{adc}] to {pin}"),
            None => debug!("Set adc[{adc}] to None"),
        }
    }

    fn read(&mut self, adc: usize) -> u16 {
        self.values.get(adc).copied().unwrap_or(0)
    }
}

/// Hardware handles plus the register state the notifications need.
struct IoHardware<P, A> {
    pins: P,
    adcs: A,
    gpio: [Option<PinId>; NUM_GPIOS],
    gpio_cfg: [GpioConfig; NUM_GPIOS],
    adc: [Option<PinId>; NUM_ADCS],
}

impl<P: PinController, A: AdcReader> IoHardware<P, A> {
    fn adc_pins_updated(&mut self, offset: usize, bytes: &[u8]) {
        for (idx, &value) in (offset - ADC_PIN_OFFSET..).zip(bytes) {
            self.adc[idx] = PinId::from_register(value);
            self.adcs.assign(idx, self.adc[idx]);
        }
    }

    fn gpio_pins_updated(&mut self, offset: usize, bytes: &[u8]) {
        for (idx, &value) in (offset - GPIO_PIN_OFFSET..).zip(bytes) {
            self.gpio[idx] = PinId::from_register(value);
            self.pins.assign(idx, self.gpio[idx]);
            self.configure(idx);
        }
    }

    fn gpio_cfg_updated(&mut self, offset: usize, bytes: &[u8]) {
        for (idx, &value) in (offset - GPIO_CFG_OFFSET..).zip(bytes) {
            self.gpio_cfg[idx] = GpioConfig(value);
            self.configure(idx);
        }
    }

    fn configure(&mut self, idx: usize) {
        if self.gpio[idx].is_some() {
            let cfg = self.gpio_cfg[idx];
            self.pins.configure(idx, cfg.mode(), cfg.pull());
        }
    }

    /// Calls `f(gpio, bit)` for every assigned GPIO covered by `bytes`,
    /// which start `byte_offset` bytes into a 32-bit register.
    fn for_each_bit(&mut self, byte_offset: usize, bytes: &[u8], mut f: impl FnMut(&mut P, usize, bool)) {
        for (byte_idx, &value) in (byte_offset..).zip(bytes) {
            for bit in 0..8 {
                let gpio = byte_idx * 8 + bit;
                if self.gpio[gpio].is_some() {
                    f(&mut self.pins, gpio, value & (1 << bit) != 0);
                }
            }
        }
    }

    fn gpio_set_updated(&mut self, offset: usize, bytes: &[u8]) {
        self.for_each_bit(offset - GPIO_SET_OFFSET, bytes, |pins, gpio, bit| {
            if bit {
                pins.set(gpio, true);
            }
        });
    }

    fn gpio_clear_updated(&mut self, offset: usize, bytes: &[u8]) {
        self.for_each_bit(offset - GPIO_CLEAR_OFFSET, bytes, |pins, gpio, bit| {
            if bit {
                pins.set(gpio, false);
            }
        });
    }

    fn gpio_odr_updated(&mut self, offset: usize, bytes: &[u8]) {
        self.for_each_bit(offset - GPIO_ODR_OFFSET, bytes, |pins, gpio, bit| pins.set(gpio, bit));
    }

    /// Current `adc_value` and `gpio_idr` contents. Unassigned ADCs keep
    /// their previous value.
    fn sample_inputs(&mut self, table: &ControlTable) -> Result<(Vec<u8>, u32), BusError> {
        let mut adc_values = table.read(ADC_VALUE_OFFSET, NUM_ADCS * 2)?.to_vec();
        for (idx, value) in adc_values.chunks_exact_mut(2).enumerate() {
            if self.adc[idx].is_some() {
                value.copy_from_slice(&self.adcs.read(idx).to_le_bytes());
            }
        }
        let mut idr = 0u32;
        for idx in 0..NUM_GPIOS {
            if self.gpio[idx].is_some() && self.pins.get(idx) {
                idr |= 1 << idx;
            }
        }
        Ok((adc_values, idr))
    }
}

/// Copies the current inputs into the `adc_value` and `gpio_idr` registers.
fn refresh_inputs<P: PinController, A: AdcReader>(
    hw: &Mutex<IoHardware<P, A>>,
    table: &mut ControlTable,
) -> Result<(), BusError> {
    let sampled = match hw.lock() {
        Ok(mut hw) => hw.sample_inputs(table)?,
        Err(_) => return Ok(()),
    };
    let (adc_values, idr) = sampled;
    table.write(ADC_VALUE_OFFSET, &adc_values, false)?;
    table.write(GPIO_IDR_OFFSET, &idr.to_le_bytes(), false)
}

/// Subscription over `[offset, offset + len)` that forwards to `handler`
/// with the hardware locked.
fn subscribe_hw<P, A>(
    hw: &Arc<Mutex<IoHardware<P, A>>>,
    offset: usize,
    len: usize,
    handler: fn(&mut IoHardware<P, A>, usize, &[u8]),
) -> Subscription
where
    P: PinController + 'static,
    A: AdcReader + 'static,
{
    let hw = Arc::clone(hw);
    Subscription::new(offset, len, move |offset, bytes| {
        if let Ok(mut hw) = hw.lock() {
            handler(&mut hw, offset, bytes);
        }
    })
}

/// Builds a simulated I/O adapter answering to `dev_id` until another id
/// is saved in `storage`.
pub fn fake_io_adapter<P, A>(
    dev_id: u8,
    storage: impl Storage + 'static,
    pins: P,
    adcs: A,
) -> Result<DeviceProtocolHandler, BusError>
where
    P: PinController + 'static,
    A: AdcReader + 'static,
{
    let hw = Arc::new(Mutex::new(IoHardware {
        pins,
        adcs,
        gpio: [None; NUM_GPIOS],
        gpio_cfg: [GpioConfig::INPUT; NUM_GPIOS],
        adc: [None; NUM_ADCS],
    }));

    let subscriptions = vec![
        Subscription::new(LED_OFFSET, 1, |_, bytes| {
            info!("LED {}", if bytes[0] != 0 { "on" } else { "off" });
        }),
        subscribe_hw(&hw, ADC_PIN_OFFSET, NUM_ADCS, IoHardware::adc_pins_updated),
        subscribe_hw(&hw, GPIO_PIN_OFFSET, NUM_GPIOS, IoHardware::gpio_pins_updated),
        subscribe_hw(&hw, GPIO_CFG_OFFSET, NUM_GPIOS, IoHardware::gpio_cfg_updated),
        subscribe_hw(&hw, GPIO_SET_OFFSET, 4, IoHardware::gpio_set_updated),
        subscribe_hw(&hw, GPIO_CLEAR_OFFSET, 4, IoHardware::gpio_clear_updated),
        subscribe_hw(&hw, GPIO_ODR_OFFSET, 4, IoHardware::gpio_odr_updated),
    ];

    let defaults = IoAdapterRegisters::defaults(dev_id);
    let table = ControlTable::new(defaults.as_bytes(), IO_ADAPTER_PERSISTENT_LEN, subscriptions, storage)?;
    let mut device = DeviceProtocolHandler::new(table);
    device.set_packet_hook(move |table| {
        if let Err(e) = refresh_inputs(&hw, table) {
            warn!("Unable to refresh inputs: {e}");
        }
    });
    Ok(device)
}
