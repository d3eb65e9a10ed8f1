// Protocol constants for the Bioloid bus

/// Preamble byte; every frame starts with two of them
pub const PREAMBLE: u8 = 0xFF;

/// Size of the frame header (2 preamble bytes, id, length)
pub const HEADER_SIZE: usize = 4;

/// Offset of the opcode / error byte within a frame
pub const OPCODE_INDEX: usize = 4;

/// Offset of the first parameter byte within a frame
pub const PARAMS_INDEX: usize = 5;

/// The length byte counts the parameters plus the opcode and the checksum
pub const LENGTH_OVERHEAD: usize = 2;

/// Largest number of parameter bytes a length byte can describe
pub const MAX_PARAMS: usize = u8::MAX as usize - LENGTH_OVERHEAD;

/// Smallest possible frame (no parameters)
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + LENGTH_OVERHEAD;

/// Nominal maximum delay before a device starts answering (microseconds)
pub const MAX_RESPONSE_DELAY_US: u64 = 500;

// Control table offsets shared by every device type

/// Model number (u16, little endian)
pub const MODEL_OFFSET: usize = 0x00;

/// Firmware version
pub const VERSION_OFFSET: usize = 0x02;

/// Device id used for addressing
pub const DEV_ID_OFFSET: usize = 0x03;

/// Baud rate register; baud = 2_000_000 / (value + 1)
pub const BAUD_OFFSET: usize = 0x04;

/// Return delay time register, in units of 2 microseconds
pub const RDT_OFFSET: usize = 0x05;

/// LED register
pub const LED_OFFSET: usize = 0x19;

pub const INITIAL_DEV_ID: u8 = 0;

/// Corresponds to 1 Mbit
pub const INITIAL_BAUD: u8 = 1;

/// Corresponds to 500 microseconds
pub const INITIAL_RDT: u8 = 250;

/// Converts a baud rate register value into bits per second
pub fn baud_from_register(value: u8) -> u32 {
    2_000_000 / (value as u32 + 1)
}
