//! # Bioloid packet format
//!
//! Every message on the bus uses the same frame:
//!
//! ```text
//! FF FF <id> <len> <opcode|error> <param0 .. paramN> <checksum>
//! ```
//!
//! `len` counts the parameters plus two (the opcode/error byte and the
//! checksum). The checksum is the complement of the byte sum starting at
//! `<id>`. Status packets (device responses) leave the error byte out of that
//! sum, request packets include the opcode.
//!
//! - **`Packet`**: one complete frame, built by [`Packet::instruction`] /
//!   [`Packet::status`] or produced by the parser.
//! - **`PacketParser`**: byte-at-a-time state machine which resynchronises on
//!   the next `FF FF` pair after noise or a bad checksum.

use crate::constants::*;
use crate::error::BusError;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use strum_macros::Display;
use tracing::trace;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A device address on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Id(pub u8);

impl Id {
    /// Accepted by every device, answered by none.
    pub const BROADCAST: Id = Id(0xFE);
    /// Never a valid address; a frame can't start with it.
    pub const INVALID: Id = Id(0xFF);

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Id::BROADCAST
    }
}

impl From<u8> for Id {
    fn from(value: u8) -> Self {
        Id(value)
    }
}

impl From<Id> for u8 {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Id::BROADCAST => write!(f, "BROADCAST"),
            Id::INVALID => write!(f, "INVALID"),
            Id(id) => write!(f, "0x{id:02x}"),
        }
    }
}

/// Instruction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Command {
    /// Used to obtain a status packet
    #[strum(to_string = "PING")]
    Ping = 0x01,
    /// Read values from the control table
    #[strum(to_string = "READ")]
    Read = 0x02,
    /// Write values to the control table
    #[strum(to_string = "WRITE")]
    Write = 0x03,
    /// Prime values to write when ACTION is sent
    #[strum(to_string = "REG_WRITE")]
    RegWrite = 0x04,
    /// Triggers a staged REG_WRITE
    #[strum(to_string = "ACTION")]
    Action = 0x05,
    /// Changes control values back to factory defaults
    #[strum(to_string = "RESET")]
    Reset = 0x06,
    /// Writes values to many devices (controller only)
    #[strum(to_string = "SYNC_WRITE")]
    SyncWrite = 0x83,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Ping,
        Command::Read,
        Command::Write,
        Command::RegWrite,
        Command::Action,
        Command::Reset,
        Command::SyncWrite,
    ];
}

impl FromStr for Command {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|cmd| cmd.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BusError::InvalidArgument(format!("Unrecognized command: '{s}'")))
    }
}

/// Error flags carried in the error byte of a status packet.
///
/// The low 8 bits are the wire flags. `NOT_DONE`, `TIMEOUT` and
/// `TOO_MUCH_DATA` are local pseudo-codes and are never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ErrorCode(u16);

impl ErrorCode {
    pub const NONE: ErrorCode = ErrorCode(0x00);
    /// Input voltage out of range
    pub const INPUT_VOLTAGE: ErrorCode = ErrorCode(0x01);
    /// Goal position is outside of the limit range
    pub const ANGLE_LIMIT: ErrorCode = ErrorCode(0x02);
    /// Internal temperature is too high
    pub const OVERHEATING: ErrorCode = ErrorCode(0x04);
    /// Instruction is out of range
    pub const RANGE: ErrorCode = ErrorCode(0x08);
    /// Checksum of the instruction packet is incorrect
    pub const CHECKSUM: ErrorCode = ErrorCode(0x10);
    /// Max torque can't control the applied load
    pub const OVERLOAD: ErrorCode = ErrorCode(0x20);
    /// Undefined instruction
    pub const INSTRUCTION: ErrorCode = ErrorCode(0x40);
    /// Reserved, should be zero
    pub const RESERVED: ErrorCode = ErrorCode(0x80);
    pub const ALL: ErrorCode = ErrorCode(0x7F);

    pub const NOT_DONE: ErrorCode = ErrorCode(0x100);
    pub const TIMEOUT: ErrorCode = ErrorCode(0x101);
    pub const TOO_MUCH_DATA: ErrorCode = ErrorCode(0x102);

    const NAMES: [&'static str; 8] = [
        "InputVoltage",
        "AngleLimit",
        "OverHeating",
        "Range",
        "Checksum",
        "Overload",
        "Instruction",
        "Reserved",
    ];

    pub fn from_wire(byte: u8) -> Self {
        ErrorCode(byte as u16)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// The value placed in the error byte of a status packet.
    pub fn wire_byte(self) -> u8 {
        debug_assert!(!self.is_pseudo(), "{self:?} is never transmitted");
        (self.0 & 0xFF) as u8
    }

    pub fn is_none(self) -> bool {
        self == ErrorCode::NONE
    }

    pub fn is_pseudo(self) -> bool {
        self.0 > 0xFF
    }

    pub fn contains(self, other: ErrorCode) -> bool {
        !other.is_pseudo() && !self.is_pseudo() && self.0 & other.0 == other.0
    }
}

impl BitOr for ErrorCode {
    type Output = ErrorCode;

    fn bitor(self, rhs: Self) -> Self::Output {
        ErrorCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorCode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorCode::NONE => return write!(f, "None"),
            ErrorCode::NOT_DONE => return write!(f, "NotDone"),
            ErrorCode::TIMEOUT => return write!(f, "Timeout"),
            ErrorCode::TOO_MUCH_DATA => return write!(f, "TooMuchData"),
            ErrorCode::ALL => return write!(f, "All"),
            _ => {}
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

impl FromStr for ErrorCode {
    type Err = BusError;

    /// Parses `None`, `All` or a comma separated list of flag names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("none") {
            return Ok(ErrorCode::NONE);
        }
        if s.eq_ignore_ascii_case("all") {
            return Ok(ErrorCode::ALL);
        }
        let mut code = ErrorCode::NONE;
        for word in s.split(',') {
            let word = word.trim();
            let bit = Self::NAMES
                .iter()
                .position(|name| name.eq_ignore_ascii_case(word))
                .ok_or_else(|| BusError::InvalidArgument(format!("Invalid mask string '{word}'")))?;
            code |= ErrorCode(1 << bit);
        }
        Ok(code)
    }
}

/// Which checksum contract a frame follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Controller to device; the opcode is part of the checksum.
    Instruction,
    /// Device to controller; the error byte is left out of the checksum.
    Status,
}

/// Complement of the byte sum, truncated to 8 bits.
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// One complete frame, preamble and checksum included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Bytes,
}

impl Packet {
    /// Builds a request packet.
    pub fn instruction(id: impl Into<Id>, command: Command, params: &[u8]) -> Result<Self, BusError> {
        Self::request(id, command.into(), params)
    }

    /// Builds a request packet with an arbitrary opcode.
    pub fn request(id: impl Into<Id>, opcode: u8, params: &[u8]) -> Result<Self, BusError> {
        Self::frame(id.into(), opcode, params, PacketKind::Instruction)
    }

    /// Builds a status packet carrying `error` in the opcode slot.
    pub fn status(id: impl Into<Id>, error: ErrorCode, params: &[u8]) -> Result<Self, BusError> {
        Self::frame(id.into(), error.wire_byte(), params, PacketKind::Status)
    }

    fn frame(id: Id, opcode: u8, params: &[u8], kind: PacketKind) -> Result<Self, BusError> {
        if params.len() > MAX_PARAMS {
            return Err(BusError::TooMuchData {
                len: params.len(),
                max: MAX_PARAMS,
            });
        }
        let length = (params.len() + LENGTH_OVERHEAD) as u8;
        let mut buf = BytesMut::with_capacity(MIN_PACKET_SIZE + params.len());
        buf.put_slice(&[PREAMBLE, PREAMBLE, id.value(), length, opcode]);
        buf.put_slice(params);

        let mut sum = id.value().wrapping_add(length);
        if kind == PacketKind::Instruction {
            sum = sum.wrapping_add(opcode);
        }
        sum = params.iter().fold(sum, |acc, b| acc.wrapping_add(*b));
        buf.put_u8(!sum);

        Ok(Packet { bytes: buf.freeze() })
    }

    /// Parses the first complete frame found in `bytes`.
    pub fn from_bytes(bytes: &[u8], kind: PacketKind) -> Result<Self, BusError> {
        let mut parser = PacketParser::new(kind);
        for byte in bytes {
            match parser.process_byte(*byte) {
                ParseResult::NotDone => {}
                ParseResult::Packet(packet) => return Ok(packet),
                ParseResult::Checksum(_) => return Err(BusError::Checksum),
                ParseResult::TooMuchData { length, .. } => {
                    return Err(BusError::TooMuchData {
                        len: length as usize - LENGTH_OVERHEAD,
                        max: parser.max_params(),
                    });
                }
            }
        }
        Err(BusError::InvalidArgument(format!(
            "{} bytes do not contain a complete packet",
            bytes.len()
        )))
    }

    pub fn id(&self) -> Id {
        Id(self.bytes[2])
    }

    pub fn dev_id(&self) -> u8 {
        self.bytes[2]
    }

    pub fn length(&self) -> u8 {
        self.bytes[3]
    }

    /// Raw opcode (request) or error byte (status).
    pub fn opcode(&self) -> u8 {
        self.bytes[OPCODE_INDEX]
    }

    /// The command of a request packet, or `None` for an unknown opcode.
    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.opcode()).ok()
    }

    /// The error code of a status packet.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_wire(self.opcode())
    }

    pub fn params(&self) -> &[u8] {
        &self.bytes[PARAMS_INDEX..self.bytes.len() - 1]
    }

    pub fn param_len(&self) -> usize {
        self.params().len()
    }

    pub fn param(&self, idx: usize) -> Option<u8> {
        self.params().get(idx).copied()
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Packet> for Bytes {
    fn from(packet: Packet) -> Self {
        packet.bytes
    }
}

/// Outcome of feeding one byte to a [`PacketParser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// More bytes are needed.
    NotDone,
    /// A structurally valid frame with a matching checksum.
    Packet(Packet),
    /// A complete frame whose checksum did not match.
    Checksum(Packet),
    /// The length byte announced more parameters than the parser accepts.
    TooMuchData { dev_id: u8, length: u8 },
}

impl ParseResult {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ParseResult::NotDone => ErrorCode::NOT_DONE,
            ParseResult::Packet(_) => ErrorCode::NONE,
            ParseResult::Checksum(_) => ErrorCode::CHECKSUM,
            ParseResult::TooMuchData { .. } => ErrorCode::TOO_MUCH_DATA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Sync0,
    Sync1,
    Address,
    Length,
    Opcode,
    Params,
    Checksum,
}

/// Incremental frame parser. One instance is reused for a whole byte stream.
#[derive(Debug, Clone)]
pub struct PacketParser {
    kind: PacketKind,
    state: ParseState,
    buf: BytesMut,
    frame_len: usize,
    sum: u8,
    max_params: usize,
}

impl PacketParser {
    pub fn new(kind: PacketKind) -> Self {
        Self::with_max_params(kind, MAX_PARAMS)
    }

    /// A parser which rejects frames carrying more than `max_params` parameters.
    pub fn with_max_params(kind: PacketKind, max_params: usize) -> Self {
        Self {
            kind,
            state: ParseState::Sync0,
            buf: BytesMut::with_capacity(MIN_PACKET_SIZE + max_params.min(MAX_PARAMS)),
            frame_len: 0,
            sum: 0,
            max_params: max_params.min(MAX_PARAMS),
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn max_params(&self) -> usize {
        self.max_params
    }

    /// Bytes of the frame collected so far.
    pub fn partial(&self) -> &[u8] {
        &self.buf
    }

    /// Drops any partial frame and waits for the next preamble.
    pub fn reset(&mut self) {
        self.state = ParseState::Sync0;
        self.buf.clear();
        self.frame_len = 0;
        self.sum = 0;
    }

    /// Runs a single byte through the state machine.
    pub fn process_byte(&mut self, byte: u8) -> ParseResult {
        match self.state {
            ParseState::Sync0 => {
                if byte == PREAMBLE {
                    self.state = ParseState::Sync1;
                }
            }
            ParseState::Sync1 => {
                self.state = if byte == PREAMBLE {
                    ParseState::Address
                } else {
                    ParseState::Sync0
                };
            }
            ParseState::Address => {
                // Extra preamble bytes are still sync noise.
                if byte != PREAMBLE {
                    self.buf.clear();
                    self.buf.put_slice(&[PREAMBLE, PREAMBLE, byte]);
                    self.sum = byte;
                    self.state = ParseState::Length;
                }
            }
            ParseState::Length => {
                let length = byte as usize;
                if length < LENGTH_OVERHEAD {
                    trace!(length, "Discarding frame with impossible length");
                    self.reset();
                    return ParseResult::NotDone;
                }
                if length - LENGTH_OVERHEAD > self.max_params {
                    let dev_id = self.buf[2];
                    self.reset();
                    return ParseResult::TooMuchData { dev_id, length: byte };
                }
                self.buf.put_u8(byte);
                self.sum = self.sum.wrapping_add(byte);
                self.frame_len = length + HEADER_SIZE;
                self.state = ParseState::Opcode;
            }
            ParseState::Opcode => {
                self.buf.put_u8(byte);
                if self.kind == PacketKind::Instruction {
                    self.sum = self.sum.wrapping_add(byte);
                }
                self.state = self.after_data_byte();
            }
            ParseState::Params => {
                self.buf.put_u8(byte);
                self.sum = self.sum.wrapping_add(byte);
                self.state = self.after_data_byte();
            }
            ParseState::Checksum => {
                self.buf.put_u8(byte);
                let valid = !self.sum == byte;
                let packet = Packet {
                    bytes: self.buf.split().freeze(),
                };
                self.reset();
                return if valid {
                    ParseResult::Packet(packet)
                } else {
                    ParseResult::Checksum(packet)
                };
            }
        }
        ParseResult::NotDone
    }

    fn after_data_byte(&self) -> ParseState {
        if self.buf.len() + 1 == self.frame_len {
            ParseState::Checksum
        } else {
            ParseState::Params
        }
    }
}
