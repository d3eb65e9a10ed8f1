use crate::constants::{DEV_ID_OFFSET, MAX_PARAMS};
use crate::control_table::ControlTable;
use crate::dump_mem::trace_dump;
use crate::error::BusError;
use crate::packet::{Command, ErrorCode, Id, Packet, PacketKind, PacketParser, ParseResult};
use bytes::Bytes;
use std::fmt;
use tracing::{debug, error, warn};

type PacketHook = Box<dyn FnMut(&mut ControlTable) + Send>;

/// Device side of the bus: parses requests one byte at a time and answers
/// them from a [`ControlTable`].
pub struct DeviceProtocolHandler {
    table: ControlTable,
    parser: PacketParser,
    /// Offset and data of a REG_WRITE waiting for ACTION
    deferred: Option<(usize, Bytes)>,
    /// Sticky flags OR'ed into every status packet
    status: ErrorCode,
    /// Runs before every request addressed to this device is dispatched
    packet_hook: Option<PacketHook>,
}

impl DeviceProtocolHandler {
    pub fn new(table: ControlTable) -> Self {
        Self {
            table,
            parser: PacketParser::new(PacketKind::Instruction),
            deferred: None,
            status: ErrorCode::NONE,
            packet_hook: None,
        }
    }

    /// Installs `hook`, called with the control table just before each
    /// request addressed to this device (or broadcast) is handled. Devices
    /// with inputs use it to refresh the registers a READ would return.
    pub fn set_packet_hook(&mut self, hook: impl FnMut(&mut ControlTable) + Send + 'static) {
        self.packet_hook = Some(Box::new(hook));
    }

    /// The id this device currently answers to, read from its control table.
    pub fn dev_id(&self) -> u8 {
        self.table
            .as_bytes()
            .get(DEV_ID_OFFSET)
            .copied()
            .unwrap_or(Id::INVALID.value())
    }

    pub fn table(&self) -> &ControlTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ControlTable {
        &mut self.table
    }

    pub fn status(&self) -> ErrorCode {
        self.status
    }

    /// Sets the flags reported in every status packet, e.g. OVERHEATING.
    pub fn set_status(&mut self, status: ErrorCode) {
        if status.is_pseudo() {
            warn!("Ignoring pseudo status {status}");
            return;
        }
        self.status = status;
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    /// Feeds one received byte. Returns the status packet to transmit, if
    /// the byte completed a request that needs an answer.
    pub fn process_byte(&mut self, byte: u8) -> Option<Packet> {
        match self.parser.process_byte(byte) {
            ParseResult::NotDone => None,
            ParseResult::Packet(packet) => self.packet_received(&packet),
            ParseResult::Checksum(packet) => {
                if packet.dev_id() != self.dev_id() {
                    return None;
                }
                debug!("Rcvd packet for ID: {} with bad checksum", packet.dev_id());
                trace_dump("  R", packet.as_bytes());
                self.reply(packet.dev_id(), ErrorCode::CHECKSUM, &[])
            }
            ParseResult::TooMuchData { dev_id, length } => {
                debug!(dev_id, length, "Dropping oversized packet");
                None
            }
        }
    }

    fn packet_received(&mut self, packet: &Packet) -> Option<Packet> {
        let id = self.dev_id();
        if packet.dev_id() != id && !packet.id().is_broadcast() {
            return None;
        }
        let broadcast = packet.id().is_broadcast();
        match packet.command() {
            Some(cmd) => debug!("Rcvd packet for ID: {} Cmd: {cmd}", packet.dev_id()),
            None => debug!("Rcvd packet for ID: {} Cmd: 0x{:02x}", packet.dev_id(), packet.opcode()),
        }
        trace_dump("  R", packet.as_bytes());
        if let Some(hook) = self.packet_hook.as_mut() {
            hook(&mut self.table);
        }

        let Some(command) = packet.command() else {
            return self.reply(id, ErrorCode::INSTRUCTION, &[]);
        };
        match command {
            Command::Ping => self.unicast_reply(broadcast, id, ErrorCode::NONE, &[]),
            Command::Read => {
                if broadcast {
                    return None;
                }
                let (Some(offset), Some(len)) = (packet.param(0), packet.param(1)) else {
                    return self.reply(id, ErrorCode::RANGE, &[]);
                };
                let (offset, len) = (offset as usize, len as usize);
                if len > MAX_PARAMS || !self.table.contains(offset, len) {
                    return self.reply(id, ErrorCode::RANGE, &[]);
                }
                let data = self.table.as_bytes()[offset..offset + len].to_vec();
                self.reply(id, ErrorCode::NONE, &data)
            }
            Command::Write => {
                let Some((offset, data)) = self.write_args(packet) else {
                    return self.unicast_reply(broadcast, id, ErrorCode::RANGE, &[]);
                };
                // The reply goes out under the id we had before the write.
                let error = match self.apply_write(offset, data) {
                    Ok(()) => ErrorCode::NONE,
                    Err(_) => ErrorCode::RANGE,
                };
                self.unicast_reply(broadcast, id, error, &[])
            }
            Command::RegWrite => {
                if broadcast {
                    return None;
                }
                let Some((offset, data)) = self.write_args(packet) else {
                    return self.reply(id, ErrorCode::RANGE, &[]);
                };
                self.deferred = Some((offset, Bytes::copy_from_slice(data)));
                self.reply(id, ErrorCode::NONE, &[])
            }
            Command::Action => {
                if let Some((offset, data)) = self.deferred.take() {
                    let _ = self.apply_write(offset, &data);
                }
                None
            }
            Command::Reset => {
                let status = self.reply(id, ErrorCode::NONE, &[]);
                if let Err(e) = self.table.reset() {
                    error!("Failed to reset control table: {e}");
                }
                status
            }
            Command::SyncWrite => {
                self.sync_write(packet.params(), id);
                None
            }
        }
    }

    /// Splits WRITE/REG_WRITE params into an in-range `(offset, data)`.
    fn write_args<'a>(&self, packet: &'a Packet) -> Option<(usize, &'a [u8])> {
        let (&offset, data) = packet.params().split_first()?;
        self.table.contains(offset as usize, data.len()).then_some((offset as usize, data))
    }

    /// Looks for our id in `offset, len, (id, data[len])*` and applies our slice.
    fn sync_write(&mut self, params: &[u8], id: u8) {
        let [offset, len, entries @ ..] = params else {
            return;
        };
        let entry_len = *len as usize + 1;
        let Some(entry) = entries
            .chunks_exact(entry_len)
            .find(|entry| entry[0] == id)
        else {
            return;
        };
        let data = &entry[1..];
        if self.table.contains(*offset as usize, data.len()) {
            let _ = self.apply_write(*offset as usize, data);
        } else {
            debug!("SYNC_WRITE for ID: {id} is out of range");
        }
    }

    fn apply_write(&mut self, offset: usize, data: &[u8]) -> Result<(), BusError> {
        self.table.write(offset, data, true).inspect_err(|e| {
            error!("Failed to write control table at 0x{offset:02x}: {e}");
        })
    }

    fn unicast_reply(&self, broadcast: bool, id: u8, error: ErrorCode, params: &[u8]) -> Option<Packet> {
        if broadcast {
            None
        } else {
            self.reply(id, error, params)
        }
    }

    fn reply(&self, id: u8, error: ErrorCode, params: &[u8]) -> Option<Packet> {
        let error = self.status | error;
        match Packet::status(id, error, params) {
            Ok(packet) => {
                debug!("Sending Status: {error} from ID: {id}");
                trace_dump("  W", packet.as_bytes());
                Some(packet)
            }
            Err(e) => {
                error!("Unable to build status packet: {e}");
                None
            }
        }
    }

    /// Runs a whole byte slice through [`Self::process_byte`], collecting every
    /// status packet produced.
    pub fn process_bytes(&mut self, bytes: &[u8]) -> Vec<Packet> {
        bytes.iter().filter_map(|&byte| self.process_byte(byte)).collect()
    }
}

impl fmt::Debug for DeviceProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceProtocolHandler")
            .field("table", &self.table)
            .field("parser", &self.parser)
            .field("deferred", &self.deferred)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
