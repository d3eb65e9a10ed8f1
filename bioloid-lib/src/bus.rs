use crate::config::BusConfig;
use crate::constants::MAX_PARAMS;
use crate::dump_mem::trace_dump;
use crate::error::BusError;
use crate::packet::{Command, ErrorCode, Id, Packet, PacketKind, PacketParser, ParseResult};
use crate::transport::Transport;
use bytes::Bytes;
use tracing::{debug, warn};

/// Controller side of the bus.
///
/// Requests are strictly sequential: every method sends one packet and, for
/// unicast commands, waits for the matching status packet (or a timeout)
/// before returning. Broadcast commands never wait.
pub struct Bus<T> {
    transport: T,
    config: BusConfig,
}

impl<T: Transport> Bus<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, BusConfig::default())
    }

    pub fn with_config(transport: T, config: BusConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Broadcasts ACTION, which makes every device commit its deferred write.
    pub async fn action(&mut self) -> Result<(), BusError> {
        debug!("Broadcasting ACTION");
        self.send(Id::BROADCAST, Command::Action, &[]).await
    }

    /// Returns `true` if the device answers, `false` on timeout.
    ///
    /// Any other failure, including a status packet with an error set, is
    /// returned as an error.
    pub async fn ping(&mut self, id: impl Into<Id>) -> Result<bool, BusError> {
        let id = id.into();
        debug!("Sending PING to ID {}", id.value());
        self.send(id, Command::Ping, &[]).await?;
        match self.read_status_packet().await {
            Ok(_) => Ok(true),
            Err(BusError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Reads `len` bytes of the device's control table starting at `offset`.
    pub async fn read(&mut self, id: impl Into<Id>, offset: u8, len: u8) -> Result<Bytes, BusError> {
        let id = id.into();
        debug!("Sending READ to ID {} offset 0x{offset:02x} len {len}", id.value());
        self.send(id, Command::Read, &[offset, len]).await?;
        let packet = self.read_status_packet().await?;
        if packet.param_len() != len as usize {
            warn!(
                expected = len,
                got = packet.param_len(),
                "READ response length differs from the request"
            );
        }
        Ok(Bytes::copy_from_slice(packet.params()))
    }

    /// Sends WRITE, or REG_WRITE when `deferred` is set.
    ///
    /// A broadcast write returns `NONE` straight away since no device answers
    /// it. Deferred writes take effect on the next [`Bus::action`].
    pub async fn write(
        &mut self,
        id: impl Into<Id>,
        offset: u8,
        data: &[u8],
        deferred: bool,
    ) -> Result<ErrorCode, BusError> {
        let id = id.into();
        let command = if deferred { Command::RegWrite } else { Command::Write };
        if id.is_broadcast() {
            debug!("Broadcasting {command} offset 0x{offset:02x} len {}", data.len());
        } else {
            debug!(
                "Sending {command} to ID {} offset 0x{offset:02x} len {}",
                id.value(),
                data.len()
            );
        }
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(offset);
        params.extend_from_slice(data);
        self.send(id, command, &params).await?;
        if id.is_broadcast() {
            return Ok(ErrorCode::NONE);
        }
        Ok(self.read_status_packet().await?.error_code())
    }

    /// Asks the device to restore its factory defaults.
    pub async fn reset(&mut self, id: impl Into<Id>) -> Result<ErrorCode, BusError> {
        let id = id.into();
        if id.is_broadcast() {
            debug!("Broadcasting RESET");
        } else {
            debug!("Sending RESET to ID {}", id.value());
        }
        self.send(id, Command::Reset, &[]).await?;
        if id.is_broadcast() {
            return Ok(ErrorCode::NONE);
        }
        Ok(self.read_status_packet().await?.error_code())
    }

    /// Writes `values[i]` to device `ids[i]` at `offset`, all in one broadcast packet.
    ///
    /// Every value must have the same length. Nothing is sent when the
    /// arguments don't line up.
    pub async fn sync_write<V: AsRef<[u8]>>(
        &mut self,
        ids: &[u8],
        offset: u8,
        values: &[V],
    ) -> Result<(), BusError> {
        let payload = sync_write_params(ids, offset, values)?;
        debug!(
            "Sending SYNC_WRITE to IDs {} offset 0x{offset:02x} len {}",
            ids.iter().map(u8::to_string).collect::<Vec<_>>().join(", "),
            payload[1]
        );
        self.send(Id::BROADCAST, Command::SyncWrite, &payload).await
    }

    /// Pings every id from `start_id` up to `count` ids later, stopping
    /// before the broadcast id.
    ///
    /// Calls `on_found` / `on_missing` for each id and returns whether any
    /// device answered.
    pub async fn scan(
        &mut self,
        start_id: u8,
        count: usize,
        mut on_found: impl FnMut(Id),
        mut on_missing: impl FnMut(Id),
    ) -> Result<bool, BusError> {
        if count == 0 {
            return Ok(false);
        }
        let last_id = (start_id as usize)
            .saturating_add(count - 1)
            .min(Id::BROADCAST.value() as usize - 1);
        let mut some_dev_found = false;
        for dev_id in start_id as usize..=last_id {
            let id = Id(dev_id as u8);
            if self.ping(id).await? {
                some_dev_found = true;
                on_found(id);
            } else {
                on_missing(id);
            }
        }
        Ok(some_dev_found)
    }

    /// Waits for one status packet.
    ///
    /// A single byte timeout ends the wait. A checksum failure or a non-NONE
    /// error byte is returned as an error.
    pub async fn read_status_packet(&mut self) -> Result<Packet, BusError> {
        let mut parser = PacketParser::with_max_params(PacketKind::Status, self.config.max_status_params);
        let packet = loop {
            let Some(byte) = self.transport.read_byte().await? else {
                debug!("TIMEOUT");
                trace_dump("  R", parser.partial());
                return Err(BusError::Timeout);
            };
            match parser.process_byte(byte) {
                ParseResult::NotDone => continue,
                ParseResult::Packet(packet) => break packet,
                ParseResult::Checksum(packet) => {
                    debug!("Rcvd Status: {}", ErrorCode::CHECKSUM);
                    trace_dump("  R", packet.as_bytes());
                    return Err(BusError::Checksum);
                }
                ParseResult::TooMuchData { dev_id, length } => {
                    debug!("Rcvd Status: {} from ID: {dev_id}", ErrorCode::TOO_MUCH_DATA);
                    return Err(BusError::TooMuchData {
                        len: length as usize - 2,
                        max: parser.max_params(),
                    });
                }
            }
        };

        let err = packet.error_code();
        debug!("Rcvd Status: {err} from ID: {}", packet.dev_id());
        trace_dump("  R", packet.as_bytes());
        if !err.is_none() {
            return Err(BusError::Status(err));
        }
        Ok(packet)
    }

    async fn send(&mut self, id: Id, command: Command, params: &[u8]) -> Result<(), BusError> {
        let packet = Packet::instruction(id, command, params)?;
        trace_dump("  W", packet.as_bytes());
        self.transport.write_bytes(packet.as_bytes()).await
    }
}

/// Packs `offset, bytes_per_id, id_0, value_0.., id_1, value_1..`.
pub fn sync_write_params<V: AsRef<[u8]>>(ids: &[u8], offset: u8, values: &[V]) -> Result<Vec<u8>, BusError> {
    if ids.len() != values.len() {
        return Err(BusError::InvalidArgument(format!(
            "len(ids) = {} must match len(values) = {}",
            ids.len(),
            values.len()
        )));
    }
    let Some(first) = values.first() else {
        return Err(BusError::InvalidArgument("SYNC_WRITE needs at least one id".to_string()));
    };
    let bytes_per_id = first.as_ref().len();
    if let Some(idx) = values.iter().position(|v| v.as_ref().len() != bytes_per_id) {
        return Err(BusError::InvalidArgument(format!(
            "len(values[{idx}]) not equal {bytes_per_id}"
        )));
    }
    let param_len = ids.len() * (bytes_per_id + 1) + 2;
    if param_len > MAX_PARAMS || bytes_per_id > u8::MAX as usize {
        return Err(BusError::TooMuchData {
            len: param_len,
            max: MAX_PARAMS,
        });
    }

    let mut params = Vec::with_capacity(param_len);
    params.push(offset);
    params.push(bytes_per_id as u8);
    for (id, value) in ids.iter().zip(values) {
        params.push(*id);
        params.extend_from_slice(value.as_ref());
    }
    Ok(params)
}
