//! Byte transports the bus controller talks through.
//!
//! The protocol only needs "read one byte or time out" and "write these
//! bytes". `TcpTransport` talks to a device (or a simulated one) over a
//! socket, `LoopbackBus` wires the controller straight into in-process
//! [`DeviceProtocolHandler`]s.

use crate::config::BusConfig;
use crate::device::DeviceProtocolHandler;
use crate::error::BusError;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, info};

/// A half-duplex byte pipe to the bus.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Reads a single byte. `Ok(None)` means no byte arrived within the
    /// transport's per-byte timeout.
    async fn read_byte(&mut self) -> Result<Option<u8>, BusError>;

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BusError>;

    /// Whether a byte can be read without waiting.
    fn bytes_available(&self) -> bool {
        false
    }
}

/// Transport over a TCP connection, e.g. to a `fake_servo` server.
pub struct TcpTransport {
    stream: TcpStream,
    rx: BytesMut,
    byte_timeout: Duration,
}

impl TcpTransport {
    pub async fn connect(addr: impl ToSocketAddrs, config: &BusConfig) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(peer = ?stream.peer_addr().ok(), "Connected to bus");
        Ok(Self::new(stream, config.byte_timeout))
    }

    pub fn new(stream: TcpStream, byte_timeout: Duration) -> Self {
        Self {
            stream,
            rx: BytesMut::with_capacity(256),
            byte_timeout,
        }
    }

    pub fn byte_timeout(&self) -> Duration {
        self.byte_timeout
    }

    pub fn set_byte_timeout(&mut self, byte_timeout: Duration) {
        self.byte_timeout = byte_timeout;
    }
}

impl Transport for TcpTransport {
    async fn read_byte(&mut self) -> Result<Option<u8>, BusError> {
        if self.rx.is_empty() {
            match timeout(self.byte_timeout, self.stream.read_buf(&mut self.rx)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    debug!("Peer closed the connection");
                    return Err(BusError::Disconnected);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(Some(self.rx.get_u8()))
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn bytes_available(&self) -> bool {
        !self.rx.is_empty()
    }
}

/// Runs `device` on a TCP connection until the peer disconnects.
///
/// This is the device end of a [`TcpTransport`]: every received byte goes
/// through the protocol handler and any status packet is written back.
pub async fn serve_device(mut stream: TcpStream, device: &mut DeviceProtocolHandler) -> Result<(), BusError> {
    stream.set_nodelay(true)?;
    let mut rx = BytesMut::with_capacity(256);
    loop {
        rx.clear();
        if stream.read_buf(&mut rx).await? == 0 {
            debug!("Controller disconnected");
            return Ok(());
        }
        for &byte in rx.iter() {
            if let Some(status) = device.process_byte(byte) {
                stream.write_all(status.as_bytes()).await?;
            }
        }
        stream.flush().await?;
    }
}

/// An in-memory multi-drop bus.
///
/// Every byte written is delivered to each attached device; the status
/// packets they emit are queued for the controller to read. An empty queue
/// reads as an immediate timeout.
#[derive(Default)]
pub struct LoopbackBus {
    devices: Vec<DeviceProtocolHandler>,
    rx: VecDeque<u8>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: DeviceProtocolHandler) -> Self {
        self.add_device(device);
        self
    }

    pub fn add_device(&mut self, device: DeviceProtocolHandler) {
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[DeviceProtocolHandler] {
        &self.devices
    }

    /// The attached device currently answering to `dev_id`.
    pub fn device(&self, dev_id: u8) -> Option<&DeviceProtocolHandler> {
        self.devices.iter().find(|dev| dev.dev_id() == dev_id)
    }

    pub fn device_mut(&mut self, dev_id: u8) -> Option<&mut DeviceProtocolHandler> {
        self.devices.iter_mut().find(|dev| dev.dev_id() == dev_id)
    }

    /// Bytes queued for the controller that it has not read yet.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Transport for LoopbackBus {
    async fn read_byte(&mut self) -> Result<Option<u8>, BusError> {
        Ok(self.rx.pop_front())
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        for &byte in bytes {
            for device in &mut self.devices {
                if let Some(status) = device.process_byte(byte) {
                    self.rx.extend(status.as_bytes());
                }
            }
        }
        Ok(())
    }

    fn bytes_available(&self) -> bool {
        !self.rx.is_empty()
    }
}
