pub mod bus;
pub mod config;
pub mod constants;
pub mod control_table;
pub mod device;
pub mod dump_mem;
pub mod error;
pub mod io_adapter;
pub mod packet;
pub mod scan;
pub mod servo;
pub mod transport;


// Re-export the types most callers need
pub use bus::Bus;
pub use config::BusConfig;
pub use control_table::{ControlTable, FileStorage, MemoryStorage, Storage, Subscription};
pub use device::DeviceProtocolHandler;
pub use error::BusError;
pub use packet::{Command, ErrorCode, Id, Packet, PacketKind, PacketParser, ParseResult};
pub use scan::{DeviceSummary, Scanner};
pub use transport::{LoopbackBus, TcpTransport, Transport};
