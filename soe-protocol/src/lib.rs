//! SOE Protocol Core Implementation
//!
//! This crate implements the core of the SOE reliable-UDP session protocol:
//! the packet vocabulary, sequence arithmetic, message buffers, fragmentation
//! and multi-data coalescing, the send window with sequence rollover,
//! acknowledgment tracking, window control and the session state machine.
//!
//! Nothing here performs I/O. Datagram obfuscation lives in `soe-crypto` and
//! sockets in `soe-io`.

pub mod ack;
pub mod config;
pub mod congestion;
pub mod fragment;
pub mod message;
pub mod packet;
pub mod sequence;
pub mod session;
pub mod window;

pub use ack::{Arrival, ReceiveTracker, RttEstimator, RttStats};
pub use config::{ConfigError, SessionConfig, WindowConfig};
pub use congestion::{WindowController, WindowStats};
pub use fragment::{BuiltPacket, FragmentMarker, Packetizer, Reassembler, ReassemblyError};
pub use message::{Message, MessageError, MessageFactory, MessageQueue, Priority};
pub use packet::{
    Channel, NetStatusRequest, NetStatusResponse, Opcode, PacketError, PacketType, SessionPacket,
};
pub use sequence::SeqNumber;
pub use session::{
    Role, Session, SessionCommand, SessionError, SessionStats, SessionStatus, WireParams,
    WriteTickReport,
};
pub use window::{AckOutcome, Resend, SendWindow, WindowEntry};
