//! SOE - reliable-UDP sessions
//!
//! High-level API: a [`Service`] hosts sessions over one UDP socket, and each
//! [`Session`] offers ordered, fragmented, acknowledged message delivery.

pub use soe_crypto as crypto;
pub use soe_io as io;
pub use soe_protocol as protocol;

pub mod service;

pub use service::{Service, ServiceConfig, ServiceError, ServiceStats};

// Re-export commonly used types
pub use protocol::{
    Channel, Message, MessageFactory, Priority, SeqNumber, Session, SessionConfig, SessionError,
    SessionStats, SessionStatus,
};
