//! SOE I/O and Platform Abstraction
//!
//! This crate provides the datagram socket seam used by the service, a
//! socket2-backed UDP implementation, and periodic deadlines for the workers.

pub mod socket;
pub mod time;

pub use socket::{is_transient, DatagramSocket, SocketError, SocketOptions, SoeSocket};
pub use time::Interval;
