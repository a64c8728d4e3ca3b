//! UDP socket wrapper for SOE sessions
//!
//! [`DatagramSocket`] is the only thing the service needs from the network.
//! [`SoeSocket`] implements it over a UDP socket configured with socket2.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

/// Datagram transport used by the service
///
/// Implementations must be shareable between the read and write workers.
pub trait DatagramSocket: Send + Sync {
    /// Receive one datagram, returning its length and sender
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Options applied when binding a [`SoeSocket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    /// Blocking receive timeout; `None` makes the socket non-blocking
    pub read_timeout: Option<Duration>,
    pub reuse_address: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            send_buffer_size: Some(256 * 1024),
            recv_buffer_size: Some(256 * 1024),
            read_timeout: None,
            reuse_address: true,
        }
    }
}

/// UDP socket configured for SOE traffic
#[derive(Debug)]
pub struct SoeSocket {
    inner: UdpSocket,
}

impl SoeSocket {
    /// Bind a non-blocking socket with default options
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        Self::bind_with(addr, SocketOptions::default())
    }

    /// Bind a socket with explicit options
    pub fn bind_with(addr: SocketAddr, options: SocketOptions) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if options.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if let Some(size) = options.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = options.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }

        socket.bind(&addr.into())?;

        match options.read_timeout {
            Some(timeout) => socket.set_read_timeout(Some(timeout))?,
            None => socket.set_nonblocking(true)?,
        }

        tracing::debug!("Bound UDP socket on {}", addr);
        Ok(SoeSocket {
            inner: socket.into(),
        })
    }

    /// Get the send buffer size
    pub fn send_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).send_buffer_size()?)
    }

    /// Get the receive buffer size
    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).recv_buffer_size()?)
    }

    /// Try to clone the socket
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(SoeSocket {
            inner: self.inner.try_clone()?,
        })
    }

    /// Get a reference to the underlying socket
    pub fn as_udp_socket(&self) -> &UdpSocket {
        &self.inner
    }
}

impl DatagramSocket for SoeSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Whether an I/O error only means "nothing to do right now"
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_creation() {
        let socket = SoeSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn test_socket_buffer_sizes() {
        let socket = SoeSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        // May not match exactly due to OS limits
        assert!(socket.send_buffer_size().unwrap() > 0);
        assert!(socket.recv_buffer_size().unwrap() > 0);
    }

    #[test]
    fn test_socket_send_recv() {
        let sender = SoeSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let options = SocketOptions {
            read_timeout: Some(Duration::from_millis(500)),
            ..SocketOptions::default()
        };
        let receiver = SoeSocket::bind_with("127.0.0.1:0".parse().unwrap(), options).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let data = [0x00, 0x06];
        sender.send_to(&data, receiver_addr).unwrap();

        let mut buf = [0u8; 512];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &data);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_nonblocking_recv_is_transient() {
        let socket = SoeSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(is_transient(&err));
    }

    #[test]
    fn test_socket_ipv6() {
        // May fail on systems without IPv6
        if let Ok(socket) = SoeSocket::bind("[::1]:0".parse().unwrap()) {
            let addr = socket.local_addr().unwrap();
            assert!(addr.is_ipv6());
        }
    }
}
