//! Session service
//!
//! A [`Service`] owns one datagram socket and every session reachable
//! through it. A read worker demultiplexes datagrams by peer address,
//! decodes them and hands them to their session; a write worker ticks every
//! session and flushes its outgoing packet queues through the codec. New
//! server-side sessions are published on a channel for [`Service::accept`].

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use soe_crypto::{CodecError, KeyGenerator, SessionCodec};
use soe_io::{is_transient, DatagramSocket, Interval, SocketError, SocketOptions, SoeSocket};
use soe_protocol::packet::Opcode;
use soe_protocol::{ConfigError, MessageFactory, Role, Session, SessionConfig};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("A session with {0} already exists")]
    SessionExists(SocketAddr),

    #[error("Session table is full ({0} sessions)")]
    TableFull(usize),

    #[error("Accept backlog is full ({0} sessions waiting)")]
    BacklogFull(usize),

    #[error("Service is shut down")]
    ShutDown,
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Configuration handed to every session
    pub session: SessionConfig,
    /// Whether unknown peers may open sessions with a session request
    pub accept_incoming: bool,
    pub max_sessions: usize,
    /// Accepted sessions waiting for [`Service::accept`] before new peers
    /// are refused
    pub accept_backlog: usize,
    /// Write worker tick period
    pub tick_interval: Duration,
    /// Period for dropping closed sessions from the table
    pub sweep_interval: Duration,
    /// How long shutdown waits for disconnects to be sent
    pub shutdown_grace: Duration,
    /// Receive buffer for one datagram
    pub max_datagram_size: usize,
    /// Spare message buffers kept by the shared factory
    pub message_pool_size: usize,
    pub socket: SocketOptions,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            session: SessionConfig::default(),
            accept_incoming: true,
            max_sessions: 1024,
            accept_backlog: 128,
            tick_interval: Duration::from_millis(10),
            sweep_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(250),
            max_datagram_size: 4096,
            message_pool_size: 1024,
            socket: SocketOptions {
                read_timeout: Some(Duration::from_millis(20)),
                ..SocketOptions::default()
            },
        }
    }
}

impl ServiceConfig {
    /// Configuration for a client that only opens outbound sessions
    pub fn client() -> Self {
        ServiceConfig {
            accept_incoming: false,
            ..ServiceConfig::default()
        }
    }
}

/// Service-wide statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceStats {
    pub sessions: usize,
    pub sessions_created: u64,
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub decode_errors: u64,
    pub send_errors: u64,
    pub unknown_peer_datagrams: u64,
    pub uptime: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_created: AtomicU64,
    datagrams_received: AtomicU64,
    datagrams_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    decode_errors: AtomicU64,
    send_errors: AtomicU64,
    unknown_peer_datagrams: AtomicU64,
}

struct Shared {
    socket: Arc<dyn DatagramSocket>,
    config: ServiceConfig,
    sessions: RwLock<HashMap<SocketAddr, Arc<Session>>>,
    keys: KeyGenerator,
    factory: Arc<MessageFactory>,
    accept_tx: Sender<Arc<Session>>,
    running: AtomicBool,
    started: Instant,
    counters: Counters,
}

/// Datagram service hosting any number of sessions
pub struct Service {
    shared: Arc<Shared>,
    accept_rx: Receiver<Arc<Session>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Bind a UDP socket and start the workers
    pub fn bind(addr: SocketAddr, config: ServiceConfig) -> Result<Self, ServiceError> {
        let socket = SoeSocket::bind_with(addr, config.socket)?;
        Self::with_socket(Arc::new(socket), config)
    }

    /// Start a service over any datagram socket
    pub fn with_socket(
        socket: Arc<dyn DatagramSocket>,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        config.session.validate()?;

        let (accept_tx, accept_rx) = bounded(config.accept_backlog.max(1));
        let shared = Arc::new(Shared {
            socket,
            factory: Arc::new(MessageFactory::new(config.message_pool_size)),
            config,
            sessions: RwLock::new(HashMap::new()),
            keys: KeyGenerator::new(),
            accept_tx,
            running: AtomicBool::new(true),
            started: Instant::now(),
            counters: Counters::default(),
        });

        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("soe-read".into())
                .spawn(move || shared.read_loop())?
        };
        let writer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("soe-write".into())
                .spawn(move || shared.write_loop())?
        };

        tracing::info!(
            "Service started on {:?}",
            shared.socket.local_addr().ok()
        );

        Ok(Service {
            shared,
            accept_rx,
            workers: Mutex::new(vec![reader, writer]),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServiceError> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Shared message factory used by every session
    pub fn message_factory(&self) -> Arc<MessageFactory> {
        Arc::clone(&self.shared.factory)
    }

    /// Open a client session to `peer`
    ///
    /// The session request goes out on the next write tick; poll
    /// [`Session::status`] for the outcome.
    pub fn connect(&self, peer: SocketAddr) -> Result<Arc<Session>, ServiceError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(ServiceError::ShutDown);
        }
        let connection_id = self.shared.keys.generate_connection_id()?;
        let session = Arc::new(Session::new_client(
            peer,
            connection_id,
            self.shared.config.session.clone(),
            Arc::clone(&self.shared.factory),
        ));

        self.shared.insert(peer, Arc::clone(&session))?;
        session.connect();
        tracing::info!("Opening session {:#010x} to {}", connection_id, peer);
        Ok(session)
    }

    /// Wait up to `timeout` for a newly accepted session
    ///
    /// Sessions that closed while waiting in the backlog are skipped.
    pub fn accept(&self, timeout: Duration) -> Option<Arc<Session>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.accept_rx.recv_timeout(remaining) {
                Ok(session) if session.status().is_terminal() => {
                    tracing::debug!("Skipping closed session from {}", session.peer());
                }
                Ok(session) => return Some(session),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    /// Take a newly accepted session without waiting
    pub fn try_accept(&self) -> Option<Arc<Session>> {
        self.accept_rx
            .try_iter()
            .find(|session| !session.status().is_terminal())
    }

    /// Session for `peer`, if one is in the table
    pub fn session(&self, peer: &SocketAddr) -> Option<Arc<Session>> {
        self.shared.sessions.read().get(peer).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.shared.sessions.read().values().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ServiceStats {
        let c = &self.shared.counters;
        ServiceStats {
            sessions: self.shared.sessions.read().len(),
            sessions_created: c.sessions_created.load(Ordering::Relaxed),
            datagrams_received: c.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: c.datagrams_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            unknown_peer_datagrams: c.unknown_peer_datagrams.load(Ordering::Relaxed),
            uptime: self.shared.started.elapsed(),
        }
    }

    /// Disconnect every session, stop the workers and destroy the sessions
    pub fn shutdown(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }

        let sessions = self.sessions();
        for session in &sessions {
            session.disconnect();
        }

        // Give the write worker a chance to flush the disconnects
        let deadline = Instant::now() + self.shared.config.shutdown_grace;
        while Instant::now() < deadline
            && sessions.iter().any(|s| !s.status().is_terminal())
        {
            thread::sleep(self.shared.config.tick_interval);
        }

        self.shared.running.store(false, Ordering::Release);
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                tracing::error!("Service worker panicked");
            }
        }

        let mut table = self.shared.sessions.write();
        for session in table.values() {
            session.mark_destroyed();
        }
        tracing::info!("Service shut down, {} sessions destroyed", table.len());
        table.clear();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("local_addr", &self.shared.socket.local_addr().ok())
            .field("sessions", &self.shared.sessions.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Shared {
    fn insert(&self, peer: SocketAddr, session: Arc<Session>) -> Result<(), ServiceError> {
        let mut table = self.sessions.write();
        if let Some(existing) = table.get(&peer) {
            if !existing.status().is_terminal() {
                return Err(ServiceError::SessionExists(peer));
            }
        }
        if table.len() >= self.config.max_sessions && !table.contains_key(&peer) {
            return Err(ServiceError::TableFull(self.config.max_sessions));
        }
        table.insert(peer, session);
        self.counters.sessions_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_loop(&self) {
        let mut buf = vec![0u8; self.config.max_datagram_size];

        while self.running.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    self.counters.datagrams_received.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_received
                        .fetch_add(len as u64, Ordering::Relaxed);
                    self.handle_datagram(&buf[..len], from);
                }
                Err(e) if is_transient(&e) => thread::sleep(Duration::from_millis(1)),
                Err(e) => {
                    tracing::error!("Socket receive failed: {}", e);
                    thread::sleep(self.config.tick_interval);
                }
            }
        }
        tracing::debug!("Read worker stopped");
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let is_request = SessionCodec::is_plaintext(datagram)
            && Opcode::peek(datagram) == Some(Opcode::SessionRequest);

        let existing = self.sessions.read().get(&from).cloned();
        let session = match existing {
            Some(session) if is_request && session.role() == Role::Server => {
                self.dispatch(&session, datagram);
                if !session.status().is_terminal() {
                    return;
                }
                // The peer restarted on the same address with a new connection id
                match self.open_server_session(from) {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!("Refusing replacement session from {}: {}", from, e);
                        return;
                    }
                }
            }
            Some(session) if !(is_request && session.status().is_terminal()) => session,
            _ if is_request && self.config.accept_incoming => match self.open_server_session(from)
            {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("Refusing session from {}: {}", from, e);
                    return;
                }
            },
            _ => {
                tracing::trace!("Dropping datagram from unknown peer {}", from);
                self.counters
                    .unknown_peer_datagrams
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.dispatch(&session, datagram);
    }

    fn dispatch(&self, session: &Session, datagram: &[u8]) {
        let params = session.wire_params();
        let decoded = SessionCodec::new(params.encrypt_key, params.crc_length, params.use_compression)
            .and_then(|codec| codec.decode(datagram));

        match decoded {
            Ok(packet) => session.handle_session_packet(&packet, Instant::now()),
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                session.record_protocol_error(&e.to_string());
            }
        }
    }

    fn open_server_session(&self, peer: SocketAddr) -> Result<Arc<Session>, ServiceError> {
        let key = self.keys.generate_key()?;
        let session = Arc::new(Session::new_server(
            peer,
            key,
            self.config.session.clone(),
            Arc::clone(&self.factory),
        ));
        match self.accept_tx.try_send(Arc::clone(&session)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(ServiceError::BacklogFull(self.config.accept_backlog))
            }
            Err(TrySendError::Disconnected(_)) => return Err(ServiceError::ShutDown),
        }
        if let Err(e) = self.insert(peer, Arc::clone(&session)) {
            session.mark_destroyed();
            return Err(e);
        }

        tracing::info!("Accepted session from {}", peer);
        Ok(session)
    }

    fn write_loop(&self) {
        let mut sweep = Interval::new(self.config.sweep_interval, Instant::now());

        while self.running.load(Ordering::Acquire) {
            let started = Instant::now();
            let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();

            for session in &sessions {
                self.service_session(session, started);
            }

            if sweep.poll(started) {
                self.sweep();
            }

            let elapsed = started.elapsed();
            if elapsed < self.config.tick_interval {
                thread::sleep(self.config.tick_interval - elapsed);
            }
        }
        tracing::debug!("Write worker stopped");
    }

    fn service_session(&self, session: &Session, now: Instant) {
        session.process_write_thread(now);

        let params = session.wire_params();
        let codec = match SessionCodec::new(
            params.encrypt_key,
            params.crc_length,
            params.use_compression,
        ) {
            Ok(codec) => codec,
            Err(e) => {
                tracing::error!("Unusable wire parameters for {}: {}", session.peer(), e);
                return;
            }
        };

        while let Some(packet) = session.get_outgoing_reliable_packet() {
            self.send(&codec, &packet, session.peer());
        }
        while let Some(packet) = session.get_outgoing_unreliable_packet() {
            self.send(&codec, &packet, session.peer());
        }
    }

    fn send(&self, codec: &SessionCodec, packet: &[u8], peer: SocketAddr) {
        let datagram = match codec.encode(packet) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::warn!("Failed to encode packet for {}: {}", peer, e);
                return;
            }
        };

        match self.socket.send_to(&datagram, peer) {
            Ok(sent) => {
                self.counters.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
            }
            Err(e) => {
                // The reliable lane resends anything lost here
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                if is_transient(&e) {
                    tracing::debug!("Send to {} would block", peer);
                } else {
                    tracing::error!("Send to {} failed: {}", peer, e);
                }
            }
        }
    }

    /// Drop closed sessions with nothing left to send
    fn sweep(&self) {
        let mut table = self.sessions.write();
        let before = table.len();
        table.retain(|peer, session| {
            let closed = session.status().is_terminal()
                && session.outgoing_reliable_packet_count() == 0;
            if closed {
                tracing::debug!("Removing closed session with {} ({})", peer, session.status());
            }
            !closed
        });
        if table.len() != before {
            tracing::debug!("Swept {} closed sessions", before - table.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soe_protocol::{Message, SessionStatus};

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = ServiceConfig::default();
        config.session.crc_length = 9;
        assert!(matches!(
            Service::bind(localhost(), config),
            Err(ServiceError::Config(_))
        ));
    }

    #[test]
    fn test_loopback_handshake_and_echo() {
        let server = Service::bind(localhost(), ServiceConfig::default()).unwrap();
        let client = Service::bind(localhost(), ServiceConfig::client()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let session = client.connect(server_addr).unwrap();
        let accepted = server.accept(Duration::from_secs(5)).unwrap();
        assert!(wait_for(|| session.status() == SessionStatus::Connected));
        assert_eq!(accepted.connection_id(), session.connection_id());

        session
            .send_channel_a(Message::from_slice(b"\x01hello"))
            .unwrap();
        let mut received = None;
        assert!(wait_for(|| {
            received = accepted.get_incoming_queue_message();
            received.is_some()
        }));
        assert_eq!(received.unwrap().data(), b"\x01hello");
        assert!(server.stats().decode_errors == 0);
    }

    #[test]
    fn test_duplicate_connect_rejected() {
        let client = Service::bind(localhost(), ServiceConfig::client()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

        client.connect(peer).unwrap();
        assert!(matches!(
            client.connect(peer),
            Err(ServiceError::SessionExists(_))
        ));
    }

    #[test]
    fn test_client_ignores_unsolicited_requests() {
        let client = Service::bind(localhost(), ServiceConfig::client()).unwrap();
        let stranger = SoeSocket::bind(localhost()).unwrap();
        let request = [0x00, 0x01, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 1, 0xF0];

        stranger
            .send_to(&request, client.local_addr().unwrap())
            .unwrap();
        assert!(wait_for(|| client.stats().unknown_peer_datagrams == 1));
        assert!(client.try_accept().is_none());
    }

    fn session_request(connection_id: u32) -> Vec<u8> {
        soe_protocol::SessionPacket::SessionRequest {
            crc_length: 0,
            connection_id,
            max_udp_size: 496,
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn test_restarted_peer_replaces_session() {
        let server = Service::bind(localhost(), ServiceConfig::default()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let peer = SoeSocket::bind(localhost()).unwrap();
        let peer_addr = peer.local_addr().unwrap();

        peer.send_to(&session_request(1), server_addr).unwrap();
        let first = server.accept(Duration::from_secs(5)).unwrap();
        assert!(wait_for(|| first.status() == SessionStatus::Connected));

        // Same address, new connection id
        peer.send_to(&session_request(2), server_addr).unwrap();
        let second = server.accept(Duration::from_secs(5)).unwrap();

        assert_eq!(second.connection_id(), 2);
        assert_eq!(second.status(), SessionStatus::Connected);
        assert_eq!(first.status(), SessionStatus::Disconnected);
        assert_eq!(server.session(&peer_addr).unwrap().connection_id(), 2);
        assert_eq!(server.stats().sessions_created, 2);
    }

    #[test]
    fn test_accept_backlog_bounded() {
        let config = ServiceConfig {
            accept_backlog: 1,
            ..ServiceConfig::default()
        };
        let server = Service::bind(localhost(), config).unwrap();
        let server_addr = server.local_addr().unwrap();
        let early = SoeSocket::bind(localhost()).unwrap();
        let late = SoeSocket::bind(localhost()).unwrap();

        early.send_to(&session_request(1), server_addr).unwrap();
        assert!(wait_for(|| server.stats().sessions_created == 1));
        late.send_to(&session_request(2), server_addr).unwrap();
        assert!(wait_for(|| server.stats().datagrams_received == 2));

        assert!(server.session(&late.local_addr().unwrap()).is_none());
        assert_eq!(server.try_accept().unwrap().connection_id(), 1);
        assert!(server.try_accept().is_none());
    }

    #[test]
    fn test_accept_skips_closed_sessions() {
        let server = Service::bind(localhost(), ServiceConfig::default()).unwrap();
        let peer = SoeSocket::bind(localhost()).unwrap();
        let peer_addr = peer.local_addr().unwrap();

        peer.send_to(&session_request(5), server.local_addr().unwrap()).unwrap();
        assert!(wait_for(|| server.session(&peer_addr).is_some()));
        server.session(&peer_addr).unwrap().mark_destroyed();

        assert!(server.accept(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_shutdown_disconnects_peers() {
        let server = Service::bind(localhost(), ServiceConfig::default()).unwrap();
        let client = Service::bind(localhost(), ServiceConfig::client()).unwrap();

        let session = client.connect(server.local_addr().unwrap()).unwrap();
        let accepted = server.accept(Duration::from_secs(5)).unwrap();
        assert!(wait_for(|| session.status() == SessionStatus::Connected));

        client.shutdown();
        assert!(!client.is_running());
        assert!(wait_for(|| accepted.status() == SessionStatus::Disconnected));
        assert_eq!(session.status(), SessionStatus::Destroy);
    }
}
