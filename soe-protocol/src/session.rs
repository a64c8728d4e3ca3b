//! Session State Machine
//!
//! A [`Session`] is one end of a reliable-UDP conversation with a single
//! peer. It is driven from three sides: the read worker hands it decoded
//! datagrams, the write worker ticks it and drains its outgoing packet
//! queues, and the game thread enqueues and dequeues messages. All state
//! sits behind one mutex so cross-queue invariants (window size versus
//! admitted packets, sequence counters versus the window) hold under any
//! interleaving.
//!
//! The session never touches a socket or a clock: callers pass `now` and
//! move bytes in and out.

use crate::ack::{Arrival, ReceiveTracker, RttEstimator, RttStats};
use crate::config::SessionConfig;
use crate::congestion::WindowController;
use crate::fragment::{unpack_data_payload, Packetizer, Reassembler};
use crate::message::{Message, MessageFactory, MessageQueue, Priority};
use crate::packet::{
    length_prefix_size, Channel, NetStatusRequest, NetStatusResponse, PacketError, SessionPacket,
    OPCODE_SIZE,
};
use crate::sequence::SeqNumber;
use crate::window::SendWindow;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Deepest multi-packet nesting accepted
const MAX_MULTI_PACKET_DEPTH: usize = 2;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Initialize,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Destroy,
    Timeout,
    Error,
}

impl SessionStatus {
    /// No further traffic is exchanged in these states
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Disconnected
                | SessionStatus::Destroy
                | SessionStatus::Timeout
                | SessionStatus::Error
        )
    }

    fn accepts_traffic(self) -> bool {
        matches!(self, SessionStatus::Connected | SessionStatus::Disconnecting)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Command observed on the next write tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionCommand {
    #[default]
    None,
    Connect,
    Disconnect,
}

/// Which side of the handshake this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Session errors surfaced to the game layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is closed ({0})")]
    Closed(SessionStatus),

    #[error("Cannot send an empty message")]
    EmptyMessage,
}

/// Parameters the datagram codec needs for this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireParams {
    pub encrypt_key: u32,
    pub crc_length: u8,
    pub use_compression: bool,
    pub max_packet_size: usize,
}

/// Work done by one write tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTickReport {
    pub status: SessionStatus,
    /// Reliable packets built from queued messages
    pub reliable_built: usize,
    /// Unreliable packets built
    pub unreliable_built: usize,
    /// Packets admitted to the window and queued for sending
    pub admitted: usize,
    pub resent: usize,
    /// Ack, ping and status packets queued
    pub control_queued: usize,
}

impl WriteTickReport {
    fn new(status: SessionStatus) -> Self {
        WriteTickReport {
            status,
            reliable_built: 0,
            unreliable_built: 0,
            admitted: 0,
            resent: 0,
            control_queued: 0,
        }
    }
}

/// Point-in-time session statistics
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub status: SessionStatus,
    pub connection_id: u32,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_resent: u64,
    pub fast_resends: u64,
    pub duplicates_dropped: u64,
    pub out_of_order_held: u64,
    /// Packets currently held for an earlier gap
    pub held_packets: usize,
    /// Packets dropped for arriving beyond the hold window
    pub dropped_ahead: u64,
    pub last_ack_sent: Option<SeqNumber>,
    pub protocol_errors: u32,
    pub unknown_opcodes: u64,
    pub reassembly_failures: u64,
    pub messages_queued: u64,
    pub messages_delivered: u64,
    pub window_size: u32,
    pub max_window_size: u32,
    pub window_increases: u64,
    pub window_decreases: u64,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub pending_packets: usize,
    pub rollover_packets: usize,
    pub outgoing_messages: usize,
    pub incoming_messages: usize,
    pub rtt: RttStats,
    pub rto: Duration,
    /// Mean reliable packets built per write tick that built any
    pub average_packets_built: f64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    packets_resent: u64,
    fast_resends: u64,
    duplicates_dropped: u64,
    out_of_order_held: u64,
    protocol_errors: u32,
    unknown_opcodes: u64,
    reassembly_failures: u64,
    messages_queued: u64,
    messages_delivered: u64,
    build_ticks: u64,
    packets_built: u64,
}

struct SessionInner {
    role: Role,
    peer: SocketAddr,
    config: SessionConfig,
    factory: Arc<MessageFactory>,

    status: SessionStatus,
    command: SessionCommand,
    connection_id: u32,
    encrypt_key: u32,
    crc_length: u8,
    use_compression: bool,
    max_packet_size: usize,
    max_unreliable_size: usize,
    packetizer: Packetizer,

    out_sequence_next: SeqNumber,
    last_sequence_acked: Option<SeqNumber>,
    window: SendWindow,
    controller: WindowController,
    rtt: RttEstimator,
    receive: ReceiveTracker,
    reassembler: Reassembler,

    outgoing_messages: MessageQueue,
    unreliable_messages: MessageQueue,
    incoming_messages: MessageQueue,
    outgoing_reliable_packets: VecDeque<Bytes>,
    outgoing_unreliable_packets: VecDeque<Bytes>,

    created_at: Instant,
    last_packet_received: Instant,
    last_packet_sent: Instant,
    connect_start: Option<Instant>,
    last_connect_request: Option<Instant>,
    connect_attempts: u32,
    last_net_stat: Instant,
    last_net_stat_response: Option<NetStatusResponse>,

    counters: Counters,
}

/// One reliable-UDP session with a single peer
pub struct Session {
    peer: SocketAddr,
    role: Role,
    factory: Arc<MessageFactory>,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Create the client side of a session
    ///
    /// The session stays in `Initialize` until [`Session::connect`] is called
    /// and the next write tick sends the session request.
    pub fn new_client(
        peer: SocketAddr,
        connection_id: u32,
        config: SessionConfig,
        factory: Arc<MessageFactory>,
    ) -> Self {
        Session::build(Role::Client, peer, connection_id, 0, config, factory)
    }

    /// Create the server side of a session for a peer's session request
    ///
    /// `encrypt_key` is sent to the client as the CRC seed and keys the
    /// obfuscation of every later packet.
    pub fn new_server(
        peer: SocketAddr,
        encrypt_key: u32,
        config: SessionConfig,
        factory: Arc<MessageFactory>,
    ) -> Self {
        Session::build(Role::Server, peer, 0, encrypt_key, config, factory)
    }

    fn build(
        role: Role,
        peer: SocketAddr,
        connection_id: u32,
        encrypt_key: u32,
        config: SessionConfig,
        factory: Arc<MessageFactory>,
    ) -> Self {
        let now = Instant::now();
        let inner = SessionInner {
            role,
            peer,
            factory: Arc::clone(&factory),
            status: SessionStatus::Initialize,
            command: SessionCommand::None,
            connection_id,
            encrypt_key,
            crc_length: config.crc_length,
            use_compression: config.use_compression,
            max_packet_size: config.max_packet_size,
            max_unreliable_size: config.max_unreliable_size,
            packetizer: Packetizer::new(config.reliable_payload_budget()),
            out_sequence_next: SeqNumber::new(0),
            last_sequence_acked: None,
            window: SendWindow::new(),
            controller: WindowController::new(config.window, config.resend_window_size),
            rtt: RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto),
            receive: ReceiveTracker::new(config.resend_window_size as usize),
            reassembler: Reassembler::new(config.max_reassembly_size),
            outgoing_messages: MessageQueue::new(),
            unreliable_messages: MessageQueue::new(),
            incoming_messages: MessageQueue::new(),
            outgoing_reliable_packets: VecDeque::new(),
            outgoing_unreliable_packets: VecDeque::new(),
            created_at: now,
            last_packet_received: now,
            last_packet_sent: now,
            connect_start: None,
            last_connect_request: None,
            connect_attempts: 0,
            last_net_stat: now,
            last_net_stat_response: None,
            counters: Counters::default(),
            config,
        };

        Session {
            peer,
            role,
            factory,
            inner: Mutex::new(inner),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_id(&self) -> u32 {
        self.inner.lock().connection_id
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    pub fn command(&self) -> SessionCommand {
        self.inner.lock().command
    }

    /// Request a connection; acted on by the next write tick
    pub fn connect(&self) {
        self.inner.lock().command = SessionCommand::Connect;
    }

    /// Request a graceful disconnect; acted on by the next write tick
    pub fn disconnect(&self) {
        self.inner.lock().command = SessionCommand::Disconnect;
    }

    /// Final state set by the owner when tearing the session down
    pub fn mark_destroyed(&self) {
        let mut inner = self.inner.lock();
        inner.enter_terminal(SessionStatus::Destroy, "destroyed by owner");
    }

    /// Codec parameters currently in force
    pub fn wire_params(&self) -> WireParams {
        let inner = self.inner.lock();
        WireParams {
            encrypt_key: inner.encrypt_key,
            crc_length: inner.crc_length,
            use_compression: inner.use_compression,
            max_packet_size: inner.max_packet_size,
        }
    }

    /// Queue a reliable message on the ordered channel
    pub fn send_channel_a(&self, message: Message) -> Result<(), SessionError> {
        let priority = message.priority();
        let fast_path = message.fast_path();
        self.inner
            .lock()
            .add_outgoing_message(message, Channel::A, priority, fast_path)
    }

    /// Queue a message for the unreliable lane
    ///
    /// Messages that cannot travel unsequenced (first byte zero, or larger
    /// than an unreliable packet) fall back to the reliable lane.
    pub fn send_channel_a_unreliable(&self, message: Message) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        inner.check_open(&message)?;
        inner.counters.messages_queued += 1;
        inner.unreliable_messages.push(message);
        Ok(())
    }

    /// Queue a reliable message on the routed channel
    pub fn send_channel_b(&self, message: Message) -> Result<(), SessionError> {
        let priority = message.priority();
        let fast_path = message.fast_path();
        self.inner
            .lock()
            .add_outgoing_message(message, Channel::B, priority, fast_path)
    }

    /// Pop the next delivered message
    pub fn get_incoming_queue_message(&self) -> Option<Message> {
        self.inner.lock().incoming_messages.pop()
    }

    pub fn incoming_message_count(&self) -> usize {
        self.inner.lock().incoming_messages.len()
    }

    /// Hand a consumed incoming message back to the pool
    pub fn destroy_incoming_message(&self, message: Message) {
        self.factory.recycle(message);
    }

    /// Process one decoded datagram from the peer
    pub fn handle_session_packet(&self, datagram: &[u8], now: Instant) {
        self.inner.lock().handle_session_packet(datagram, now);
    }

    /// Count a protocol violation detected outside the session (bad CRC,
    /// undecodable payload)
    pub fn record_protocol_error(&self, reason: &str) {
        self.inner.lock().protocol_error(reason);
    }

    /// Write-tick entry point
    pub fn process_write_thread(&self, now: Instant) -> WriteTickReport {
        self.inner.lock().process_write_thread(now)
    }

    /// Pop one encoded reliable-lane packet for the socket
    pub fn get_outgoing_reliable_packet(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let packet = inner.outgoing_reliable_packets.pop_front()?;
        inner.note_sent(packet.len());
        Some(packet)
    }

    pub fn outgoing_reliable_packet_count(&self) -> usize {
        self.inner.lock().outgoing_reliable_packets.len()
    }

    /// Pop one unreliable packet for the socket
    pub fn get_outgoing_unreliable_packet(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let packet = inner.outgoing_unreliable_packets.pop_front()?;
        inner.note_sent(packet.len());
        Some(packet)
    }

    pub fn outgoing_unreliable_packet_count(&self) -> usize {
        self.inner.lock().outgoing_unreliable_packets.len()
    }

    /// Latest status report from the server, client side only
    pub fn last_net_status(&self) -> Option<NetStatusResponse> {
        self.inner.lock().last_net_stat_response
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        let c = &inner.counters;
        let window = inner.controller.stats();
        SessionStats {
            status: inner.status,
            connection_id: inner.connection_id,
            packets_sent: c.packets_sent,
            packets_received: c.packets_received,
            bytes_sent: c.bytes_sent,
            bytes_received: c.bytes_received,
            packets_resent: c.packets_resent,
            fast_resends: c.fast_resends,
            duplicates_dropped: c.duplicates_dropped,
            out_of_order_held: c.out_of_order_held,
            held_packets: inner.receive.held_count(),
            dropped_ahead: inner.receive.dropped_ahead(),
            last_ack_sent: inner.receive.last_ack_sent(),
            protocol_errors: c.protocol_errors,
            unknown_opcodes: c.unknown_opcodes,
            reassembly_failures: c.reassembly_failures,
            messages_queued: c.messages_queued,
            messages_delivered: c.messages_delivered,
            window_size: window.window_size,
            max_window_size: window.max_size,
            window_increases: window.increases,
            window_decreases: window.decreases,
            in_flight: inner.window.in_flight(),
            max_in_flight: inner.window.max_in_flight(),
            pending_packets: inner.window.pending_len(),
            rollover_packets: inner.window.rollover_len(),
            outgoing_messages: inner.outgoing_messages.len(),
            incoming_messages: inner.incoming_messages.len(),
            rtt: inner.rtt.stats(),
            rto: inner.rtt.rto(),
            average_packets_built: if c.build_ticks == 0 {
                0.0
            } else {
                c.packets_built as f64 / c.build_ticks as f64
            },
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish()
    }
}

impl SessionInner {
    fn check_open(&self, message: &Message) -> Result<(), SessionError> {
        if self.status.is_terminal() || self.status == SessionStatus::Disconnecting {
            return Err(SessionError::Closed(self.status));
        }
        if message.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        Ok(())
    }

    fn add_outgoing_message(
        &mut self,
        mut message: Message,
        channel: Channel,
        priority: Priority,
        fast_path: bool,
    ) -> Result<(), SessionError> {
        self.check_open(&message)?;
        message.set_channel(channel);
        message.set_priority(priority);
        message.set_fast_path(fast_path);
        self.counters.messages_queued += 1;
        self.outgoing_messages.push(message);
        Ok(())
    }

    fn add_incoming_message(&mut self, message: Message, priority: Priority) {
        self.counters.messages_delivered += 1;
        self.incoming_messages.push(message.with_priority(priority));
    }

    fn deliver(&mut self, data: &[u8], channel: Channel, fast_path: bool) {
        let mut message = self.factory.create_from(data);
        message.set_channel(channel);
        message.set_fast_path(fast_path);
        self.add_incoming_message(message, Priority::Normal);
    }

    fn note_received(&mut self, len: usize, now: Instant) {
        self.counters.packets_received += 1;
        self.counters.bytes_received += len as u64;
        self.last_packet_received = now;
    }

    fn note_sent(&mut self, len: usize) {
        self.counters.packets_sent += 1;
        self.counters.bytes_sent += len as u64;
        if self.status == SessionStatus::Disconnecting && self.outgoing_reliable_packets.is_empty()
        {
            tracing::info!("Session {:#010x} with {} disconnected", self.connection_id, self.peer);
            self.status = SessionStatus::Disconnected;
        }
    }

    fn queue_reliable(&mut self, data: Bytes, now: Instant) {
        self.outgoing_reliable_packets.push_back(data);
        self.last_packet_sent = now;
    }

    fn queue_control(&mut self, packet: SessionPacket, now: Instant) {
        tracing::trace!("Queueing {} for {}", packet.packet_type(), self.peer);
        self.queue_reliable(packet.to_bytes().freeze(), now);
    }

    fn protocol_error(&mut self, reason: &str) {
        self.counters.protocol_errors += 1;
        tracing::warn!(
            "Protocol error from {} ({}/{}): {}",
            self.peer,
            self.counters.protocol_errors,
            self.config.max_protocol_errors,
            reason
        );
        if self.counters.protocol_errors > self.config.max_protocol_errors
            && !self.status.is_terminal()
        {
            self.enter_terminal(SessionStatus::Error, "too many protocol errors");
        }
    }

    /// Drop every queue, returning the total number of entries discarded
    fn clear_queues(&mut self) -> usize {
        let outgoing = self.outgoing_messages.clear();
        let unreliable = self.unreliable_messages.clear();
        let incoming = self.incoming_messages.clear();
        let (pending, window, rollover) = self.window.clear();
        let reliable = self.outgoing_reliable_packets.len();
        let unreliable_packets = self.outgoing_unreliable_packets.len();
        let held = self.receive.clear();
        self.outgoing_reliable_packets.clear();
        self.outgoing_unreliable_packets.clear();
        self.reassembler.reset();

        tracing::debug!(
            "Cleared queues for {}: outgoing={} unreliable={} incoming={} pending={} window={} rollover={} reliable_packets={} unreliable_packets={} held={}",
            self.peer,
            outgoing,
            unreliable,
            incoming,
            pending,
            window,
            rollover,
            reliable,
            unreliable_packets,
            held
        );

        outgoing + unreliable + incoming + pending + window + rollover + reliable
            + unreliable_packets
            + held
    }

    fn enter_terminal(&mut self, status: SessionStatus, reason: &str) {
        if self.status.is_terminal() && status != SessionStatus::Destroy {
            return;
        }
        match status {
            SessionStatus::Timeout | SessionStatus::Error => {
                tracing::warn!("Session with {} -> {}: {}", self.peer, status, reason)
            }
            _ => tracing::info!("Session with {} -> {}: {}", self.peer, status, reason),
        }
        self.clear_queues();
        self.status = status;
        self.command = SessionCommand::None;
    }

    fn refresh_packetizer(&mut self) {
        let budget = self
            .max_packet_size
            .saturating_sub(crate::packet::SEQUENCED_HEADER_SIZE + self.footer_size());
        self.packetizer = Packetizer::new(budget);
    }

    fn footer_size(&self) -> usize {
        self.crc_length as usize + usize::from(self.use_compression)
    }

    fn handle_session_packet(&mut self, datagram: &[u8], now: Instant) {
        if self.status.is_terminal() {
            tracing::trace!("Dropping datagram for closed session {}", self.peer);
            return;
        }

        match SessionPacket::from_bytes(datagram) {
            Ok(packet) => {
                self.note_received(datagram.len(), now);
                self.sort_session_packet(packet, now, 0);
            }
            Err(PacketError::UnknownOpcode(op)) => {
                self.counters.unknown_opcodes += 1;
                self.protocol_error(&format!("unknown opcode {:#06x}", op));
            }
            Err(e) => self.protocol_error(&e.to_string()),
        }
    }

    fn sort_session_packet(&mut self, packet: SessionPacket, now: Instant, depth: usize) {
        match packet {
            SessionPacket::SessionRequest {
                crc_length,
                connection_id,
                max_udp_size,
            } => self.process_session_request(crc_length, connection_id, max_udp_size, now),
            SessionPacket::SessionResponse {
                connection_id,
                crc_seed,
                crc_length,
                use_compression,
                max_udp_size,
            } => self.process_session_response(
                connection_id,
                crc_seed,
                crc_length,
                use_compression,
                max_udp_size,
                now,
            ),
            packet if !self.status.accepts_traffic() => {
                tracing::debug!(
                    "Dropping {} from {} while {}",
                    packet.packet_type(),
                    self.peer,
                    self.status
                );
            }
            SessionPacket::MultiPacket(parts) => self.process_multi_packet(parts, now, depth),
            SessionPacket::Disconnect {
                connection_id,
                reason,
            } => self.process_disconnect_packet(connection_id, reason),
            SessionPacket::Ping => tracing::trace!("Ping from {}", self.peer),
            SessionPacket::NetStatusRequest(request) => {
                self.process_net_stat_request(request, now)
            }
            SessionPacket::NetStatusResponse(response) => {
                tracing::trace!("Net status from {}: {:?}", self.peer, response);
                self.last_net_stat_response = Some(response);
            }
            packet @ (SessionPacket::Data { .. } | SessionPacket::Fragment { .. }) => {
                self.process_sequenced(packet, now)
            }
            SessionPacket::OutOfOrder { seq, .. } => self.process_data_order_packet(seq, now),
            SessionPacket::Ack { seq, .. } => self.process_data_channel_ack(seq, now),
            SessionPacket::FatalError => {
                self.enter_terminal(SessionStatus::Error, "fatal error from peer");
                self.queue_control(SessionPacket::FatalErrorReply, now);
            }
            SessionPacket::FatalErrorReply => {
                tracing::debug!("Fatal error acknowledged by {}", self.peer)
            }
            SessionPacket::FastPath(data) => self.handle_fastpath_packet(&data),
        }
    }

    fn process_session_request(
        &mut self,
        crc_length: u32,
        connection_id: u32,
        max_udp_size: u32,
        now: Instant,
    ) {
        if self.role != Role::Server {
            self.protocol_error("session request sent to a client");
            return;
        }

        match self.status {
            SessionStatus::Initialize => {
                self.connection_id = connection_id;
                self.max_packet_size = self.config.max_packet_size.min(max_udp_size as usize);
                self.max_unreliable_size = self.max_unreliable_size.min(self.max_packet_size);
                self.refresh_packetizer();
                self.status = SessionStatus::Connected;
                self.last_packet_received = now;
                tracing::info!(
                    "Session {:#010x} from {} connected (client crc {}, max udp {})",
                    connection_id,
                    self.peer,
                    crc_length,
                    max_udp_size
                );
                self.send_session_response(now);
            }
            SessionStatus::Connected if connection_id == self.connection_id => {
                // The response was lost; the client is retrying
                tracing::debug!("Repeating session response to {}", self.peer);
                self.send_session_response(now);
            }
            SessionStatus::Connected | SessionStatus::Disconnecting => {
                // A peer restarting on the same address: this session ends and
                // the owner opens a fresh one for the new connection
                self.enter_terminal(
                    SessionStatus::Disconnected,
                    &format!("replaced by connection {:#010x}", connection_id),
                );
            }
            _ => self.protocol_error("unexpected session request"),
        }
    }

    fn send_session_response(&mut self, now: Instant) {
        let response = SessionPacket::SessionResponse {
            connection_id: self.connection_id,
            crc_seed: self.encrypt_key,
            crc_length: self.crc_length,
            use_compression: self.use_compression,
            max_udp_size: self.max_packet_size as u32,
        };
        self.queue_control(response, now);
    }

    fn process_session_response(
        &mut self,
        connection_id: u32,
        crc_seed: u32,
        crc_length: u8,
        use_compression: bool,
        max_udp_size: u32,
        now: Instant,
    ) {
        if self.role != Role::Client {
            self.protocol_error("session response sent to a server");
            return;
        }
        if self.status != SessionStatus::Connecting {
            tracing::debug!("Ignoring session response from {} while {}", self.peer, self.status);
            return;
        }
        if connection_id != self.connection_id {
            self.protocol_error("session response for another connection");
            return;
        }
        if crc_length > 4 {
            self.protocol_error("session response with invalid crc length");
            return;
        }

        self.encrypt_key = crc_seed;
        self.crc_length = crc_length;
        self.use_compression = use_compression;
        self.max_packet_size = self.config.max_packet_size.min(max_udp_size as usize);
        self.max_unreliable_size = self.config.max_unreliable_size.min(self.max_packet_size);
        self.refresh_packetizer();

        self.status = SessionStatus::Connected;
        self.last_packet_received = now;
        self.last_net_stat = now;

        let elapsed = self
            .connect_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        tracing::info!(
            "Session {:#010x} to {} connected after {} attempt(s) in {:?}",
            connection_id,
            self.peer,
            self.connect_attempts,
            elapsed
        );
    }

    fn process_multi_packet(&mut self, parts: Vec<Bytes>, now: Instant, depth: usize) {
        if depth >= MAX_MULTI_PACKET_DEPTH {
            self.protocol_error("multi-packet nested too deeply");
            return;
        }
        for part in parts {
            match SessionPacket::from_bytes(&part) {
                Ok(packet) => self.sort_session_packet(packet, now, depth + 1),
                Err(PacketError::UnknownOpcode(op)) => {
                    self.counters.unknown_opcodes += 1;
                    self.protocol_error(&format!("unknown opcode {:#06x} in multi-packet", op));
                }
                Err(e) => self.protocol_error(&e.to_string()),
            }
            if self.status.is_terminal() {
                return;
            }
        }
    }

    fn process_disconnect_packet(&mut self, connection_id: u32, reason: u16) {
        if connection_id != self.connection_id {
            self.protocol_error("disconnect for another connection");
            return;
        }
        self.enter_terminal(
            SessionStatus::Disconnected,
            &format!("peer disconnected (reason {})", reason),
        );
    }

    fn process_net_stat_request(&mut self, request: NetStatusRequest, now: Instant) {
        let response = SessionPacket::NetStatusResponse(NetStatusResponse {
            client_tick: request.client_tick,
            server_tick: now.saturating_duration_since(self.created_at).as_millis() as u32,
            client_packets_sent: request.packets_sent,
            client_packets_received: request.packets_received,
            server_packets_sent: self.counters.packets_sent,
            server_packets_received: self.counters.packets_received,
        });
        self.queue_control(response, now);
    }

    fn process_sequenced(&mut self, packet: SessionPacket, now: Instant) {
        let (channel, seq) = match &packet {
            SessionPacket::Data { channel, seq, .. }
            | SessionPacket::Fragment { channel, seq, .. } => (*channel, *seq),
            _ => return,
        };

        match self.receive.offer(seq, packet) {
            Arrival::Deliver(ready) => {
                for packet in ready {
                    self.process_in_order(packet);
                    if self.status.is_terminal() {
                        return;
                    }
                }
            }
            Arrival::Held => {
                self.counters.out_of_order_held += 1;
                self.queue_control(SessionPacket::OutOfOrder { channel, seq }, now);
            }
            Arrival::Duplicate => self.counters.duplicates_dropped += 1,
            Arrival::Dropped => {}
        }
    }

    fn process_in_order(&mut self, packet: SessionPacket) {
        match packet {
            SessionPacket::Data {
                channel, payload, ..
            } => self.process_data_channel_packet(channel, &payload),
            SessionPacket::Fragment {
                channel,
                seq,
                payload,
            } => self.process_fragmented_packet(channel, seq, &payload),
            _ => {}
        }
    }

    fn process_data_channel_packet(&mut self, channel: Channel, payload: &Bytes) {
        if let Some(err) = self.reassembler.interrupt() {
            self.counters.reassembly_failures += 1;
            self.protocol_error(&err.to_string());
        }

        match unpack_data_payload(payload) {
            Ok(parts) => {
                for part in parts {
                    self.deliver(&part, channel, false);
                }
            }
            Err(e) => self.protocol_error(&e.to_string()),
        }
    }

    fn process_fragmented_packet(&mut self, channel: Channel, seq: SeqNumber, payload: &[u8]) {
        match self
            .reassembler
            .process_fragmented_packet(channel, seq, payload)
        {
            Ok(Some(message)) => self.deliver(&message, channel, false),
            Ok(None) => {}
            Err(err) => {
                self.counters.reassembly_failures += 1;
                self.protocol_error(&err.to_string());
            }
        }
    }

    fn process_data_order_packet(&mut self, seq: SeqNumber, now: Instant) {
        let min_age = self.rtt.srtt();
        if let Some(scheduled) = self.window.mark_out_of_order(seq, now, min_age) {
            if scheduled > 0 {
                tracing::trace!("Out-of-order report for {} schedules {} resends", seq, scheduled);
            }
            self.counters.fast_resends += scheduled as u64;
        }
    }

    fn process_data_channel_ack(&mut self, seq: SeqNumber, now: Instant) {
        if !seq.lt(self.out_sequence_next) {
            self.protocol_error("ack for a sequence never sent");
            return;
        }

        let outcome = self.window.ack_up_to(seq, now);
        if outcome.released > 0 {
            self.controller.on_ack(outcome.released);
            if let Some(sample) = outcome.rtt_sample {
                self.rtt.update(sample);
            }
            self.last_sequence_acked = Some(seq);
        }
    }

    fn handle_fastpath_packet(&mut self, data: &[u8]) {
        tracing::trace!("Fast-path message of {} bytes from {}", data.len(), self.peer);
        self.deliver(data, Channel::A, true);
    }

    fn process_write_thread(&mut self, now: Instant) -> WriteTickReport {
        let mut report = WriteTickReport::new(self.status);

        match self.command {
            SessionCommand::Connect => self.process_connect_command(now),
            SessionCommand::Disconnect => self.process_disconnect_command(now),
            SessionCommand::None => {}
        }

        match self.status {
            SessionStatus::Connecting => self.process_connecting(now),
            SessionStatus::Connected => self.process_connected(now, &mut report),
            SessionStatus::Disconnecting if self.outgoing_reliable_packets.is_empty() => {
                tracing::info!("Session with {} disconnected", self.peer);
                self.status = SessionStatus::Disconnected;
            }
            _ => {}
        }

        report.status = self.status;
        report
    }

    fn process_connect_command(&mut self, now: Instant) {
        self.command = SessionCommand::None;
        if self.role != Role::Client || self.status != SessionStatus::Initialize {
            tracing::warn!("Ignoring connect command while {}", self.status);
            return;
        }

        tracing::info!("Connecting to {} as {:#010x}", self.peer, self.connection_id);
        self.status = SessionStatus::Connecting;
        self.connect_start = Some(now);
        self.send_session_request(now);
    }

    fn send_session_request(&mut self, now: Instant) {
        self.connect_attempts += 1;
        self.last_connect_request = Some(now);
        let request = SessionPacket::SessionRequest {
            crc_length: self.config.crc_length as u32,
            connection_id: self.connection_id,
            max_udp_size: self.config.max_packet_size as u32,
        };
        self.queue_control(request, now);
    }

    fn process_connecting(&mut self, now: Instant) {
        let last = match self.last_connect_request {
            Some(last) => last,
            None => return,
        };
        if now.saturating_duration_since(last) < self.config.connect_retry_interval {
            return;
        }
        if self.connect_attempts >= self.config.connect_max_retries {
            self.enter_terminal(SessionStatus::Timeout, "no session response");
            return;
        }
        tracing::debug!(
            "Resending session request to {} (attempt {})",
            self.peer,
            self.connect_attempts + 1
        );
        self.send_session_request(now);
    }

    fn process_disconnect_command(&mut self, now: Instant) {
        self.command = SessionCommand::None;
        match self.status {
            SessionStatus::Connected | SessionStatus::Connecting => {
                let discarded = self.clear_queues();
                tracing::info!(
                    "Disconnecting from {} ({} queued items discarded)",
                    self.peer,
                    discarded
                );
                let packet = SessionPacket::Disconnect {
                    connection_id: self.connection_id,
                    reason: 0,
                };
                self.queue_control(packet, now);
                self.status = SessionStatus::Disconnecting;
            }
            SessionStatus::Initialize => {
                self.status = SessionStatus::Disconnected;
            }
            _ => {}
        }
    }

    fn process_connected(&mut self, now: Instant, report: &mut WriteTickReport) {
        if now.saturating_duration_since(self.last_packet_received) >= self.config.inactivity_timeout
        {
            self.enter_terminal(SessionStatus::Timeout, "inactivity");
            return;
        }

        report.resent = self.resend_outgoing_packets(now);
        if self.status != SessionStatus::Connected {
            return;
        }

        if let Some(ack) = self.receive.take_pending_ack() {
            self.queue_control(
                SessionPacket::Ack {
                    channel: Channel::A,
                    seq: ack,
                },
                now,
            );
            report.control_queued += 1;
        }

        report.reliable_built = self.build_packets();
        report.admitted = self.admit_packets(now);
        report.unreliable_built = self.build_packets_unreliable(now);

        if now.saturating_duration_since(self.last_packet_sent) >= self.config.ping_interval {
            self.queue_control(SessionPacket::Ping, now);
            report.control_queued += 1;
        }

        if self.role == Role::Client
            && now.saturating_duration_since(self.last_net_stat) >= self.config.net_stat_interval
        {
            self.last_net_stat = now;
            let request = self.net_stat_request(now);
            self.queue_control(SessionPacket::NetStatusRequest(request), now);
            report.control_queued += 1;
        }
    }

    fn net_stat_request(&self, now: Instant) -> NetStatusRequest {
        let rtt = self.rtt.stats();
        NetStatusRequest {
            client_tick: now.saturating_duration_since(self.created_at).as_millis() as u16,
            last_update: rtt.last.as_millis() as u32,
            average_update: rtt.average.as_millis() as u32,
            shortest_update: rtt.shortest.as_millis() as u32,
            longest_update: rtt.longest.as_millis() as u32,
            last_server_update: self
                .last_net_stat_response
                .map_or(0, |response| response.server_tick),
            packets_sent: self.counters.packets_sent,
            packets_received: self.counters.packets_received,
        }
    }

    fn resend_outgoing_packets(&mut self, now: Instant) -> usize {
        let due = self.window.due_for_resend(now, self.rtt.rto());
        if due.is_empty() {
            return 0;
        }

        let mut timed_out = false;
        let count = due.len();
        for resend in due {
            if resend.resend_count > self.config.max_resend_attempts {
                self.enter_terminal(
                    SessionStatus::Timeout,
                    &format!("packet {} resent {} times", resend.seq, resend.resend_count - 1),
                );
                return 0;
            }
            timed_out |= resend.timed_out;
            tracing::trace!("Resending packet {} (attempt {})", resend.seq, resend.resend_count);
            self.queue_reliable(resend.data, now);
        }

        if timed_out {
            self.rtt.on_timeout();
            let srtt = self.rtt.srtt();
            self.controller.on_timeout(now, srtt);
        }
        self.counters.packets_resent += count as u64;
        count
    }

    fn build_packets(&mut self) -> usize {
        let started = Instant::now();
        let window_size = self.controller.window_size() as usize;
        let mut built = 0;

        while self.window.pending_len() < window_size && !self.outgoing_messages.is_empty() {
            let packets = self
                .packetizer
                .build_from_queue(&mut self.outgoing_messages, &mut self.out_sequence_next);
            built += packets.len();
            for packet in packets {
                self.window.push_pending(packet);
            }
            if started.elapsed() >= self.config.packet_build_time_limit {
                tracing::debug!(
                    "Packet build budget exhausted for {} after {} packets",
                    self.peer,
                    built
                );
                break;
            }
        }

        if built > 0 {
            self.counters.build_ticks += 1;
            self.counters.packets_built += built as u64;
        }
        built
    }

    fn admit_packets(&mut self, now: Instant) -> usize {
        let mut sent = self.window.promote(now);
        sent.extend(
            self.window
                .admit(now, self.controller.window_size() as usize),
        );
        let count = sent.len();
        for data in sent {
            self.queue_reliable(data, now);
        }
        count
    }

    fn build_packets_unreliable(&mut self, now: Instant) -> usize {
        let started = Instant::now();
        let budget = self.max_unreliable_size.saturating_sub(self.footer_size());
        let mut built = 0;

        while let Some(message) = self.unreliable_messages.pop() {
            if !fits_unreliable(&message, budget) {
                tracing::trace!(
                    "Unreliable message of {} bytes falls back to the reliable lane",
                    message.len()
                );
                let mut message = message;
                message.set_channel(Channel::A);
                self.outgoing_messages.push(message);
                continue;
            }

            let mut batch = vec![message];
            let mut size = OPCODE_SIZE + prefixed_len(batch[0].len());
            while let Some(next) = self.unreliable_messages.peek() {
                if !fits_unreliable(next, budget) || size + prefixed_len(next.len()) > budget {
                    break;
                }
                size += prefixed_len(next.len());
                if let Some(next) = self.unreliable_messages.pop() {
                    batch.push(next);
                }
            }

            let datagram = if batch.len() == 1 {
                batch[0].to_bytes()
            } else {
                let parts = batch.iter().map(Message::to_bytes).collect();
                SessionPacket::MultiPacket(parts).to_bytes().freeze()
            };
            self.outgoing_unreliable_packets.push_back(datagram);
            self.last_packet_sent = now;
            built += 1;

            if started.elapsed() >= self.config.packet_build_time_limit {
                break;
            }
        }

        built
    }
}

fn fits_unreliable(message: &Message, budget: usize) -> bool {
    message.data().first().map_or(false, |&b| b != 0) && message.len() <= budget
}

fn prefixed_len(len: usize) -> usize {
    length_prefix_size(len) + len
}
