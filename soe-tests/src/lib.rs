//! Shared harness for the cross-crate tests
//!
//! [`Link`] joins a client and a server session in memory. Every packet is
//! run through each side's [`SessionCodec`] exactly as the service would, and
//! an optional drop pattern simulates a burst of loss. Time is simulated.

use soe_crypto::SessionCodec;
use soe_protocol::{MessageFactory, Session, SessionConfig, SessionStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const CLIENT_ADDR: &str = "127.0.0.1:40001";
pub const SERVER_ADDR: &str = "127.0.0.1:40002";

/// Which datagrams to drop
///
/// The pattern is applied once to the datagrams crossing the link in either
/// direction; after it runs out the link is lossless.
#[derive(Debug, Clone, Default)]
pub struct LossPattern {
    pattern: Vec<bool>,
    position: usize,
}

impl LossPattern {
    pub fn none() -> Self {
        LossPattern::default()
    }

    /// `true` entries drop the corresponding datagram
    pub fn new(pattern: Vec<bool>) -> Self {
        LossPattern {
            pattern,
            position: 0,
        }
    }

    fn should_drop(&mut self) -> bool {
        let drop = self.pattern.get(self.position).copied().unwrap_or(false);
        self.position += 1;
        drop
    }
}

/// Datagram counters for one [`Link`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub decode_errors: u64,
}

/// In-memory link between a client and a server session
pub struct Link {
    pub client: Session,
    pub server: Session,
    pub now: Instant,
    loss: LossPattern,
    stats: LinkStats,
}

impl Link {
    /// Create both ends without connecting them
    pub fn new(config: SessionConfig, server_key: u32, loss: LossPattern) -> Self {
        let factory = Arc::new(MessageFactory::default());
        let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();
        let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();

        Link {
            client: Session::new_client(server_addr, 0x0BAD_CAFE, config.clone(), factory.clone()),
            server: Session::new_server(client_addr, server_key, config, factory),
            now: Instant::now(),
            loss,
            stats: LinkStats::default(),
        }
    }

    /// Create both ends and complete the handshake over a lossless link
    pub fn connected(config: SessionConfig) -> Self {
        let mut link = Link::new(config, 0x5EED_1234, LossPattern::none());
        link.handshake();
        link
    }

    /// Connect the client, panicking if the handshake does not finish
    pub fn handshake(&mut self) {
        self.client.connect();
        for _ in 0..1000 {
            self.step(Duration::from_millis(10));
            if self.client.status() == SessionStatus::Connected
                && self.server.status() == SessionStatus::Connected
            {
                return;
            }
        }
        panic!(
            "handshake did not complete: client {} server {}",
            self.client.status(),
            self.server.status()
        );
    }

    /// Swap in a new loss pattern
    pub fn set_loss(&mut self, loss: LossPattern) {
        self.loss = loss;
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Advance time by `elapsed`, tick both ends and move every queued packet
    pub fn step(&mut self, elapsed: Duration) {
        self.now += elapsed;
        self.client.process_write_thread(self.now);
        self.server.process_write_thread(self.now);
        self.transfer(true);
        self.transfer(false);
    }

    fn transfer(&mut self, client_to_server: bool) {
        let (from, to) = if client_to_server {
            (&self.client, &self.server)
        } else {
            (&self.server, &self.client)
        };

        let mut packets = Vec::new();
        while let Some(packet) = from.get_outgoing_reliable_packet() {
            packets.push(packet);
        }
        while let Some(packet) = from.get_outgoing_unreliable_packet() {
            packets.push(packet);
        }

        for packet in packets {
            let send = from.wire_params();
            let encoded = SessionCodec::new(send.encrypt_key, send.crc_length, send.use_compression)
                .and_then(|codec| codec.encode(&packet))
                .expect("encode");

            if self.loss.should_drop() {
                self.stats.dropped += 1;
                continue;
            }

            let recv = to.wire_params();
            match SessionCodec::new(recv.encrypt_key, recv.crc_length, recv.use_compression)
                .and_then(|codec| codec.decode(&encoded))
            {
                Ok(decoded) => {
                    self.stats.delivered += 1;
                    to.handle_session_packet(&decoded, self.now);
                }
                Err(e) => {
                    self.stats.decode_errors += 1;
                    to.record_protocol_error(&e.to_string());
                }
            }
        }
    }

    /// Step until `done` holds or `max_steps` pass; returns whether it held
    pub fn run_until(
        &mut self,
        step: Duration,
        max_steps: usize,
        mut done: impl FnMut(&Link) -> bool,
    ) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            self.step(step);
        }
        done(self)
    }

    /// Drain every message delivered to the server
    pub fn server_messages(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.server.get_incoming_queue_message())
            .map(|m| m.into_vec())
            .collect()
    }
}
