//! End-to-end session tests
//!
//! A client and server session exchange packets in memory through the
//! session codec, with simulated time.

use bytes::Buf;
use soe_protocol::packet::MULTI_DATA_MARKER;
use soe_protocol::{Channel, Message, SeqNumber, SessionConfig, SessionPacket, SessionStatus};
use soe_tests::{Link, LossPattern};
use std::time::Duration;

const STEP: Duration = Duration::from_millis(5);

fn numbered(index: u32, len: usize) -> Message {
    let mut message = Message::new();
    message.write_u32(index);
    message.write_bytes(&vec![0x5A; len.saturating_sub(4)]);
    message
}

fn drain_reliable(session: &soe_protocol::Session) -> Vec<SessionPacket> {
    std::iter::from_fn(|| session.get_outgoing_reliable_packet())
        .map(|packet| SessionPacket::from_bytes(&packet).unwrap())
        .collect()
}

#[test]
fn test_sequence_wrap_keeps_order() {
    let config = SessionConfig {
        max_packet_size: 64,
        max_unreliable_size: 64,
        window: soe_protocol::WindowConfig {
            initial_size: 256,
            ..Default::default()
        },
        ..SessionConfig::default()
    };
    let mut link = Link::connected(config);
    let total = 70_000u32;

    for index in 0..total {
        link.client.send_channel_a(numbered(index, 40)).unwrap();
    }

    let mut next = 0u32;
    let mut misordered = 0;
    for _ in 0..20_000 {
        link.step(STEP);
        while let Some(mut message) = link.server.get_incoming_queue_message() {
            if message.read_u32().unwrap() != next {
                misordered += 1;
            }
            next += 1;
        }
        if next == total {
            break;
        }
    }

    assert_eq!(next, total);
    assert_eq!(misordered, 0);

    let stats = link.client.stats();
    assert!(stats.packets_sent > u16::MAX as u64);
    assert!(stats.max_in_flight <= 256);
    assert_eq!(link.server.stats().protocol_errors, 0);
}

#[test]
fn test_connect_timeout_without_server() {
    let config = SessionConfig {
        connect_max_retries: 3,
        connect_retry_interval: Duration::from_millis(100),
        ..SessionConfig::default()
    };
    let mut link = Link::new(config, 1, LossPattern::new(vec![true; 64]));

    link.client.connect();
    let finished = link.run_until(Duration::from_millis(50), 100, |link| {
        link.client.status().is_terminal()
    });

    assert!(finished);
    assert_eq!(link.client.status(), SessionStatus::Timeout);
    assert_eq!(link.stats().dropped, 3);
    assert_ne!(link.server.status(), SessionStatus::Connected);
}

#[test]
fn test_small_messages_coalesce_at_exact_budget() {
    // Reliable budget is max_packet_size minus the 4 byte header and 2 byte crc
    let config = SessionConfig {
        max_packet_size: 110,
        max_unreliable_size: 110,
        ..SessionConfig::default()
    };
    let mut link = Link::connected(config);

    link.client.send_channel_a(Message::from_vec(vec![1; 40])).unwrap();
    link.client.send_channel_a(Message::from_vec(vec![2; 60])).unwrap();
    link.client.process_write_thread(link.now);

    let packets = drain_reliable(&link.client);
    assert_eq!(packets.len(), 1);
    match &packets[0] {
        SessionPacket::Data { payload, .. } => {
            assert!(payload.starts_with(&MULTI_DATA_MARKER));
            assert_eq!(payload.len(), 104);
        }
        other => panic!("expected data packet, got {:?}", other),
    }
}

#[test]
fn test_small_messages_split_one_byte_over_budget() {
    let config = SessionConfig {
        max_packet_size: 109,
        max_unreliable_size: 109,
        ..SessionConfig::default()
    };
    let mut link = Link::connected(config);

    link.client.send_channel_a(Message::from_vec(vec![1; 40])).unwrap();
    link.client.send_channel_a(Message::from_vec(vec![2; 60])).unwrap();
    link.client.process_write_thread(link.now);

    assert_eq!(link.client.outgoing_reliable_packet_count(), 2);

    assert!(link.run_until(STEP, 10, |link| link.server.incoming_message_count() == 2));
    assert_eq!(link.server_messages(), vec![vec![1u8; 40], vec![2u8; 60]]);
}

#[test]
fn test_fragmented_message_packet_count() {
    // 80 byte payload budget: 76 + 80 + 44
    let config = SessionConfig {
        max_packet_size: 86,
        max_unreliable_size: 86,
        ..SessionConfig::default()
    };
    let mut link = Link::connected(config);
    let body: Vec<u8> = (0..200u32).map(|i| i as u8).collect();

    link.client.send_channel_a(Message::from_slice(&body)).unwrap();
    link.client.process_write_thread(link.now);

    let packets = drain_reliable(&link.client);
    assert_eq!(packets.len(), 3);
    let mut total_payload = 0;
    for packet in &packets {
        match packet {
            SessionPacket::Fragment { payload, .. } => total_payload += payload.len(),
            other => panic!("expected fragment, got {:?}", other),
        }
    }
    // Body plus the total-size prefix of the first fragment
    assert_eq!(total_payload, 204);
    if let SessionPacket::Fragment { payload, .. } = &packets[0] {
        assert_eq!(payload.clone().get_u32(), 200);
    }
}

#[test]
fn test_fragmented_message_delivered_through_codec() {
    let config = SessionConfig {
        crc_length: 4,
        use_compression: true,
        ..SessionConfig::default()
    };
    let mut link = Link::connected(config);
    let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    link.client.send_channel_a(Message::from_slice(&body)).unwrap();
    link.client.send_channel_b(Message::from_slice(b"\x02tail")).unwrap();

    assert!(link.run_until(STEP, 1000, |link| link.server.incoming_message_count() == 2));
    let messages = link.server_messages();
    assert_eq!(messages[0], body);
    assert_eq!(messages[1], b"\x02tail");
    assert_eq!(link.stats().decode_errors, 0);
    assert!(link.client.wire_params().use_compression);
}

#[test]
fn test_window_never_exceeds_resend_window() {
    let config = SessionConfig {
        resend_window_size: 8,
        ..SessionConfig::default()
    };
    let mut link = Link::connected(config);
    // Lose the first burst so the window fills up and stays full
    link.set_loss(LossPattern::new(vec![true; 8]));

    for index in 0..100 {
        link.client.send_channel_a(numbered(index, 300)).unwrap();
    }

    let done = link.run_until(STEP, 10_000, |link| {
        assert!(link.client.stats().in_flight <= 8);
        link.server.incoming_message_count() == 100
    });

    assert!(done);
    let stats = link.client.stats();
    assert!(stats.max_in_flight <= 8);
    assert!(stats.packets_resent > 0);
}

#[test]
fn test_out_of_order_held_and_duplicates_dropped() {
    let mut link = Link::connected(SessionConfig::default());
    let data = |seq: u16, body: &'static [u8]| {
        SessionPacket::Data {
            channel: Channel::A,
            seq: SeqNumber::new(seq),
            payload: bytes::Bytes::from_static(body),
        }
        .to_bytes()
    };

    link.server.handle_session_packet(&data(1, b"\x01second"), link.now);
    assert_eq!(link.server.incoming_message_count(), 0);

    let reports = drain_reliable(&link.server);
    assert!(reports.contains(&SessionPacket::OutOfOrder {
        channel: Channel::A,
        seq: SeqNumber::new(1),
    }));

    link.server.handle_session_packet(&data(0, b"\x01first"), link.now);
    link.server.handle_session_packet(&data(0, b"\x01first"), link.now);
    link.server.handle_session_packet(&data(1, b"\x01second"), link.now);

    link.server.process_write_thread(link.now);
    let acks = drain_reliable(&link.server);
    assert!(acks.contains(&SessionPacket::Ack {
        channel: Channel::A,
        seq: SeqNumber::new(1),
    }));

    assert_eq!(
        link.server_messages(),
        vec![b"\x01first".to_vec(), b"\x01second".to_vec()]
    );
    let stats = link.server.stats();
    assert_eq!(stats.out_of_order_held, 1);
    assert_eq!(stats.duplicates_dropped, 2);
}

#[test]
fn test_unreliable_lane_and_fallback() {
    let mut link = Link::connected(SessionConfig::default());

    link.client
        .send_channel_a_unreliable(Message::from_slice(b"\x07position"))
        .unwrap();
    // Leading zero would read as an opcode, so it goes reliable
    link.client
        .send_channel_a_unreliable(Message::from_slice(b"\x00\x09zero"))
        .unwrap();

    link.client.process_write_thread(link.now);
    assert_eq!(link.client.outgoing_unreliable_packet_count(), 1);

    assert!(link.run_until(STEP, 100, |link| link.server.incoming_message_count() == 2));
    let mut messages = link.server_messages();
    messages.sort();
    assert_eq!(messages, vec![b"\x00\x09zero".to_vec(), b"\x07position".to_vec()]);
}

#[test]
fn test_graceful_disconnect_through_codec() {
    let mut link = Link::connected(SessionConfig::default());

    link.client.disconnect();
    assert!(link.run_until(STEP, 100, |link| {
        link.client.status() == SessionStatus::Disconnected
            && link.server.status() == SessionStatus::Disconnected
    }));
    assert!(link
        .client
        .send_channel_a(Message::from_slice(b"\x01late"))
        .is_err());
}
