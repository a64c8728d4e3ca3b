//! Service tests over real loopback sockets

use soe::{Message, Service, ServiceConfig, Session, SessionStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn collect(session: &Session, count: usize) -> Vec<Vec<u8>> {
    let mut received = Vec::new();
    wait_for(|| {
        while let Some(message) = session.get_incoming_queue_message() {
            received.push(message.into_vec());
        }
        received.len() >= count
    });
    received
}

fn connected_pair(config: ServiceConfig) -> (Service, Service, Arc<Session>, Arc<Session>) {
    let server = Service::bind(localhost(), config.clone()).unwrap();
    let client = Service::bind(
        localhost(),
        ServiceConfig {
            accept_incoming: false,
            ..config
        },
    )
    .unwrap();

    let session = client.connect(server.local_addr().unwrap()).unwrap();
    let accepted = server.accept(Duration::from_secs(5)).unwrap();
    assert!(wait_for(|| session.status() == SessionStatus::Connected));
    (server, client, session, accepted)
}

#[test]
fn test_compressed_session_both_directions() {
    let mut config = ServiceConfig::default();
    config.session.crc_length = 4;
    config.session.use_compression = true;
    let (server, client, session, accepted) = connected_pair(config);

    assert!(session.wire_params().use_compression);
    assert_eq!(session.wire_params(), accepted.wire_params());

    let large: Vec<u8> = (0..50_000u32).map(|i| (i % 97) as u8 + 1).collect();
    session.send_channel_a(Message::from_slice(&large)).unwrap();
    session.send_channel_b(Message::from_slice(b"\x03after")).unwrap();
    accepted.send_channel_a(Message::from_slice(b"\x04reply")).unwrap();

    let received = collect(&accepted, 2);
    assert_eq!(received, vec![large, b"\x03after".to_vec()]);
    assert_eq!(collect(&session, 1), vec![b"\x04reply".to_vec()]);

    assert_eq!(server.stats().decode_errors, 0);
    assert_eq!(client.stats().decode_errors, 0);
}

#[test]
fn test_many_messages_arrive_in_order() {
    let (_server, _client, session, accepted) = connected_pair(ServiceConfig::default());

    let messages: Vec<Vec<u8>> = (0..2000u32)
        .map(|i| {
            let mut body = vec![0x01];
            body.extend_from_slice(&i.to_be_bytes());
            body.resize(5 + (i as usize % 700), 0xEE);
            body
        })
        .collect();
    for body in &messages {
        session.send_channel_a(Message::from_slice(body)).unwrap();
    }

    assert_eq!(collect(&accepted, messages.len()), messages);
    assert_eq!(accepted.stats().protocol_errors, 0);
}

#[test]
fn test_unreliable_lane_over_loopback() {
    let (_server, _client, session, accepted) = connected_pair(ServiceConfig::default());

    for i in 1..=10u8 {
        session
            .send_channel_a_unreliable(Message::from_slice(&[i, 0xAA, 0xBB]))
            .unwrap();
    }

    let mut received = collect(&accepted, 10);
    received.sort();
    let expected: Vec<Vec<u8>> = (1..=10u8).map(|i| vec![i, 0xAA, 0xBB]).collect();
    assert_eq!(received, expected);
}

#[test]
fn test_server_tracks_sessions() {
    let (server, _client, session, _accepted) = connected_pair(ServiceConfig::default());
    let local = session.peer();

    assert_eq!(server.sessions().len(), 1);
    assert_eq!(server.stats().sessions_created, 1);
    assert_eq!(local, server.local_addr().unwrap());

    session.disconnect();
    assert!(wait_for(|| server
        .sessions()
        .iter()
        .all(|s| s.status().is_terminal())));
}
