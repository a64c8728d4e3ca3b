use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use soe_protocol::fragment::{Packetizer, Reassembler};
use soe_protocol::message::{Message, MessageQueue};
use soe_protocol::packet::{Channel, SessionPacket};
use soe_protocol::sequence::SeqNumber;

fn bench_data_packet_serialize(c: &mut Criterion) {
    let packet = SessionPacket::Data {
        channel: Channel::A,
        seq: SeqNumber::new(1000),
        payload: Bytes::from(vec![1u8; 480]),
    };

    c.bench_function("data_packet_serialize", |b| {
        b.iter(|| {
            let bytes = black_box(&packet).to_bytes();
            black_box(bytes);
        });
    });
}

fn bench_data_packet_deserialize(c: &mut Criterion) {
    let bytes = SessionPacket::Data {
        channel: Channel::A,
        seq: SeqNumber::new(1000),
        payload: Bytes::from(vec![1u8; 480]),
    }
    .to_bytes();

    c.bench_function("data_packet_deserialize", |b| {
        b.iter(|| {
            let packet = SessionPacket::from_bytes(black_box(&bytes)).unwrap();
            black_box(packet);
        });
    });
}

fn bench_fragment_and_reassemble(c: &mut Criterion) {
    let packetizer = Packetizer::new(488);
    let message = Message::from_vec(vec![7u8; 64 * 1024]);

    let mut group = c.benchmark_group("fragmentation");
    group.throughput(Throughput::Bytes(message.len() as u64));

    group.bench_function("fragment_64k", |b| {
        b.iter(|| {
            let mut seq = SeqNumber::new(0);
            let packets =
                packetizer.build_outgoing_reliable_packets(black_box(&message), Channel::A, &mut seq);
            black_box(packets);
        });
    });

    let mut seq = SeqNumber::new(0);
    let packets = packetizer.build_outgoing_reliable_packets(&message, Channel::A, &mut seq);
    let fragments: Vec<(SeqNumber, Bytes)> = packets
        .iter()
        .map(|p| match SessionPacket::from_bytes(&p.data).unwrap() {
            SessionPacket::Fragment { seq, payload, .. } => (seq, payload),
            other => panic!("unexpected packet {:?}", other.packet_type()),
        })
        .collect();

    group.bench_function("reassemble_64k", |b| {
        b.iter(|| {
            let mut reassembler = Reassembler::new(1024 * 1024);
            let mut out = None;
            for (seq, payload) in &fragments {
                out = reassembler
                    .process_fragmented_packet(Channel::A, *seq, payload)
                    .unwrap();
            }
            black_box(out);
        });
    });

    group.finish();
}

fn bench_coalesce(c: &mut Criterion) {
    let packetizer = Packetizer::new(488);

    c.bench_function("coalesce_small_messages", |b| {
        b.iter(|| {
            let mut queue = MessageQueue::new();
            for i in 0..64u8 {
                queue.push(Message::from_vec(vec![i | 1; 24]));
            }
            let mut seq = SeqNumber::new(0);
            while !queue.is_empty() {
                black_box(packetizer.build_from_queue(&mut queue, &mut seq));
            }
        });
    });
}

fn bench_seq_number_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_number");

    group.bench_function("increment", |b| {
        let mut seq = SeqNumber::new(1000);
        b.iter(|| {
            seq.increment();
            black_box(&seq);
        });
    });

    group.bench_function("comparison", |b| {
        let before = SeqNumber::new(65530);
        let after = SeqNumber::new(4);
        b.iter(|| {
            let result = black_box(before).lt(black_box(after));
            black_box(result);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_data_packet_serialize,
    bench_data_packet_deserialize,
    bench_fragment_and_reassemble,
    bench_coalesce,
    bench_seq_number_ops
);
criterion_main!(benches);
