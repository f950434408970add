use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use srt_protocol::buffer::{IncomingPacket, MessageOptions, ReceiveBuffer, SendBuffer};
use srt_protocol::control::{AckInfo, ControlMessage};
use srt_protocol::loss::{LossRange, SenderLossList};
use srt_protocol::packet::{DataPacket, MsgNumber, Packet, PacketBoundary, MAX_PAYLOAD_SIZE};
use srt_protocol::sequence::SeqNumber;
use std::time::Instant;

fn data_packet() -> Packet {
    Packet::Data(DataPacket {
        seq: SeqNumber::new(1000),
        boundary: PacketBoundary::Solo,
        in_order: false,
        key: None,
        retransmitted: false,
        msg_number: MsgNumber::new(100),
        timestamp: 5000,
        dest_socket_id: 9999,
        payload: Bytes::from(vec![0u8; 1316]),
    })
}

fn bench_data_packet(c: &mut Criterion) {
    let packet = data_packet();
    let bytes = packet.to_bytes();

    let mut group = c.benchmark_group("data_packet");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("serialize", |b| {
        b.iter(|| black_box(black_box(&packet).to_bytes()));
    });
    group.bench_function("deserialize", |b| {
        b.iter(|| black_box(Packet::from_bytes(black_box(&bytes)).unwrap()));
    });
    group.finish();
}

fn bench_ack_packet(c: &mut Criterion) {
    let message = ControlMessage::Ack {
        journal: 7,
        info: AckInfo::new(SeqNumber::new(5000)),
    };
    let packet = Packet::Control(message.clone().into_packet(1000, 9999));
    let bytes = packet.to_bytes();

    c.bench_function("ack_encode", |b| {
        b.iter(|| black_box(black_box(message.clone()).into_packet(1000, 9999)));
    });
    c.bench_function("ack_decode", |b| {
        b.iter(|| match Packet::from_bytes(black_box(&bytes)).unwrap() {
            Packet::Control(control) => black_box(ControlMessage::from_packet(&control).unwrap()),
            Packet::Data(_) => unreachable!(),
        });
    });
}

fn bench_seq_number_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_number");

    group.bench_function("next", |b| {
        let mut seq = SeqNumber::new(1000);
        b.iter(|| {
            seq = black_box(seq.next());
        });
    });

    group.bench_function("distance_across_wrap", |b| {
        let a = SeqNumber::new(0x7FFF_FF00);
        let z = SeqNumber::new(0x100);
        b.iter(|| black_box(black_box(a).distance_to(black_box(z))));
    });

    group.finish();
}

fn bench_sender_loss_list(c: &mut Criterion) {
    c.bench_function("sender_loss_scattered", |b| {
        b.iter(|| {
            let mut list = SenderLossList::new();
            for i in 0..256u32 {
                let start = SeqNumber::new(i * 4);
                list.add_range(LossRange::new(start, start + 1));
            }
            while let Some(seq) = list.pop_next() {
                black_box(seq);
            }
        });
    });
}

fn bench_buffers(c: &mut Criterion) {
    let payload = vec![0u8; MAX_PAYLOAD_SIZE];

    c.bench_function("send_buffer_push_ack", |b| {
        let now = Instant::now();
        b.iter(|| {
            let mut buffer = SendBuffer::new(8192, SeqNumber::new(0));
            let opts = MessageOptions {
                ttl: None,
                in_order: false,
                origin: now,
            };
            for _ in 0..1024 {
                buffer.push_message(&payload, MAX_PAYLOAD_SIZE, opts).unwrap();
            }
            while buffer.next_packet(now).is_some() {}
            black_box(buffer.acknowledge(SeqNumber::new(1024)));
        });
    });

    c.bench_function("receive_buffer_insert_pop", |b| {
        let now = Instant::now();
        let data = Bytes::from(payload.clone());
        b.iter(|| {
            let mut buffer = ReceiveBuffer::new(8192, SeqNumber::new(0));
            for i in 0..1024u32 {
                buffer.insert(IncomingPacket {
                    seq: SeqNumber::new(i),
                    msg_number: MsgNumber::new(i + 1),
                    boundary: PacketBoundary::Solo,
                    in_order: false,
                    timestamp: i * 1000,
                    release: None,
                    payload: data.clone(),
                });
            }
            while let Some(delivery) = buffer.pop_message(now, false) {
                black_box(delivery);
            }
        });
    });
}

criterion_group!(
    benches,
    bench_data_packet,
    bench_ack_packet,
    bench_seq_number_ops,
    bench_sender_loss_list,
    bench_buffers
);
criterion_main!(benches);
