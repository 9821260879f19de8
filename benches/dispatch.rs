//! Header decode and reorder window throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use feed_sequencer::{
    Channel, HeaderDecoder, ObjectType, PacketHandler, PacketHeader, ReorderBuffer, ReorderConfig, ResetReason,
    HEADER_SIZE,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

struct Sink {
    bytes: usize,
}

impl PacketHandler for Sink {
    fn initial_sequence(&mut self, first: u64) -> u64 {
        first
    }

    fn parse(&mut self, _sequence: u64, payload: &[u8]) {
        self.bytes += payload.len();
    }

    fn reset(&mut self, reason: ResetReason) {
        panic!("unexpected reset: {reason:?}");
    }
}

fn create_datagrams(sequences: &[u64]) -> Vec<Vec<u8>> {
    sequences
        .iter()
        .map(|&sequence| {
            let header = PacketHeader {
                control: 0x01,
                object_type: ObjectType::MarketByPrice,
                session_id: 1,
                sequence_number: sequence,
                ..PacketHeader::default()
            };
            let mut datagram = vec![0u8; HEADER_SIZE + 200];
            HeaderDecoder::encode(&header, &mut datagram).unwrap();
            datagram
        })
        .collect()
}

fn bench_header_decode(c: &mut Criterion) {
    let datagrams = create_datagrams(&[42]);
    c.bench_function("header_decode", |b| {
        b.iter(|| {
            let (header, payload) = HeaderDecoder::decode(black_box(&datagrams[0])).unwrap();
            black_box((header.channel() == Channel::Incremental, payload.len()))
        });
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let count = 10_000u64;

    for depth in [16usize, 64, 256] {
        let in_order: Vec<u64> = (1..=count).collect();
        let mut shuffled = in_order.clone();
        let mut rng = StdRng::seed_from_u64(depth as u64);
        for block in shuffled.chunks_mut(depth) {
            block.shuffle(&mut rng);
        }
        // the first packet opens the session
        if let Some(first) = shuffled.iter().position(|&s| s == 1) {
            shuffled.swap(0, first);
        }

        for (name, order) in [("in_order", &in_order), ("reordered", &shuffled)] {
            let datagrams = create_datagrams(order);
            group.bench_with_input(BenchmarkId::new(name, depth), &datagrams, |b, datagrams| {
                b.iter(|| {
                    let mut window = ReorderBuffer::new(ReorderConfig {
                        depth,
                        ..ReorderConfig::default()
                    })
                    .unwrap();
                    let mut sink = Sink { bytes: 0 };
                    for datagram in datagrams {
                        let (header, _) = HeaderDecoder::decode(datagram).unwrap();
                        window.dispatch(header.sequence_number, datagram, &mut sink);
                    }
                    black_box(sink.bytes)
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_header_decode, bench_dispatch);
criterion_main!(benches);
