//! Criterion benchmarks for the event hot paths.
//!
//! Every event crosses the DATA channel serialized and is decoded again by
//! the DataReceiver, then merged by the synchronizer. These benchmarks track
//! the cost of each step.
//!
//! Run with: cargo bench --bench event_serialization

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_eudaq::event::{Event, EventRegistry};
use rust_eudaq::sync::{EventSynchronizer, IndexSync};
use std::sync::Arc;

fn raw_event(payload: usize) -> Event {
    let mut ev = Event::raw("Bench", 0, 1, 1);
    ev.set_tag("Temperature", 21.5);
    ev.add_block(0, vec![0xA5u8; payload]);
    ev
}

/// Encode and decode throughput for several payload sizes.
fn event_round_trip(c: &mut Criterion) {
    let registry = EventRegistry::with_defaults();
    let mut group = c.benchmark_group("event_codec");

    for (name, size) in [("64B", 64), ("1KB", 1024), ("16KB", 16 * 1024), ("256KB", 256 * 1024)] {
        let ev = raw_event(size);
        let bytes = ev.to_bytes();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", name), &ev, |b, ev| {
            b.iter(|| black_box(ev.to_bytes()));
        });
        group.bench_with_input(BenchmarkId::new("decode", name), &bytes, |b, bytes| {
            b.iter(|| registry.decode(black_box(bytes.clone())).unwrap());
        });
    }

    group.finish();
}

/// Index merge of 1000 events from each of several streams.
fn synchronizer_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("synchronizer");

    for streams in [2u32, 4, 8] {
        let events: Vec<Vec<Arc<Event>>> = (0..streams)
            .map(|s| {
                let mut stream = vec![Arc::new(Event::bore("Bench", s, 1))];
                stream.extend((1..=1000).map(|n| Arc::new(Event::raw("Bench", s, 1, n))));
                stream.push(Arc::new(Event::eore("Bench", s, 1, 1001)));
                stream
            })
            .collect();

        group.throughput(Throughput::Elements(1002));
        group.bench_with_input(BenchmarkId::new("index", streams), &events, |b, events| {
            b.iter(|| {
                let mut sync = EventSynchronizer::new(Box::new(IndexSync));
                for s in 0..streams {
                    sync.add_stream(s);
                }
                let mut emitted = 0;
                for i in 0..events[0].len() {
                    for (s, stream) in events.iter().enumerate() {
                        sync.push(Arc::clone(&stream[i]), s as u32);
                    }
                    while sync.pop_output().is_some() {
                        emitted += 1;
                    }
                }
                black_box(emitted)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, event_round_trip, synchronizer_merge);
criterion_main!(benches);
