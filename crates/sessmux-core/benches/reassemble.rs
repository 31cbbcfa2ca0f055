use std::ops::ControlFlow;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sessmux_core::frame::encode_frame;
use sessmux_core::{Reassembler, RingBuffer};

fn stream_of(frames: usize, payload: usize) -> Vec<u8> {
    let body = vec![0xA5u8; payload];
    let mut out = Vec::with_capacity(frames * (payload + 8));
    for i in 0..frames {
        out.extend(encode_frame(i as u32, &body).unwrap());
    }
    out
}

fn bench_single_arrival(c: &mut Criterion) {
    let r = Reassembler::new(5, 64 * 1024);
    let stream = stream_of(64, 120);

    let mut group = c.benchmark_group("reassemble");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("64x128B_one_read", |b| {
        let mut buf = RingBuffer::new(stream.len());
        b.iter(|| {
            let mut errors = 0;
            buf.append(&stream).unwrap();
            let res = r.feed(&mut buf, &mut errors, stream.len(), |f| {
                black_box(f.payload);
                ControlFlow::Continue(())
            });
            black_box(res.dispatched)
        })
    });
    group.finish();
}

fn bench_small_reads(c: &mut Criterion) {
    let r = Reassembler::new(5, 64 * 1024);
    let stream = stream_of(16, 1000);

    let mut group = c.benchmark_group("reassemble");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("16x1KB_100B_reads", |b| {
        let mut buf = RingBuffer::new(4096);
        b.iter(|| {
            let mut errors = 0;
            let mut frames = 0;
            for chunk in stream.chunks(100) {
                buf.append(chunk).unwrap();
                frames += r
                    .feed(&mut buf, &mut errors, chunk.len(), |f| {
                        black_box(f.kind());
                        ControlFlow::Continue(())
                    })
                    .dispatched;
            }
            black_box(frames)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_single_arrival, bench_small_reads);
criterion_main!(benches);
