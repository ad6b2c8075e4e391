//! Benchmarks for frame encoding and the streaming decoder
//!
//! Tracks the per-frame cost of the hot receive path:
//! - encode: payload serialization plus the CRC-32 trailer
//! - decode: sync scan, length check, CRC validation, payload parse
//! - resync: recovery cost when line noise separates valid frames

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use downlink::wire::{Frame, FrameCodec, RpcRequest, Telemetry};
use std::hint::black_box;

fn telemetry_frame(payload: usize) -> Frame {
    let records = (0..payload).map(|i| (i % 251) as u8).collect();
    Frame::Telemetry(Telemetry { device: 0x5150, records })
}

fn encoded_stream(frames: usize, payload: usize) -> Vec<u8> {
    let bytes = telemetry_frame(payload).encode().expect("telemetry frame encodes");
    let mut stream = Vec::with_capacity(bytes.len() * frames);
    for _ in 0..frames {
        stream.extend_from_slice(&bytes);
    }
    stream
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    let request = Frame::RpcRequest(RpcRequest {
        correlation: 7,
        device: 0x11,
        method: 3,
        args: vec![0u8; 32],
    });
    group.bench_function("rpc_request_32b", |b| {
        b.iter(|| {
            let bytes = black_box(&request).encode().expect("frame encodes");
            black_box(bytes)
        })
    });

    for payload in [64usize, 1024] {
        let frame = telemetry_frame(payload);
        group.throughput(Throughput::Bytes(payload as u64));
        group.bench_function(format!("telemetry_{payload}b"), |b| {
            b.iter(|| {
                let bytes = black_box(&frame).encode().expect("frame encodes");
                black_box(bytes)
            })
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for payload in [64usize, 1024] {
        let stream = encoded_stream(64, payload);
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_function(format!("clean_stream_{payload}b"), |b| {
            b.iter(|| {
                let mut codec = FrameCodec::new();
                let frames: Vec<Frame> = codec.feed(black_box(&stream)).collect();
                black_box(frames)
            })
        });
    }

    group.finish();
}

fn bench_resync(c: &mut Criterion) {
    let frame = telemetry_frame(256).encode().expect("telemetry frame encodes");
    let mut noisy = Vec::new();
    for chunk in 0u8..32 {
        noisy.extend(std::iter::repeat_n(chunk, 48));
        noisy.extend_from_slice(&frame);
    }

    let mut group = c.benchmark_group("frame_resync");
    group.throughput(Throughput::Bytes(noisy.len() as u64));
    group.bench_function("noise_between_frames", |b| {
        b.iter(|| {
            let mut codec = FrameCodec::new();
            let frames: Vec<Frame> = codec.feed(black_box(&noisy)).collect();
            black_box(frames)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_resync);
criterion_main!(benches);
