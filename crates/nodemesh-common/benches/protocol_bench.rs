// Criterion benchmarks for nodemesh-common envelope encoding
//
// Run benchmarks with:
//   cargo bench -p nodemesh-common
//
// For detailed output with plots:
//   cargo bench -p nodemesh-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nodemesh_common::transport::{EnvelopeFormat, FormatRegistry, FrameCodec};
use nodemesh_common::{Envelope, MessageType};
use serde_json::json;

fn sample_envelopes() -> Vec<(&'static str, Envelope)> {
    let heartbeat = Envelope::with_content(MessageType::Heartbeat, "Heartbeat").with_source("client-1");

    let data = Envelope::with_content(MessageType::Data, "x".repeat(1024))
        .with_source("client-1")
        .with_target("node-1")
        .with_attribute("meta", json!({"shard": 3, "replicas": ["a", "b", "c"]}));

    let payload = Envelope::new(MessageType::Data)
        .with_source("client-1")
        .with_binary_payload(vec![0xAB; 16 * 1024]);

    vec![("heartbeat", heartbeat), ("data_1k", data), ("binary_16k", payload)]
}

fn bench_envelope_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_creation");

    group.bench_function("new", |b| {
        b.iter(|| Envelope::new(black_box(MessageType::Heartbeat)));
    });

    group.bench_function("response_to", |b| {
        let request = Envelope::with_content(MessageType::Data, "ping").with_source("client-1");
        b.iter(|| Envelope::response_to(black_box(&request), black_box("Data received")));
    });

    group.finish();
}

fn bench_format_encode(c: &mut Criterion) {
    let registry = FormatRegistry::new();
    let mut group = c.benchmark_group("format_encode");

    for name in registry.available_formats() {
        let format = registry.get(&name);
        for (label, envelope) in sample_envelopes() {
            group.bench_with_input(BenchmarkId::new(name.clone(), label), &envelope, |b, env| {
                b.iter(|| format.encode(black_box(env)));
            });
        }
    }

    group.finish();
}

fn bench_format_decode(c: &mut Criterion) {
    let registry = FormatRegistry::new();
    let mut group = c.benchmark_group("format_decode");

    for name in registry.available_formats() {
        let format = registry.get(&name);
        for (label, envelope) in sample_envelopes() {
            let Ok(encoded) = format.encode(&envelope) else {
                continue;
            };
            group.bench_with_input(BenchmarkId::new(name.clone(), label), &encoded, |b, bytes| {
                b.iter(|| format.decode(black_box(bytes)));
            });
        }
    }

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let codec = FrameCodec::new();
    let payload = vec![7u8; 4096];
    let framed = codec.encode(&payload).unwrap_or_default();

    let mut group = c.benchmark_group("framing");

    group.bench_function("encode_4k", |b| {
        b.iter(|| codec.encode(black_box(&payload)));
    });

    group.bench_function("decode_4k", |b| {
        b.iter(|| codec.decode(black_box(&framed)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_creation,
    bench_format_encode,
    bench_format_decode,
    bench_framing
);
criterion_main!(benches);
