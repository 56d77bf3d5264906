//! Performance benchmarks for the analysis hot path

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pnet::packet::tcp::TcpFlags;

use icsmap::classify::classify;
use icsmap::detection::{DetectionEngine, DetectionMethod, DetectionResult};
use icsmap::model::{Asset, AssetId};
use icsmap::network::{testing, CapturedPacket};
use icsmap::pipeline::build_local_model;

const MODBUS_QUERY: &[u8] = &[
    0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0a,
];

fn modbus_frame(src_port: u16) -> Vec<u8> {
    testing::tcp_frame(
        "00:11:22:33:44:55".parse().unwrap(),
        "00:1d:9c:01:02:03".parse().unwrap(),
        "10.0.0.20".parse().unwrap(),
        "10.0.0.10".parse().unwrap(),
        src_port,
        502,
        TcpFlags::PSH | TcpFlags::ACK,
        64,
        8192,
        MODBUS_QUERY,
    )
}

fn bench_decode(c: &mut Criterion) {
    let frame = modbus_frame(49152);
    c.bench_function("decode_modbus_frame", |b| {
        b.iter(|| CapturedPacket::decode(black_box(&frame), Utc::now()).unwrap())
    });
}

fn bench_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("detection");
    let packet = CapturedPacket::decode(&modbus_frame(49152), Utc::now()).unwrap();

    group.bench_function("analyze_cold_cache", |b| {
        b.iter_with_setup(
            || DetectionEngine::with_default_analyzers(1024),
            |engine| black_box(engine.analyze_packet(black_box(&packet))),
        )
    });

    let warm = DetectionEngine::with_default_analyzers(1024);
    warm.analyze_packet(&packet);
    group.bench_function("analyze_warm_cache", |b| {
        b.iter(|| black_box(warm.analyze_packet(black_box(&packet))))
    });

    group.finish();
}

fn bench_cache_pressure(c: &mut Criterion) {
    let result = DetectionResult::new("Modbus", 0.95, DetectionMethod::Dpi, "");
    c.bench_function("cache_insert_with_eviction", |b| {
        b.iter_with_setup(
            || icsmap::detection::DetectionCache::new(256),
            |cache| {
                for key in 0..1024u64 {
                    cache.insert(key, result.clone());
                }
                black_box(cache.len())
            },
        )
    });
}

fn bench_local_model(c: &mut Criterion) {
    let engine = DetectionEngine::with_default_analyzers(1024);
    let packet = CapturedPacket::decode(&modbus_frame(49152), Utc::now()).unwrap();
    engine.analyze_packet(&packet);
    c.bench_function("build_local_model", |b| {
        b.iter(|| black_box(build_local_model(black_box(&packet), &engine)))
    });
}

fn bench_classifier(c: &mut Criterion) {
    let mut asset = Asset::new(AssetId::Ip("10.0.0.10".parse().unwrap()));
    let peer = AssetId::Ip("10.0.0.20".parse().unwrap());
    for _ in 0..50 {
        asset.record_received("Modbus", peer);
    }
    for _ in 0..5 {
        asset.record_initiated("Modbus", peer);
    }
    asset.observe_port(502);

    c.bench_function("classify_modbus_server", |b| {
        b.iter(|| black_box(classify(black_box(&asset))))
    });
}

criterion_group!(
    benches,
    bench_decode,
    bench_detection,
    bench_cache_pressure,
    bench_local_model,
    bench_classifier
);
criterion_main!(benches);
