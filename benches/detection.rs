//! Detection and line-splitting benchmarks

use cabletest_core::core::poller::payload_lines;
use cabletest_core::{DetectionEngine, StreamSource};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

fn sample_payload() -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..200 {
        data.extend_from_slice(format!("link_cable: waiting for peer, attempt {i}\r\n").as_bytes());
    }
    data.extend_from_slice(b"\xff\xfe partial garbage \n");
    data
}

fn lines_benchmark(c: &mut Criterion) {
    let data = sample_payload();

    let mut group = c.benchmark_group("poller");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("payload_lines", |b| {
        b.iter(|| {
            let lines = payload_lines(black_box(&data));
            black_box(lines)
        })
    });

    group.finish();
}

fn detection_benchmark(c: &mut Criterion) {
    let lines = payload_lines(&sample_payload());

    let mut group = c.benchmark_group("detection");
    group.throughput(Throughput::Elements(lines.len() as u64));

    group.bench_function("scan_no_match", |b| {
        b.iter(|| {
            let mut engine = DetectionEngine::new();
            for line in &lines {
                engine.scan(black_box(line), StreamSource::LinkLog, 1);
            }
            black_box(engine.is_detected())
        })
    });

    group.bench_function("scan_latched", |b| {
        let mut engine = DetectionEngine::new();
        engine.scan("SCIXB START", StreamSource::Capture, 1);
        b.iter(|| {
            for line in &lines {
                engine.scan(black_box(line), StreamSource::Capture, 2);
            }
            black_box(engine.event().is_some())
        })
    });

    group.finish();
}

criterion_group!(benches, lines_benchmark, detection_benchmark);
criterion_main!(benches);
