//! Benchmarks for log bundle parsing and name canonicalization
//!
//! A detail view parses a whole backup log bundle per request.

use console_orchestrator::{canonicalize, LogParser};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

fn sample_log(lines: usize) -> String {
    let mut out = String::new();
    for i in 0..lines {
        match i % 4 {
            0 => out.push_str(&format!(
                "time=\"2024-03-01T10:00:{:02}Z\" level=info msg=\"running exec hook\" backup=velero/manual-1 hookName=quiesce hookPhase=pre name=db-{} namespace=shop\n",
                i % 60,
                i
            )),
            1 => out.push_str(&format!(
                "time=\"2024-03-01T10:00:{:02}Z\" level=info msg=\"stdout: flushed tables\" hookName=quiesce hookPhase=pre name=db-{} namespace=shop\n",
                i % 60,
                i - 1
            )),
            2 => out.push_str(&format!(
                "time=\"2024-03-01T10:00:{:02}Z\" level=info msg=\"Backing up item\" backup=velero/manual-1 resource=pods name=web-{}\n",
                i % 60,
                i
            )),
            _ => out.push_str("not a log line\n"),
        }
    }
    out
}

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(text.as_bytes());
    encoder.finish().unwrap_or_default()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_parser");

    let text = sample_log(10_000);
    let bundle = gzip(&text);
    group.throughput(Throughput::Bytes(text.len() as u64));

    group.bench_function("parse_text_10k_lines", |b| {
        b.iter(|| LogParser::parse_text(black_box(&text)))
    });

    group.bench_function("parse_gzip_bundle_10k_lines", |b| {
        b.iter(|| LogParser::parse(black_box(&bundle)))
    });

    group.finish();
}

fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("names");
    group.throughput(Throughput::Elements(1));

    let short = "manual-1709287200000";
    let long = format!("backup-{}-1709287200", "a".repeat(80));

    group.bench_function("canonicalize_short", |b| {
        b.iter(|| canonicalize(black_box(short)))
    });
    group.bench_function("canonicalize_long", |b| {
        b.iter(|| canonicalize(black_box(&long)))
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_canonicalize);
criterion_main!(benches);
