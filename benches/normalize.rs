//! Benchmarks for address-list normalization.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use edgewall::normalizer::normalize;
use edgewall::prefix::FamilyFilter;
use edgewall::translator::prefix_len_to_mask;
use std::hint::black_box;

/// Distinct IPv4 and IPv6 prefixes, roughly the shape of a published list
fn generate_prefixes(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            if i % 4 == 3 {
                format!("2001:db8:{:x}::/48", i)
            } else {
                let a = 1 + (i / 65536) % 223;
                let b = (i / 256) % 256;
                let c = i % 256;
                format!("{}.{}.{}.0/{}", a, b, c, 20 + (i % 5))
            }
        })
        .collect()
}

fn json_payload(prefixes: &[String]) -> String {
    serde_json::to_string(prefixes).unwrap()
}

fn text_payload(prefixes: &[String]) -> String {
    prefixes.join("\n")
}

/// Prefixes buried in prose, forcing the pattern scan
fn noisy_payload(prefixes: &[String]) -> String {
    prefixes
        .iter()
        .map(|p| format!("node <{}> status=ok;", p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    for size in [100, 1000, 10000] {
        let prefixes = generate_prefixes(size);

        let json = json_payload(&prefixes);
        group.bench_with_input(BenchmarkId::new("json", size), &json, |b, payload| {
            b.iter(|| black_box(normalize(payload.as_bytes(), FamilyFilter::Both)))
        });

        let text = text_payload(&prefixes);
        group.bench_with_input(BenchmarkId::new("text", size), &text, |b, payload| {
            b.iter(|| black_box(normalize(payload.as_bytes(), FamilyFilter::Both)))
        });

        let noisy = noisy_payload(&prefixes);
        group.bench_with_input(BenchmarkId::new("noisy", size), &noisy, |b, payload| {
            b.iter(|| black_box(normalize(payload.as_bytes(), FamilyFilter::V4)))
        });
    }

    group.finish();
}

fn bench_mask(c: &mut Criterion) {
    c.bench_function("prefix_len_to_mask/all", |b| {
        b.iter(|| {
            for len in 0..=32u8 {
                black_box(prefix_len_to_mask(black_box(len)));
            }
        })
    });
}

criterion_group!(benches, bench_normalize, bench_mask);
criterion_main!(benches);
