//! Benchmarks for CIDR aggregation performance.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ipnet::IpNet;
use rtbh::aggregator::{aggregate, SourceBlob};
use rtbh::config::RenderConfig;
use rtbh::netset::{DualStackSet, NetworkSet};
use rtbh::render::{render, Artifact};
use std::hint::black_box;
use std::str::FromStr;

/// Generate random-ish IPv4 addresses for benchmarking
fn generate_ips(count: usize) -> Vec<IpNet> {
    (0..count)
        .map(|i| {
            let a = (i % 256) as u8;
            let b = ((i / 256) % 256) as u8;
            let c = ((i / 65536) % 256) as u8;
            let d = ((i / 16777216) % 256) as u8;
            IpNet::from_str(&format!("{}.{}.{}.{}/32", a, b, c, d)).unwrap()
        })
        .collect()
}

/// Generate CIDRs of varying sizes
fn generate_cidrs(count: usize) -> Vec<IpNet> {
    (0..count)
        .map(|i| {
            let a = (i % 256) as u8;
            let b = ((i / 256) % 256) as u8;
            let prefix = 16 + (i % 17) as u8; // Prefix lengths 16-32
            IpNet::from_str(&format!("{}.{}.0.0/{}", a, b, prefix)).unwrap()
        })
        .collect()
}

/// Generate IPv6 /48s spread over a few /32s
fn generate_v6(count: usize) -> Vec<IpNet> {
    (0..count)
        .map(|i| {
            let top = 0x2001 + (i % 4) as u16;
            let site = (i / 4) as u16;
            IpNet::from_str(&format!("{:x}:db8:{:x}::/48", top, site)).unwrap()
        })
        .collect()
}

fn bench_union(c: &mut Criterion) {
    let mut group = c.benchmark_group("union");

    for size in [100, 1000, 10000, 50000] {
        let ips = generate_ips(size);
        group.bench_with_input(BenchmarkId::new("single_ips", size), &ips, |b, ips| {
            b.iter(|| black_box(NetworkSet::from_blocks(ips.iter().copied()).unwrap()));
        });

        let cidrs = generate_cidrs(size);
        group.bench_with_input(BenchmarkId::new("mixed_cidrs", size), &cidrs, |b, cidrs| {
            b.iter(|| black_box(NetworkSet::from_blocks(cidrs.iter().copied()).unwrap()));
        });

        let mut dual = generate_cidrs(size / 2);
        dual.extend(generate_v6(size / 2));
        group.bench_with_input(BenchmarkId::new("dual_stack", size), &dual, |b, dual| {
            b.iter(|| black_box(DualStackSet::from_blocks(dual.iter().copied()).unwrap()));
        });
    }

    group.finish();
}

fn bench_subtract(c: &mut Criterion) {
    let mut group = c.benchmark_group("subtract");

    for size in [100, 1000, 10000] {
        let base = NetworkSet::from_blocks(generate_cidrs(size)).unwrap();
        // Holes punched into roughly every other block
        let holes = NetworkSet::from_blocks(generate_ips(size * 2)).unwrap();

        group.bench_with_input(
            BenchmarkId::new("host_holes", size),
            &(base, holes),
            |b, (base, holes)| {
                b.iter(|| black_box(base.subtract(holes).unwrap()));
            },
        );
    }

    group.finish();
}

fn bench_parse_blocklist(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_blocklist");

    let small_content = (0..100)
        .map(|i| format!("192.168.{}.{}/24\n", i % 256, i / 256))
        .collect::<String>();

    let medium_content = (0..1000)
        .map(|i| format!("{}.{}.{}.0 ; sbl{}\n", i % 256, (i / 256) % 256, (i / 65536) % 256, i))
        .collect::<String>();

    let large_content = (0..10000)
        .map(|i| format!("{}.{}.0.0/16\n# comment {}\n", i % 256, (i / 256) % 256, i))
        .collect::<String>();

    for (name, content) in [
        ("small_100", small_content),
        ("medium_1000", medium_content),
        ("large_10000", large_content),
    ] {
        let sources = vec![SourceBlob::new(name, content)];
        group.bench_with_input(BenchmarkId::from_parameter(name), &sources, |b, sources| {
            b.iter(|| black_box(aggregate(sources, &[]).unwrap()));
        });
    }

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render");
    let template = RenderConfig::default();

    for size in [1000, 10000, 50000] {
        let mut blocks = generate_ips(size);
        blocks.extend(generate_v6(size / 10));
        let set = DualStackSet::from_blocks(blocks).unwrap();

        group.bench_with_input(BenchmarkId::new("artifact", size), &set, |b, set| {
            b.iter(|| black_box(Artifact::from_commands(&render(set, &template))));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_union,
    bench_subtract,
    bench_parse_blocklist,
    bench_render
);
criterion_main!(benches);
