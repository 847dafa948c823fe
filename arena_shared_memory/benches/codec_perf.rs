//! Codec and share/fetch performance benchmarks

use arena_shared_memory::codec;
use arena_shared_memory::{Arena, ArenaOptions, ShareMode, ShareOptions, Value};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn matrix(n: usize) -> Value {
    let data: Vec<f64> = (0..n * n).map(|i| i as f64).collect();
    Value::numeric(&[n as u64, n as u64], &data).unwrap()
}

fn nested(width: usize) -> Value {
    let children = (0..width)
        .map(|i| {
            Value::structure(
                &[1, 1],
                &["id", "label"],
                vec![Value::scalar(i as f64), Value::text("element")],
            )
            .unwrap()
        })
        .collect();
    Value::cell(&[1, width as u64], children).unwrap()
}

/// Serialization cost grows with data size
fn bench_copy_into(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_into");
    for n in [4usize, 64, 512] {
        let value = matrix(n);
        let mut buf = vec![0u8; codec::compute_size(&value).unwrap()];
        group.bench_with_input(BenchmarkId::from_parameter(n), &value, |b, value| {
            b.iter(|| black_box(codec::copy_into(&mut buf, value).unwrap()));
        });
    }
    group.finish();
}

/// Materializing only walks the tree shape: flat for a matrix of any size
fn bench_materialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("materialize");
    for n in [4usize, 64, 512] {
        let value = matrix(n);
        let mut buf = vec![0u8; codec::compute_size(&value).unwrap()];
        codec::copy_into(&mut buf, &value).unwrap();
        group.bench_with_input(BenchmarkId::new("matrix", n), &buf, |b, buf| {
            b.iter(|| {
                let v: Value = unsafe { codec::materialize(buf) }.unwrap();
                black_box(v)
            });
        });
    }
    for width in [4usize, 64, 512] {
        let value = nested(width);
        let mut buf = vec![0u8; codec::compute_size(&value).unwrap()];
        codec::copy_into(&mut buf, &value).unwrap();
        group.bench_with_input(BenchmarkId::new("nested", width), &buf, |b, buf| {
            b.iter(|| {
                let v: Value = unsafe { codec::materialize(buf) }.unwrap();
                black_box(v)
            });
        });
    }
    group.finish();
}

/// In-place overwrite through the arena, the cheapest share path
fn bench_share_overwrite(c: &mut Criterion) {
    let mut arena: Arena = Arena::attach(ArenaOptions {
        name_prefix: format!("arena_bench_{}_", std::process::id()),
        config_path: None,
    })
    .unwrap();
    let value = matrix(64);
    let options = ShareOptions {
        mode: Some(ShareMode::Overwrite),
        ..ShareOptions::default()
    };
    let _held = arena.share(&value, options).unwrap();

    c.bench_function("share_overwrite_64x64", |b| {
        b.iter(|| black_box(arena.share(&value, options).unwrap()));
    });
    c.bench_function("fetch_latest", |b| {
        b.iter(|| black_box(arena.fetch_latest().unwrap()));
    });
}

criterion_group!(
    benches,
    bench_copy_into,
    bench_materialize,
    bench_share_overwrite
);
criterion_main!(benches);
