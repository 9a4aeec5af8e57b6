//! Benchmarks for template compilation and evaluation.

use std::io;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kiln_core::{IoWriter, Props, TemplateContext};
use tokio::runtime::Runtime;

const SAMPLES: [&str; 3] = [
    "<?/*1*/?>`world`\n <?-/*B*/?><?=2?>day",
    "<?/*1*/?>`world`\n <?-/*B*/?><?=2?>day<?/*C*/?>  ",
    "hello<?/*1*/?>`world`\n <?-/*B*/?><?=2?>day",
];

const SIZES: [(&str, usize); 3] = [
    ("10kB", 10 * 1024),
    ("100kB", 100 * 1024),
    ("1MB", 1000 * 1024),
];

/// Repeat a sample line until the source is at least `size` bytes.
fn generate(size: usize) -> String {
    let line = format!("{}\n", SAMPLES[1]);
    line.repeat(size.div_ceil(line.len()))
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

fn props() -> Props {
    Props {
        filename: Some("test.html".to_string()),
        ..Props::default()
    }
}

fn bench_parse(c: &mut Criterion) {
    let ctx = TemplateContext::default();
    let mut group = c.benchmark_group("parse");

    group.bench_function("samples", |b| {
        b.iter(|| {
            for source in SAMPLES {
                ctx.compile(source, "test.html").unwrap();
            }
        });
    });

    for (name, size) in SIZES {
        let source = generate(size);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &source, |b, source| {
            b.iter(|| ctx.compile(source, "test.html").unwrap());
        });
    }

    group.finish();
}

fn bench_eval(c: &mut Criterion) {
    let rt = runtime();
    let ctx = TemplateContext::default();
    let props = props();
    let mut group = c.benchmark_group("eval");

    let templates: Vec<_> = SAMPLES
        .iter()
        .map(|source| ctx.compile(source, "test.html").unwrap())
        .collect();
    group.bench_function("samples", |b| {
        b.iter(|| {
            rt.block_on(async {
                for template in &templates {
                    template.eval(&props).await.unwrap();
                }
            })
        });
    });

    for (name, size) in SIZES {
        let source = generate(size);
        let template = ctx.compile(&source, "test.html").unwrap();
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| rt.block_on(template.eval(&props)).unwrap());
        });
        group.bench_function(BenchmarkId::new("null-writer", name), |b| {
            b.iter(|| {
                let mut sink = IoWriter(io::sink());
                rt.block_on(template.eval_into(&props, &mut sink)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_compile_eval(c: &mut Criterion) {
    let rt = runtime();
    let ctx = TemplateContext::default();
    let props = props();
    let mut group = c.benchmark_group("compile+eval");

    group.bench_function("samples", |b| {
        b.iter(|| {
            rt.block_on(async {
                for source in SAMPLES {
                    ctx.eval(source, &props).await.unwrap();
                }
            })
        });
    });

    for (name, size) in SIZES {
        let source = generate(size);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &source, |b, source| {
            b.iter(|| rt.block_on(ctx.eval(source, &props)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse, bench_eval, bench_compile_eval);
criterion_main!(benches);
