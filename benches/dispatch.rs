//! Benchmark for the device layer dispatcher
//!
//! Dispatches batches of resources through DRBD and storage layers.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use replistor::domain::{DeviceLayerKind, NodeName, Resource, ResourceName, StorPoolName, Volume};
use replistor::satellite::{CollectingSink, LayerExpander};
use replistor::{DeviceDispatcher, DispatchMetrics, DrbdLayer, LayerRegistry, StackExpander, StorageLayer};
use std::sync::Arc;

fn dispatcher() -> DeviceDispatcher {
    let pool = StorPoolName::new("pool1").unwrap();
    let registry = LayerRegistry::new()
        .with(Arc::new(DrbdLayer::new()))
        .with(Arc::new(StorageLayer::new([(pool, u64::MAX / 2)])));
    DeviceDispatcher::new(
        Arc::new(registry),
        Arc::new(StackExpander::new()),
        Arc::new(DispatchMetrics::new()),
    )
}

fn batch(size: usize) -> Vec<Resource> {
    let node = NodeName::new("bench-node").unwrap();
    let pool = StorPoolName::new("pool1").unwrap();
    (0..size)
        .map(|i| {
            let mut rsc = Resource::new(
                ResourceName::new(format!("rsc-{:05}", i)).unwrap(),
                node.clone(),
                vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
            );
            rsc.volumes.insert(0, Volume::new(0, pool.clone(), 1 << 20));
            rsc
        })
        .collect()
}

fn bench_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");

    for size in [1usize, 16, 256] {
        let resources = batch(size);
        let dispatcher = dispatcher();
        let dispatcher = &dispatcher;
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("apply_batch", size), &resources, |b, resources| {
            b.to_async(&runtime).iter(|| async move {
                let sink = CollectingSink::new();
                let report = dispatcher
                    .dispatch(black_box(resources), &[], &sink)
                    .await
                    .unwrap();
                black_box(report);
            });
        });
    }

    group.finish();
}

fn bench_expand(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let resources = batch(256);
    let expander = StackExpander::new();
    group.throughput(Throughput::Elements(256));

    group.bench_function("expand_256", |b| {
        b.iter(|| {
            let expansion = expander.expand(black_box(&resources), &[], true);
            black_box(expansion.arena.len());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_expand);
criterion_main!(benches);
