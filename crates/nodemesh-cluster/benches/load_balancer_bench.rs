// Criterion benchmarks for nodemesh-cluster
//
// Run benchmarks with:
//   cargo bench -p nodemesh-cluster
//
// For detailed output with plots:
//   cargo bench -p nodemesh-cluster -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nodemesh_cluster::{ClusterManager, LoadBalancerRegistry, NodeEntry, NodeStatus};
use nodemesh_common::config::ClusterConfig;

fn candidates(count: usize) -> Vec<NodeEntry> {
    (0..count)
        .map(|i| {
            let mut node = NodeEntry::online(format!("node{}", i), "localhost", 9000);
            node.current_connections = ((i * 7) % 13) as u32;
            // Every fourth node is down
            if i % 4 == 3 {
                node.status = NodeStatus::Offline;
            }
            node
        })
        .collect()
}

fn bench_select_node(c: &mut Criterion) {
    let registry = LoadBalancerRegistry::new();
    let mut group = c.benchmark_group("select_node");

    for strategy in registry.available_strategies() {
        for node_count in [2, 10, 50].iter() {
            let nodes = candidates(*node_count);
            let lb = registry.create(&strategy);
            group.bench_with_input(
                BenchmarkId::new(strategy.clone(), node_count),
                &nodes,
                |b, nodes| {
                    b.iter(|| lb.select_node(black_box(nodes)));
                },
            );
        }
    }

    group.finish();
}

fn bench_manager(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_manager");

    let manager = ClusterManager::new(ClusterConfig::default());
    for node in candidates(100) {
        manager.register_node(node);
    }

    group.bench_function("select_node_100", |b| {
        b.iter(|| black_box(&manager).select_node());
    });

    group.bench_function("update_heartbeat", |b| {
        b.iter(|| manager.update_heartbeat(black_box("node42")));
    });

    group.bench_function("cluster_status_100", |b| {
        b.iter(|| black_box(&manager).cluster_status());
    });

    group.finish();
}

criterion_group!(benches, bench_select_node, bench_manager);
criterion_main!(benches);
