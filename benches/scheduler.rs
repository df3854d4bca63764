//! Benchmarks for graph scheduling
//!
//! Run with: cargo bench

use calcgraph::{CalculatorGraph, GraphConfig, NodeConfig, Packet, Timestamp};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::HashMap;

/// `depth` pass-through nodes in a row, fed from a graph input
fn chain_config(depth: usize, num_threads: usize) -> GraphConfig {
    let mut config = GraphConfig::default()
        .with_input_stream("s0")
        .with_num_threads(num_threads);
    for i in 0..depth {
        config = config.with_node(
            NodeConfig::new("PassThroughCalculator")
                .input(format!("s{}", i))
                .output(format!("s{}", i + 1)),
        );
    }
    config
}

fn bench_chain_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_throughput");
    let packets = 1_000i64;
    group.throughput(Throughput::Elements(packets as u64));

    for depth in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let mut graph = CalculatorGraph::new();
            graph
                .initialize(chain_config(depth, 2), HashMap::new())
                .unwrap();
            b.iter(|| {
                graph.start_run(HashMap::new()).unwrap();
                for i in 0..packets {
                    let packet = Packet::new(black_box(i)).at(Timestamp::new(i).unwrap());
                    graph.add_packet_to_input_stream("s0", packet).unwrap();
                }
                graph.close_all_input_streams().unwrap();
                graph.wait_until_done().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_counting_source(c: &mut Criterion) {
    let mut group = c.benchmark_group("counting_source");
    for batch_size in [1i64, 16, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let config = GraphConfig::default()
                    .with_num_threads(1)
                    .with_node(
                        NodeConfig::new("CountingSourceCalculator")
                            .output("count")
                            .options(serde_json::json!({
                                "max_count": 4096,
                                "batch_size": batch_size,
                            })),
                    )
                    .with_node(
                        NodeConfig::new("PassThroughCalculator")
                            .input("count")
                            .output("out"),
                    );
                let mut graph = CalculatorGraph::new();
                graph.initialize(config, HashMap::new()).unwrap();
                b.iter(|| graph.run(HashMap::new()).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_packet_clone(c: &mut Criterion) {
    let payload = Packet::new(vec![0u8; 1 << 20]);
    c.bench_function("packet_restamp", |b| {
        let mut t = 0i64;
        b.iter(|| {
            t += 1;
            black_box(payload.at(Timestamp::new(t).unwrap()))
        })
    });
}

criterion_group!(
    benches,
    bench_chain_throughput,
    bench_counting_source,
    bench_packet_clone
);
criterion_main!(benches);
