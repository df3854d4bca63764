//! Integration tests for whole graph runs
//!
//! These tests validate:
//! - Packet delivery and closure propagation through node chains
//! - Source nodes and source layers
//! - Observers and pollers across runs
//! - Error and graceful-stop handling
//! - Ordered output with several tasks of a node in flight

mod common;

use calcgraph::{GraphConfig, GraphError, NodeConfig, NodeState, Packet};
use common::builders::{counting_config, graph_for, pass_through_config};
use common::{collect, int_at, int_values, timestamps, ts};
use parking_lot::Mutex;
use serial_test::serial;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_pass_through_delivers_in_order() {
    let mut graph = graph_for(pass_through_config());
    let seen = collect(&mut graph, "out");

    graph.start_run(HashMap::new()).unwrap();
    for i in [1, 4, 9] {
        graph.add_packet_to_input_stream("in", int_at(i * 10, i)).unwrap();
    }
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    assert_eq!(int_values(&seen.lock()), vec![(1, 10), (4, 40), (9, 90)]);
    assert!(!graph.is_running());
    assert!(!graph.has_error());
}

#[test]
fn test_closing_inputs_cascades_through_chain() {
    let config = GraphConfig::default()
        .with_input_stream("in")
        .with_node(NodeConfig::new("PassThroughCalculator").named("a").input("in").output("x"))
        .with_node(NodeConfig::new("PassThroughCalculator").named("b").input("x").output("y"))
        .with_node(NodeConfig::new("PassThroughCalculator").named("c").input("y").output("z"));
    let mut graph = graph_for(config);
    let seen = collect(&mut graph, "z");

    graph.start_run(HashMap::new()).unwrap();
    graph.add_packet_to_input_stream("in", int_at(1, 0)).unwrap();
    graph.wait_until_idle().unwrap();
    assert_eq!(graph.node_state("c"), Some(NodeState::Open));
    assert_eq!(seen.lock().len(), 1);

    graph.close_input_stream("in").unwrap();
    graph.wait_until_done().unwrap();
    for node in ["a", "b", "c"] {
        assert_eq!(graph.node_state(node), Some(NodeState::Closed));
    }
}

#[test]
fn test_bound_only_updates_reach_bound_observers() {
    let mut graph = graph_for(pass_through_config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    graph
        .observe_output_stream(
            "out",
            move |packet: &Packet| {
                sink.lock().push((packet.timestamp().value(), packet.is_empty()));
                Ok(())
            },
            true,
        )
        .unwrap();

    graph.start_run(HashMap::new()).unwrap();
    graph.add_packet_to_input_stream("in", int_at(1, 3)).unwrap();
    graph.wait_until_idle().unwrap();
    graph.set_input_stream_timestamp_bound("in", ts(10)).unwrap();
    graph.wait_until_idle().unwrap();
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    let seen = seen.lock();
    assert_eq!(seen[0], (3, false));
    assert!(seen.contains(&(9, true)), "bound 10 settles timestamp 9: {:?}", *seen);
}

#[test]
fn test_counting_source_runs_to_completion() {
    let mut graph = graph_for(counting_config(5));
    let seen = collect(&mut graph, "out");

    graph.run(HashMap::new()).unwrap();
    assert_eq!(
        int_values(&seen.lock()),
        vec![(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)]
    );
    assert_eq!(graph.node_state("source"), Some(NodeState::Closed));
}

#[test]
fn test_counting_source_batches_and_options() {
    let config = GraphConfig::default().with_node(
        NodeConfig::new("CountingSourceCalculator")
            .output("out")
            .options(serde_json::json!({
                "max_count": 4,
                "batch_size": 3,
                "initial_value": 100,
                "increment": -10,
            })),
    );
    let mut graph = graph_for(config);
    let seen = collect(&mut graph, "out");

    graph.run(HashMap::new()).unwrap();
    assert_eq!(
        int_values(&seen.lock()),
        vec![(0, 100), (1, 90), (2, 80), (3, 70)]
    );
}

#[test]
fn test_source_layers_run_one_after_another() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let config = GraphConfig::default()
        .with_num_threads(4)
        .with_node(
            NodeConfig::new("CountingSourceCalculator")
                .named("late")
                .output("late_out")
                .source_layer(1)
                .options(serde_json::json!({ "max_count": 3 })),
        )
        .with_node(
            NodeConfig::new("CountingSourceCalculator")
                .named("early")
                .output("early_out")
                .options(serde_json::json!({ "max_count": 3 })),
        );
    let mut graph = graph_for(config);
    for stream in ["early_out", "late_out"] {
        let order = Arc::clone(&order);
        graph
            .observe_output_stream(
                stream,
                move |_| {
                    order.lock().push(stream);
                    Ok(())
                },
                false,
            )
            .unwrap();
    }

    graph.run(HashMap::new()).unwrap();
    assert_eq!(
        *order.lock(),
        vec!["early_out", "early_out", "early_out", "late_out", "late_out", "late_out"]
    );
}

#[test]
fn test_pollers_and_observers_survive_runs() {
    let mut graph = graph_for(pass_through_config());
    let poller = graph.add_output_stream_poller("out").unwrap();
    let observed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&observed);
    graph
        .observe_output_stream(
            "out",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            false,
        )
        .unwrap();

    for run in 0..2 {
        graph.start_run(HashMap::new()).unwrap();
        graph.add_packet_to_input_stream("in", int_at(run, 0)).unwrap();
        graph.add_packet_to_input_stream("in", int_at(run, 1)).unwrap();
        graph.close_all_input_streams().unwrap();
        graph.wait_until_done().unwrap();

        let first = poller.next().unwrap();
        let second = poller.next().unwrap();
        assert_eq!(timestamps(&[first, second]), vec![0, 1]);
        assert!(poller.next().is_none(), "end of run {}", run);
    }
    assert_eq!(observed.load(Ordering::SeqCst), 4);
}

#[test]
fn test_observers_cannot_be_added_during_a_run() {
    let mut graph = graph_for(pass_through_config());
    graph.start_run(HashMap::new()).unwrap();
    assert!(matches!(
        graph.add_output_stream_poller("out"),
        Err(GraphError::InvalidState(_))
    ));
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();
    assert!(graph.add_output_stream_poller("missing").is_err());
}

#[test]
fn test_calculator_error_fails_run_and_names_node() {
    let config = GraphConfig::default()
        .with_input_stream("in")
        .with_node(
            NodeConfig::new("FailingCalculator")
                .named("fragile")
                .input("in")
                .output("out")
                .options(serde_json::json!({ "at": 2 })),
        );
    let mut graph = graph_for(config);
    let seen = collect(&mut graph, "out");

    graph.start_run(HashMap::new()).unwrap();
    graph.add_packet_to_input_stream("in", int_at(1, 1)).unwrap();
    graph.add_packet_to_input_stream("in", int_at(2, 2)).unwrap();
    let err = graph.wait_until_done().unwrap_err();

    assert!(err.to_string().contains("fragile"), "{}", err);
    assert!(matches!(err.root(), GraphError::Failed(_)));
    assert!(graph.has_error());
    assert_eq!(int_values(&seen.lock()), vec![(1, 1)]);
    assert_eq!(graph.node_state("fragile"), Some(NodeState::Closed));
    assert!(graph.add_packet_to_input_stream("in", int_at(3, 3)).is_err());
}

#[test]
fn test_observer_error_fails_run() {
    let mut graph = graph_for(counting_config(3));
    graph
        .observe_output_stream(
            "out",
            |packet| {
                if packet.timestamp().value() == 1 {
                    return Err(GraphError::failed("observer rejected packet"));
                }
                Ok(())
            },
            false,
        )
        .unwrap();

    let err = graph.run(HashMap::new()).unwrap_err();
    assert!(err.to_string().contains("observer"), "{}", err);
}

#[test]
fn test_source_error_after_configured_calls() {
    let config = GraphConfig::default().with_node(
        NodeConfig::new("CountingSourceCalculator")
            .output("out")
            .options(serde_json::json!({ "max_count": 100, "error_count": 2 })),
    );
    let mut graph = graph_for(config);
    let seen = collect(&mut graph, "out");

    assert!(graph.run(HashMap::new()).is_err());
    assert_eq!(timestamps(&seen.lock()), vec![0, 1]);
}

#[test]
fn test_graceful_stop_from_downstream_node() {
    let config = GraphConfig::default()
        .with_node(
            NodeConfig::new("CountingSourceCalculator")
                .output("count")
                .options(serde_json::json!({ "max_count": 1_000_000 })),
        )
        .with_node(
            NodeConfig::new("StoppingCalculator")
                .input("count")
                .output("out")
                .options(serde_json::json!({ "at": 5 })),
        );
    let mut graph = graph_for(config);
    let seen = collect(&mut graph, "out");

    graph.run(HashMap::new()).unwrap();
    let seen = seen.lock();
    assert!(seen.len() >= 6);
    assert!(seen.len() < 1_000_000);
    assert!(timestamps(&seen).windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_close_all_packet_sources_ends_run() {
    let config = GraphConfig::default()
        .with_input_stream("in")
        .with_node(NodeConfig::new("PassThroughCalculator").input("in").output("a"))
        .with_node(
            NodeConfig::new("CountingSourceCalculator")
                .output("b")
                .options(serde_json::json!({ "max_count": i64::MAX })),
        );
    let mut graph = graph_for(config);

    graph.start_run(HashMap::new()).unwrap();
    graph.add_packet_to_input_stream("in", int_at(1, 1)).unwrap();
    graph.close_all_packet_sources().unwrap();
    graph.wait_until_done().unwrap();
    assert!(matches!(
        graph.add_packet_to_input_stream("in", int_at(2, 2)),
        Err(GraphError::InvalidState(_))
    ));
}

#[test]
fn test_run_can_be_repeated() {
    let mut graph = graph_for(counting_config(2));
    let seen = collect(&mut graph, "out");
    graph.run(HashMap::new()).unwrap();
    graph.run(HashMap::new()).unwrap();
    assert_eq!(timestamps(&seen.lock()), vec![0, 1, 0, 1]);
}

#[test]
#[serial]
fn test_parallel_tasks_keep_output_order() {
    let config = GraphConfig::default()
        .with_input_stream("in")
        .with_num_threads(4)
        .with_node(
            NodeConfig::new("SlowPassThroughCalculator")
                .named("slow")
                .input("in")
                .output("mid")
                .max_in_flight(4),
        )
        .with_node(NodeConfig::new("PassThroughCalculator").input("mid").output("out"));
    let mut graph = graph_for(config);
    let seen = collect(&mut graph, "out");

    graph.start_run(HashMap::new()).unwrap();
    for i in 0..24 {
        graph.add_packet_to_input_stream("in", int_at(i, i)).unwrap();
    }
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    let expected: Vec<(i64, i64)> = (0..24).map(|i| (i, i)).collect();
    assert_eq!(int_values(&seen.lock()), expected);
}

#[test]
#[serial]
fn test_named_executor_runs_nodes() {
    let config = GraphConfig::default()
        .with_input_stream("in")
        .with_executor("side", 2)
        .with_node(
            NodeConfig::new("PassThroughCalculator")
                .input("in")
                .output("out")
                .executor("side"),
        );
    let mut graph = graph_for(config);
    let threads = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&threads);
    graph
        .observe_output_stream(
            "out",
            move |_| {
                let name = std::thread::current().name().unwrap_or("").to_string();
                sink.lock().push(name);
                Ok(())
            },
            false,
        )
        .unwrap();

    graph.start_run(HashMap::new()).unwrap();
    graph.add_packet_to_input_stream("in", int_at(1, 1)).unwrap();
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();

    let threads = threads.lock();
    assert_eq!(threads.len(), 1);
    assert!(threads[0].contains("side"), "ran on {:?}", threads[0]);
}

#[test]
fn test_dropping_graph_mid_run_stops_it() {
    let mut graph = graph_for(counting_config(i64::MAX));
    graph.start_run(HashMap::new()).unwrap();
    drop(graph);
}
