//! Integration tests for graph files
//!
//! Graphs are loaded from TOML and JSON files on disk, saved back, and run.

mod common;

use calcgraph::{CalculatorGraph, GraphConfig, GraphError, InputStreamHandlerConfig};
use common::builders::test_registry;
use common::{collect, int_values};
use std::collections::HashMap;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

const DOUBLE_COUNT_TOML: &str = r#"
output_stream = ["joined"]
num_threads = 2

[[node]]
name = "counter"
calculator = "CountingSourceCalculator"
output_stream = ["count"]
options = { max_count = 3, initial_value = 1 }

[[node]]
calculator = "PassThroughCalculator"
input_stream = ["count"]
output_stream = ["copy"]

[[node]]
calculator = "ConcatenateI64VectorCalculator"
input_stream = ["count", "copy"]
output_stream = ["joined"]
input_stream_handler = { type = "Default", batch_size = 2 }
"#;

fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_and_run_toml_graph() {
    let file = write_temp(".toml", DOUBLE_COUNT_TOML);
    let config = GraphConfig::load(file.path()).unwrap();
    assert_eq!(config.node.len(), 3);
    assert_eq!(
        config.node[2].input_stream_handler,
        Some(InputStreamHandlerConfig::Default { batch_size: 2 })
    );

    let mut graph = CalculatorGraph::new();
    graph.initialize(config, HashMap::new()).unwrap();
    let seen = collect(&mut graph, "joined");
    graph.run(HashMap::new()).unwrap();

    let seen = seen.lock();
    let joined: Vec<(i64, Vec<i64>)> = seen
        .iter()
        .map(|p| (p.timestamp().value(), p.get::<Vec<i64>>().unwrap().clone()))
        .collect();
    assert_eq!(joined, vec![(0, vec![1, 1]), (1, vec![2, 2]), (2, vec![3, 3])]);
}

#[test]
fn test_json_graph_matches_toml_graph() {
    let toml_config = GraphConfig::from_toml_str(DOUBLE_COUNT_TOML).unwrap();
    let file = write_temp(".json", &toml_config.to_json_string().unwrap());
    let json_config = GraphConfig::load(file.path()).unwrap();
    assert_eq!(json_config, toml_config);
}

#[test]
fn test_save_round_trip_through_directory() {
    let dir = TempDir::new().unwrap();
    let config = GraphConfig::from_toml_str(DOUBLE_COUNT_TOML).unwrap();
    for name in ["graph.toml", "graph.json"] {
        let path = dir.path().join(name);
        config.save(&path).unwrap();
        assert_eq!(GraphConfig::load(&path).unwrap(), config);
    }
}

#[test]
fn test_load_rejects_bad_files() {
    let unknown = write_temp(".yaml", "node: []");
    assert!(matches!(
        GraphConfig::load(unknown.path()),
        Err(GraphError::InvalidConfig(_))
    ));

    let broken = write_temp(".toml", "[[node]\ncalculator = ");
    assert!(matches!(GraphConfig::load(broken.path()), Err(GraphError::Parse(_))));

    assert!(GraphConfig::load("/nonexistent/graph.toml").is_err());
}

#[test]
fn test_invalid_graphs_fail_initialize() {
    let cases = [
        // unknown calculator
        r#"
[[node]]
calculator = "NoSuchCalculator"
output_stream = ["x"]
"#,
        // stream without a producer
        r#"
[[node]]
calculator = "PassThroughCalculator"
input_stream = ["nowhere"]
output_stream = ["x"]
"#,
        // two producers for one stream
        r#"
[[node]]
calculator = "CountingSourceCalculator"
output_stream = ["x"]

[[node]]
calculator = "CountingSourceCalculator"
output_stream = ["x"]
"#,
        // exclusive calculator with several tasks in flight
        r#"
[[node]]
calculator = "CountingSourceCalculator"
output_stream = ["x"]
max_in_flight = 2
"#,
    ];
    for case in cases {
        let config = GraphConfig::from_toml_str(case).unwrap();
        let mut graph = CalculatorGraph::new();
        assert!(graph.initialize(config, HashMap::new()).is_err(), "{}", case);
    }
}

const FORWARDED_TYPES_TOML: &str = r#"
input_stream = ["words"]

[[node]]
calculator = "ConcatenateStringVectorCalculator"
input_stream = ["words"]
output_stream = ["sentence"]

[[node]]
calculator = "PassThroughCalculator"
input_stream = ["sentence"]
output_stream = ["copy"]

[[node]]
calculator = "AdderCalculator"
input_stream = ["copy"]
output_stream = ["sum"]
"#;

#[test]
fn test_forwarded_stream_types_are_checked_at_initialize() {
    let config = GraphConfig::from_toml_str(FORWARDED_TYPES_TOML).unwrap();
    let mut graph = CalculatorGraph::with_registry(test_registry());
    let err = graph.initialize(config, HashMap::new()).unwrap_err();
    assert!(matches!(err, GraphError::TypeMismatch { .. }), "{}", err);
    assert!(err.to_string().contains("copy"), "{}", err);

    // Counting source, pass-through and adder all agree on i64.
    let typed = GraphConfig::from_toml_str(
        r#"
[[node]]
calculator = "CountingSourceCalculator"
output_stream = ["count"]

[[node]]
calculator = "PassThroughCalculator"
input_stream = ["count"]
output_stream = ["copy"]

[[node]]
calculator = "AdderCalculator"
input_stream = ["copy"]
output_stream = ["sum"]
"#,
    )
    .unwrap();
    let mut graph = CalculatorGraph::with_registry(test_registry());
    graph.initialize(typed, HashMap::new()).unwrap();
}

#[test]
fn test_plan_statistics() {
    let config = GraphConfig::from_toml_str(DOUBLE_COUNT_TOML).unwrap();
    let mut graph = CalculatorGraph::new();
    graph.initialize(config, HashMap::new()).unwrap();
    let stats = &graph.plan().unwrap().stats;
    assert_eq!(stats.total_nodes, 3);
    assert_eq!(stats.source_nodes, 1);
    assert_eq!(stats.sink_nodes, 0);
    assert_eq!(stats.streams, 3);
    assert_eq!(stats.back_edges, 0);
}

#[test]
fn test_graph_input_counting_example() {
    let config = GraphConfig::from_toml_str(
        r#"
input_stream = ["in"]

[[node]]
calculator = "PassThroughCalculator"
input_stream = ["in"]
output_stream = ["out"]
"#,
    )
    .unwrap();
    let mut graph = CalculatorGraph::new();
    graph.initialize(config, HashMap::new()).unwrap();
    let seen = collect(&mut graph, "out");

    graph.start_run(HashMap::new()).unwrap();
    graph
        .add_packet_to_input_stream("in", common::int_at(5, 1))
        .unwrap();
    graph.close_all_input_streams().unwrap();
    graph.wait_until_done().unwrap();
    assert_eq!(int_values(&seen.lock()), vec![(1, 5)]);
}
