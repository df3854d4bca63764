//! # calcgraph: timestamp-ordered calculator graphs
//!
//! A graph is a set of calculator nodes connected by packet streams. Packets
//! carry a [`Timestamp`]; every stream delivers them in strictly increasing
//! timestamp order, and nodes are scheduled as soon as their inputs are
//! settled up to some timestamp.
//!
//! ## Architecture
//!
//! - **Config**: declarative [`GraphConfig`] loaded from TOML or JSON
//! - **Framework**: timestamps, packets, calculator traits, input stream handlers
//! - **Graph**: compilation to a [`CompiledPlan`] and multithreaded execution
//! - **Calculators**: built-ins such as pass-through, loopback and flow limiting
//!
//! ## Example
//!
//! ```no_run
//! use calcgraph::{CalculatorGraph, GraphConfig, NodeConfig, Packet, Timestamp};
//! use std::collections::HashMap;
//!
//! fn main() -> calcgraph::Result<()> {
//!     let config = GraphConfig::default()
//!         .with_input_stream("in")
//!         .with_node(NodeConfig::new("PassThroughCalculator").input("in").output("out"));
//!
//!     let mut graph = CalculatorGraph::new();
//!     graph.initialize(config, HashMap::new())?;
//!     let poller = graph.add_output_stream_poller("out")?;
//!
//!     graph.start_run(HashMap::new())?;
//!     graph.add_packet_to_input_stream("in", Packet::new(7i64).at(Timestamp::new(0)?))?;
//!     graph.close_all_input_streams()?;
//!     graph.wait_until_done()?;
//!
//!     while let Some(packet) = poller.next() {
//!         println!("{} {:?}", packet.timestamp(), packet);
//!     }
//!     Ok(())
//! }
//! ```

pub mod calculators;
pub mod config;
pub mod error;
pub mod framework;
pub mod graph;

// Re-export commonly used types
pub use config::{GraphConfig, InputStreamHandlerConfig, NodeConfig, PacketGeneratorConfig};
pub use error::{GraphError, Result};
pub use framework::{
    Calculator, CalculatorContext, CalculatorContract, CalculatorRegistry, Packet, PacketGenerator,
    PacketType, SharedCalculator, Timestamp, TimestampDiff,
};
pub use graph::{CalculatorGraph, CompiledPlan, NodeState, OutputStreamPoller};
