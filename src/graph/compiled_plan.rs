use crate::config::{ExecutorConfig, InputStreamHandlerConfig};
use crate::error::Result;
use crate::framework::calculator::{CalculatorEntry, GeneratorEntry};
use crate::framework::id::{CollectionItemId, NodeId, StreamId};
use crate::framework::packet::Packet;
use crate::framework::port::ResolvedType;
use crate::framework::tag_map::TagMap;
use crate::framework::timestamp::TimestampDiff;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Validated, immutable description of a graph. Shared by every run.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub nodes: Vec<NodeSpec>,
    pub streams: Vec<StreamSpec>,
    pub stream_by_name: HashMap<String, StreamId>,

    /// Graph input streams in declaration order
    pub graph_inputs: Vec<StreamId>,

    /// Graph output streams in declaration order
    pub graph_outputs: Vec<StreamId>,

    pub generators: Vec<GeneratorSpec>,
    pub side_packets: HashMap<String, SidePacketSpec>,

    /// Nodes in topological order, back-edges excluded
    pub topo_order: Vec<NodeId>,

    /// Distinct source layers, ascending
    pub source_layers: Vec<i32>,

    pub executors: Vec<ExecutorConfig>,
    pub num_threads: Option<usize>,

    pub stats: PlanStats,
}

/// Statistics about the compiled plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub total_nodes: usize,

    /// Nodes without input streams
    pub source_nodes: usize,

    /// Nodes without output streams
    pub sink_nodes: usize,

    pub streams: usize,
    pub back_edges: usize,
    pub packet_generators: usize,

    /// Compilation time in microseconds
    pub compile_time_us: u64,
}

/// One node after its contract ran.
#[derive(Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub name: Arc<str>,
    pub calculator: String,
    pub entry: CalculatorEntry,
    pub options: serde_json::Value,

    pub inputs: Arc<TagMap>,
    pub input_types: Vec<ResolvedType>,
    pub input_streams: Vec<StreamId>,
    pub back_edges: Vec<bool>,

    pub outputs: Arc<TagMap>,
    pub output_types: Vec<ResolvedType>,
    pub output_streams: Vec<StreamId>,

    pub input_side_packets: Arc<TagMap>,
    pub input_side_packet_types: Vec<ResolvedType>,
    pub output_side_packets: Arc<TagMap>,
    pub output_side_packet_types: Vec<ResolvedType>,

    pub handler: InputStreamHandlerConfig,
    pub process_timestamp_bounds: bool,
    pub timestamp_offset: Option<TimestampDiff>,
    pub max_in_flight: usize,
    pub source_layer: i32,
    pub executor: Option<String>,

    /// Position in topological order; later nodes run first
    pub priority: usize,
}

impl NodeSpec {
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Whether every input side packet of the node is named in `available`.
    pub fn side_packets_ready(&self, available: impl Fn(&str) -> bool) -> bool {
        self.input_side_packets.names().all(available)
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("calculator", &self.calculator)
            .field("inputs", &self.input_streams)
            .field("outputs", &self.output_streams)
            .field("handler", &self.handler.name())
            .field("max_in_flight", &self.max_in_flight)
            .field("source_layer", &self.source_layer)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Where a stream's packets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProducer {
    GraphInput,
    Node { node: NodeId, output: CollectionItemId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConsumer {
    pub node: NodeId,
    pub input: CollectionItemId,
    pub back_edge: bool,
}

#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub id: StreamId,
    pub name: String,
    pub producer: StreamProducer,
    pub packet_type: ResolvedType,
    pub consumers: Vec<StreamConsumer>,
}

/// Who sets a side packet during the graph's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidePacketProducer {
    /// Supplied by the caller
    External,
    Generator(usize),
    Node(NodeId),
}

/// A named side packet and everything wired to it.
#[derive(Debug, Clone)]
pub struct SidePacketSpec {
    pub name: String,
    pub producer: SidePacketProducer,

    /// Declared types of every consuming port, with a label for errors
    pub consumer_types: Vec<(String, ResolvedType)>,

    /// Nodes that need the packet before they open
    pub consumer_nodes: Vec<NodeId>,
}

impl SidePacketSpec {
    /// Check a packet against every consumer's declared type.
    pub fn validate(&self, packet: &Packet) -> Result<()> {
        for (port, ty) in &self.consumer_types {
            ty.validate(packet)
                .map_err(|e| e.with_context(format!("side packet '{}' for {}", self.name, port)))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorSpec {
    pub name: String,
    pub inputs: Arc<TagMap>,
    pub input_types: Vec<ResolvedType>,
    pub outputs: Arc<TagMap>,
    pub output_types: Vec<ResolvedType>,
    pub options: serde_json::Value,
    pub entry: GeneratorEntry,
}

impl CompiledPlan {
    pub fn node(&self, id: NodeId) -> &NodeSpec {
        &self.nodes[id.index()]
    }

    pub fn stream(&self, id: StreamId) -> &StreamSpec {
        &self.streams[id.index()]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| &*n.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Source nodes of `layer`.
    pub fn sources_in_layer(&self, layer: i32) -> impl Iterator<Item = &NodeSpec> + '_ {
        self.nodes
            .iter()
            .filter(move |n| n.is_source() && n.source_layer == layer)
    }
}
