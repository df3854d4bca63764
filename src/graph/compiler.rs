use super::compiled_plan::{
    CompiledPlan, GeneratorSpec, NodeSpec, PlanStats, SidePacketProducer, SidePacketSpec,
    StreamConsumer, StreamProducer, StreamSpec,
};
use crate::config::{GraphConfig, InputStreamInfo, NodeConfig, PacketGeneratorConfig};
use crate::error::{GraphError, Result};
use crate::framework::calculator::CalculatorRegistry;
use crate::framework::contract::CalculatorContract;
use crate::framework::handler::InputStreamHandler;
use crate::framework::id::{CollectionItemId, NodeId, StreamId};
use crate::framework::port::{PacketType, PortRef, PortSet, PortSide, ResolvedType};
use crate::framework::tag_map::{parse_tag_index, parse_tag_index_name, TagEntry, TagMap};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Resolved port types of one contract.
struct ResolvedPorts {
    inputs: Vec<ResolvedType>,
    outputs: Vec<ResolvedType>,
    input_side_packets: Vec<ResolvedType>,
    output_side_packets: Vec<ResolvedType>,
}

/// Compiles a graph configuration into an execution plan
pub struct GraphCompiler;

impl GraphCompiler {
    /// Validate `config` against the registered calculators and build the plan.
    ///
    /// `extra_executors` names executors installed with `set_executor` on top of
    /// those declared in the configuration.
    pub fn compile(
        config: &GraphConfig,
        registry: &CalculatorRegistry,
        extra_executors: &HashSet<String>,
    ) -> Result<CompiledPlan> {
        let start_time = std::time::Instant::now();

        if config.node.is_empty() {
            return Err(GraphError::InvalidConfig("graph has no nodes".into()));
        }
        if config.num_threads == Some(0) {
            return Err(GraphError::InvalidConfig("num_threads must be at least 1".into()));
        }

        let names = Self::assign_node_names(&config.node)?;
        let (mut nodes, output_origins): (Vec<NodeSpec>, Vec<Vec<Option<CollectionItemId>>>) =
            config
                .node
                .iter()
                .zip(names)
                .enumerate()
                .map(|(i, (node_config, name))| {
                    Self::build_node(NodeId(i as u32), name, node_config, config, registry)
                })
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .unzip();

        let generators = config
            .packet_generator
            .iter()
            .map(|g| Self::build_generator(g, registry))
            .collect::<Result<Vec<_>>>()?;

        Self::check_executors(config, &nodes, extra_executors)?;

        let (mut streams, stream_by_name, graph_inputs) = Self::wire_streams(config, &mut nodes)?;
        let graph_outputs = config
            .output_stream
            .iter()
            .map(|spec| {
                let (_, _, name) = parse_tag_index_name(spec)?;
                stream_by_name.get(&name).copied().ok_or_else(|| {
                    GraphError::InvalidConfig(format!("graph output stream '{}' has no producer", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let side_packets = Self::wire_side_packets(&nodes, &generators)?;

        let adjacency = Self::build_adjacency(&nodes, &streams, &side_packets);
        let topo_order = Self::topological_sort(&nodes, &adjacency)?;
        for (priority, id) in topo_order.iter().enumerate() {
            nodes[id.index()].priority = priority;
        }
        Self::check_source_layers(&nodes, &topo_order, &adjacency)?;
        Self::propagate_stream_types(&mut nodes, &mut streams, &topo_order, &output_origins)?;

        let mut source_layers: Vec<i32> = nodes
            .iter()
            .filter(|n| n.is_source())
            .map(|n| n.source_layer)
            .collect();
        source_layers.sort_unstable();
        source_layers.dedup();

        let stats = PlanStats {
            total_nodes: nodes.len(),
            source_nodes: nodes.iter().filter(|n| n.is_source()).count(),
            sink_nodes: nodes.iter().filter(|n| n.outputs.is_empty()).count(),
            streams: streams.len(),
            back_edges: nodes
                .iter()
                .map(|n| n.back_edges.iter().filter(|b| **b).count())
                .sum(),
            packet_generators: generators.len(),
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        tracing::debug!(
            nodes = stats.total_nodes,
            streams = stats.streams,
            back_edges = stats.back_edges,
            compile_time_us = stats.compile_time_us,
            "compiled graph"
        );

        Ok(CompiledPlan {
            nodes,
            streams,
            stream_by_name,
            graph_inputs,
            graph_outputs,
            generators,
            side_packets,
            topo_order,
            source_layers,
            executors: config.executor.clone(),
            num_threads: config.num_threads,
            stats,
        })
    }

    /// Node names default to the calculator name; repeats get a numeric suffix.
    fn assign_node_names(nodes: &[NodeConfig]) -> Result<Vec<String>> {
        let mut used: HashSet<String> = HashSet::new();
        for node in nodes {
            if let Some(name) = &node.name {
                if !used.insert(name.clone()) {
                    return Err(GraphError::InvalidConfig(format!(
                        "node name '{}' is used more than once",
                        name
                    )));
                }
            }
        }

        let mut names = Vec::with_capacity(nodes.len());
        for node in nodes {
            let name = match &node.name {
                Some(name) => name.clone(),
                None => {
                    let base = node.calculator.clone();
                    let mut candidate = base.clone();
                    let mut suffix = 1;
                    while used.contains(&candidate) {
                        candidate = format!("{}_{}", base, suffix);
                        suffix += 1;
                    }
                    used.insert(candidate.clone());
                    candidate
                }
            };
            names.push(name);
        }
        Ok(names)
    }

    fn build_node(
        id: NodeId,
        name: String,
        node: &NodeConfig,
        graph: &GraphConfig,
        registry: &CalculatorRegistry,
    ) -> Result<(NodeSpec, Vec<Option<CollectionItemId>>)> {
        let in_node = |e: GraphError| e.with_context(format!("node '{}'", name));

        let inputs = Arc::new(TagMap::new(&node.input_stream).map_err(in_node)?);
        let outputs = Arc::new(TagMap::new(&node.output_stream).map_err(in_node)?);
        let input_side_packets = Arc::new(TagMap::new(&node.input_side_packet).map_err(in_node)?);
        let output_side_packets =
            Arc::new(TagMap::new(&node.output_side_packet).map_err(in_node)?);
        let back_edges =
            Self::back_edges(&inputs, &node.input_stream_info).map_err(in_node)?;

        let entry = registry.calculator(&node.calculator).map_err(in_node)?.clone();
        let mut cc = CalculatorContract::new(
            name.clone(),
            Arc::clone(&inputs),
            Arc::clone(&outputs),
            Arc::clone(&input_side_packets),
            Arc::clone(&output_side_packets),
            node.options.clone(),
        );
        (entry.contract)(&mut cc).map_err(|e| e.in_node(name.clone()))?;
        let ports = Self::resolve_ports(&cc).map_err(in_node)?;
        let output_origins: Vec<Option<CollectionItemId>> = cc
            .outputs()
            .ids()
            .map(|id| {
                Self::input_origin(
                    &cc,
                    PortRef {
                        side: PortSide::Output,
                        id,
                    },
                )
            })
            .collect();

        let handler = node
            .input_stream_handler
            .clone()
            .or_else(|| cc.input_stream_handler().cloned())
            .or_else(|| graph.input_stream_handler.clone())
            .unwrap_or_default();
        if !inputs.is_empty() {
            InputStreamHandler::create(
                &handler,
                &name,
                &inputs,
                &back_edges,
                cc.process_timestamp_bounds(),
            )?;
        }

        let max_in_flight = node.max_in_flight.or(cc.max_in_flight()).unwrap_or(1);
        if max_in_flight == 0 {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': max_in_flight must be at least 1",
                name
            )));
        }
        if max_in_flight > 1 && !entry.shared {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': max_in_flight {} needs a shared calculator, '{}' is exclusive",
                name, max_in_flight, node.calculator
            )));
        }

        let spec = NodeSpec {
            id,
            name: Arc::from(name.as_str()),
            calculator: node.calculator.clone(),
            entry,
            options: node.options.clone(),
            inputs,
            input_types: ports.inputs,
            input_streams: Vec::new(),
            back_edges,
            outputs,
            output_types: ports.outputs,
            output_streams: Vec::new(),
            input_side_packets,
            input_side_packet_types: ports.input_side_packets,
            output_side_packets,
            output_side_packet_types: ports.output_side_packets,
            handler,
            process_timestamp_bounds: cc.process_timestamp_bounds(),
            timestamp_offset: cc.timestamp_offset(),
            max_in_flight,
            source_layer: node.source_layer,
            executor: node.executor.clone(),
            priority: 0,
        };
        Ok((spec, output_origins))
    }

    fn build_generator(
        generator: &PacketGeneratorConfig,
        registry: &CalculatorRegistry,
    ) -> Result<GeneratorSpec> {
        let name = generator.packet_generator.clone();
        let in_generator = |e: GraphError| e.with_context(format!("packet generator '{}'", name));

        let entry = registry.generator(&name).map_err(in_generator)?.clone();
        let inputs = Arc::new(TagMap::new(&generator.input_side_packet).map_err(in_generator)?);
        let outputs = Arc::new(TagMap::new(&generator.output_side_packet).map_err(in_generator)?);
        let mut cc = CalculatorContract::new(
            name.clone(),
            Arc::new(TagMap::default()),
            Arc::new(TagMap::default()),
            Arc::clone(&inputs),
            Arc::clone(&outputs),
            generator.options.clone(),
        );
        (entry.contract)(&mut cc).map_err(|e| e.in_node(name.clone()))?;
        let ports = Self::resolve_ports(&cc).map_err(in_generator)?;

        Ok(GeneratorSpec {
            name,
            inputs,
            input_types: ports.input_side_packets,
            outputs,
            output_types: ports.output_side_packets,
            options: generator.options.clone(),
            entry,
        })
    }

    fn back_edges(inputs: &TagMap, infos: &[InputStreamInfo]) -> Result<Vec<bool>> {
        let mut flags = vec![false; inputs.len()];
        for info in infos {
            let (tag, index) = parse_tag_index(&info.tag_index)?;
            let id = inputs.id(&tag, index.unwrap_or(0)).ok_or_else(|| {
                GraphError::InvalidConfig(format!(
                    "input_stream_info '{}' matches no input stream",
                    info.tag_index
                ))
            })?;
            flags[id.index()] = info.back_edge;
        }
        Ok(flags)
    }

    fn port_set(cc: &CalculatorContract, side: PortSide) -> &PortSet {
        match side {
            PortSide::Input => cc.inputs(),
            PortSide::Output => cc.outputs(),
            PortSide::InputSidePacket => cc.input_side_packets(),
            PortSide::OutputSidePacket => cc.output_side_packets(),
        }
    }

    fn resolve_ports(cc: &CalculatorContract) -> Result<ResolvedPorts> {
        let resolve_side = |side: PortSide| -> Result<Vec<ResolvedType>> {
            Self::port_set(cc, side)
                .ids()
                .map(|id| Self::resolve_port(cc, PortRef { side, id }))
                .collect()
        };
        Ok(ResolvedPorts {
            inputs: resolve_side(PortSide::Input)?,
            outputs: resolve_side(PortSide::Output)?,
            input_side_packets: resolve_side(PortSide::InputSidePacket)?,
            output_side_packets: resolve_side(PortSide::OutputSidePacket)?,
        })
    }

    /// Follow `SameAs` links within a node until a concrete type.
    fn resolve_port(cc: &CalculatorContract, start: PortRef) -> Result<ResolvedType> {
        let hops = cc.inputs().len()
            + cc.outputs().len()
            + cc.input_side_packets().len()
            + cc.output_side_packets().len();
        let mut port = start;
        for _ in 0..=hops {
            let set = Self::port_set(cc, port.side);
            if port.id.index() >= set.len() {
                return Err(GraphError::InvalidConfig(format!(
                    "{:?} port {} referenced by SameAs does not exist",
                    port.side,
                    port.id.index()
                )));
            }
            match set.get_type(port.id) {
                PacketType::Unset => {
                    return Err(GraphError::InvalidConfig(format!(
                        "{:?} port '{}' has no declared type",
                        port.side,
                        set.tag_map().entry(port.id)
                    )));
                }
                PacketType::Any => return Ok(ResolvedType::Any),
                PacketType::Exact { id, name } => {
                    return Ok(ResolvedType::Exact { id: *id, name: *name })
                }
                PacketType::SameAs(next) => port = *next,
            }
        }
        Err(GraphError::InvalidConfig(format!(
            "SameAs links starting at {:?} port {} form a cycle",
            start.side,
            start.id.index()
        )))
    }

    /// The `Any` input a port takes its type from through `SameAs` links, if any.
    fn input_origin(cc: &CalculatorContract, start: PortRef) -> Option<CollectionItemId> {
        let hops = cc.inputs().len()
            + cc.outputs().len()
            + cc.input_side_packets().len()
            + cc.output_side_packets().len();
        let mut port = start;
        for _ in 0..=hops {
            let set = Self::port_set(cc, port.side);
            if port.id.index() >= set.len() {
                return None;
            }
            match set.get_type(port.id) {
                PacketType::SameAs(next) => port = *next,
                PacketType::Any if port.side == PortSide::Input => {
                    return Some(port.id)
                }
                _ => return None,
            }
        }
        None
    }

    /// Carry stream types across nodes in topological order.
    ///
    /// An `Any` input takes the type of the stream feeding it, and outputs
    /// linked to that input by `SameAs` take it in turn. Every edge is then
    /// checked against the final stream types.
    fn propagate_stream_types(
        nodes: &mut [NodeSpec],
        streams: &mut [StreamSpec],
        order: &[NodeId],
        output_origins: &[Vec<Option<CollectionItemId>>],
    ) -> Result<()> {
        for id in order {
            let node = &mut nodes[id.index()];
            for (i, stream) in node.input_streams.iter().enumerate() {
                if node.input_types[i] == ResolvedType::Any {
                    node.input_types[i] = streams[stream.index()].packet_type;
                }
            }
            for (j, origin) in output_origins[id.index()].iter().enumerate() {
                let Some(input) = origin else { continue };
                let resolved = node.input_types[input.index()];
                node.output_types[j] = resolved;
                streams[node.output_streams[j].index()].packet_type = resolved;
            }
        }

        for node in nodes.iter() {
            for (i, entry) in node.inputs.entries().iter().enumerate() {
                let stream = &streams[node.input_streams[i].index()];
                Self::check_edge(node, entry, stream, node.input_types[i])?;
            }
        }
        Ok(())
    }

    fn check_edge(
        node: &NodeSpec,
        entry: &TagEntry,
        stream: &StreamSpec,
        expected: ResolvedType,
    ) -> Result<()> {
        if stream.packet_type.compatible_with(&expected) {
            return Ok(());
        }
        Err(GraphError::TypeMismatch {
            port: format!("{}:{}", node.name, entry),
            message: format!(
                "stream '{}' carries {:?} but the input expects {:?}",
                stream.name, stream.packet_type, expected
            ),
        })
    }

    fn check_executors(
        config: &GraphConfig,
        nodes: &[NodeSpec],
        extra_executors: &HashSet<String>,
    ) -> Result<()> {
        let mut declared = HashSet::new();
        for executor in &config.executor {
            if executor.name.is_empty() {
                return Err(GraphError::InvalidConfig("executor name must not be empty".into()));
            }
            if executor.num_threads == Some(0) {
                return Err(GraphError::InvalidConfig(format!(
                    "executor '{}' needs at least one thread",
                    executor.name
                )));
            }
            if !declared.insert(executor.name.as_str()) {
                return Err(GraphError::InvalidConfig(format!(
                    "executor '{}' is declared more than once",
                    executor.name
                )));
            }
        }
        for node in nodes {
            if let Some(executor) = &node.executor {
                if !declared.contains(executor.as_str()) && !extra_executors.contains(executor) {
                    return Err(GraphError::InvalidConfig(format!(
                        "node '{}' uses unknown executor '{}'",
                        node.name, executor
                    )));
                }
            }
        }
        Ok(())
    }

    fn wire_streams(
        config: &GraphConfig,
        nodes: &mut [NodeSpec],
    ) -> Result<(Vec<StreamSpec>, HashMap<String, StreamId>, Vec<StreamId>)> {
        let mut streams: Vec<StreamSpec> = Vec::new();
        let mut by_name: HashMap<String, StreamId> = HashMap::new();
        let mut graph_inputs = Vec::with_capacity(config.input_stream.len());

        let mut add_stream = |streams: &mut Vec<StreamSpec>,
                              name: &str,
                              producer: StreamProducer,
                              packet_type: ResolvedType|
         -> Result<StreamId> {
            if by_name.contains_key(name) {
                return Err(GraphError::InvalidConfig(format!(
                    "stream '{}' has more than one producer",
                    name
                )));
            }
            let id = StreamId(streams.len() as u32);
            streams.push(StreamSpec {
                id,
                name: name.to_string(),
                producer,
                packet_type,
                consumers: Vec::new(),
            });
            by_name.insert(name.to_string(), id);
            Ok(id)
        };

        for spec in &config.input_stream {
            let (_, _, name) = parse_tag_index_name(spec)?;
            let id = add_stream(&mut streams, &name, StreamProducer::GraphInput, ResolvedType::Any)?;
            graph_inputs.push(id);
        }

        for node in nodes.iter_mut() {
            let mut output_streams = Vec::with_capacity(node.outputs.len());
            for (i, entry) in node.outputs.entries().iter().enumerate() {
                let producer = StreamProducer::Node {
                    node: node.id,
                    output: CollectionItemId(i as u32),
                };
                let id = add_stream(&mut streams, &entry.name, producer, node.output_types[i])
                    .map_err(|e| e.with_context(format!("node '{}'", node.name)))?;
                output_streams.push(id);
            }
            node.output_streams = output_streams;
        }

        for node in nodes.iter_mut() {
            let mut input_streams = Vec::with_capacity(node.inputs.len());
            for (i, entry) in node.inputs.entries().iter().enumerate() {
                let id = by_name.get(&entry.name).copied().ok_or_else(|| {
                    GraphError::InvalidConfig(format!(
                        "input stream '{}' of node '{}' has no producer",
                        entry.name, node.name
                    ))
                })?;
                let stream = &mut streams[id.index()];
                Self::check_edge(node, entry, stream, node.input_types[i])?;
                stream.consumers.push(StreamConsumer {
                    node: node.id,
                    input: CollectionItemId(i as u32),
                    back_edge: node.back_edges[i],
                });
                input_streams.push(id);
            }
            node.input_streams = input_streams;
        }

        Ok((streams, by_name, graph_inputs))
    }

    fn wire_side_packets(
        nodes: &[NodeSpec],
        generators: &[GeneratorSpec],
    ) -> Result<HashMap<String, SidePacketSpec>> {
        let mut specs: HashMap<String, SidePacketSpec> = HashMap::new();
        let mut producer_types: HashMap<String, ResolvedType> = HashMap::new();

        fn spec_for<'a>(
            specs: &'a mut HashMap<String, SidePacketSpec>,
            name: &str,
        ) -> &'a mut SidePacketSpec {
            specs
                .entry(name.to_string())
                .or_insert_with(|| SidePacketSpec {
                    name: name.to_string(),
                    producer: SidePacketProducer::External,
                    consumer_types: Vec::new(),
                    consumer_nodes: Vec::new(),
                })
        }

        let mut add_producer = |specs: &mut HashMap<String, SidePacketSpec>,
                                name: &str,
                                producer: SidePacketProducer,
                                packet_type: ResolvedType|
         -> Result<()> {
            let spec = spec_for(specs, name);
            if spec.producer != SidePacketProducer::External {
                return Err(GraphError::InvalidConfig(format!(
                    "side packet '{}' has more than one producer",
                    name
                )));
            }
            spec.producer = producer;
            producer_types.insert(name.to_string(), packet_type);
            Ok(())
        };

        for (g, generator) in generators.iter().enumerate() {
            for (i, entry) in generator.outputs.entries().iter().enumerate() {
                add_producer(
                    &mut specs,
                    &entry.name,
                    SidePacketProducer::Generator(g),
                    generator.output_types[i],
                )?;
            }
        }
        for node in nodes {
            for (i, entry) in node.output_side_packets.entries().iter().enumerate() {
                add_producer(
                    &mut specs,
                    &entry.name,
                    SidePacketProducer::Node(node.id),
                    node.output_side_packet_types[i],
                )?;
            }
        }

        for generator in generators {
            for (i, entry) in generator.inputs.entries().iter().enumerate() {
                let spec = spec_for(&mut specs, &entry.name);
                if let SidePacketProducer::Node(_) = spec.producer {
                    return Err(GraphError::InvalidConfig(format!(
                        "packet generator '{}' needs side packet '{}', which is only produced while the graph runs",
                        generator.name, entry.name
                    )));
                }
                spec.consumer_types.push((
                    format!("packet generator '{}'", generator.name),
                    generator.input_types[i],
                ));
            }
        }
        for node in nodes {
            for (i, entry) in node.input_side_packets.entries().iter().enumerate() {
                let spec = spec_for(&mut specs, &entry.name);
                spec.consumer_types.push((
                    format!("{}:{}", node.name, entry),
                    node.input_side_packet_types[i],
                ));
                if !spec.consumer_nodes.contains(&node.id) {
                    spec.consumer_nodes.push(node.id);
                }
            }
        }

        for spec in specs.values() {
            let Some(produced) = producer_types.get(&spec.name) else {
                continue;
            };
            for (port, expected) in &spec.consumer_types {
                if !produced.compatible_with(expected) {
                    return Err(GraphError::TypeMismatch {
                        port: port.clone(),
                        message: format!(
                            "side packet '{}' is {:?} but the port expects {:?}",
                            spec.name, produced, expected
                        ),
                    });
                }
            }
        }

        Ok(specs)
    }

    /// Node dependencies: stream edges except back-edges, plus side packets
    /// produced by one node and consumed by another.
    fn build_adjacency(
        nodes: &[NodeSpec],
        streams: &[StreamSpec],
        side_packets: &HashMap<String, SidePacketSpec>,
    ) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); nodes.len()];
        for stream in streams {
            let StreamProducer::Node { node: from, .. } = stream.producer else {
                continue;
            };
            for consumer in stream.consumers.iter().filter(|c| !c.back_edge) {
                adj[from.index()].push(consumer.node.index());
            }
        }
        for spec in side_packets.values() {
            if let SidePacketProducer::Node(from) = spec.producer {
                for to in &spec.consumer_nodes {
                    adj[from.index()].push(to.index());
                }
            }
        }
        adj
    }

    /// Topological sort using Kahn's algorithm
    fn topological_sort(nodes: &[NodeSpec], adj: &[Vec<usize>]) -> Result<Vec<NodeId>> {
        let n = nodes.len();
        let mut in_degree = vec![0usize; n];
        for targets in adj {
            for &to in targets {
                in_degree[to] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            order.push(NodeId(node as u32));
            for &neighbor in &adj[node] {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    queue.push_back(neighbor);
                }
            }
        }

        if order.len() < n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| &*nodes[i].name)
                .collect();
            return Err(GraphError::Cycle(stuck.join(", ")));
        }
        Ok(order)
    }

    /// A source may not depend on a source of a higher layer.
    fn check_source_layers(nodes: &[NodeSpec], order: &[NodeId], adj: &[Vec<usize>]) -> Result<()> {
        fn higher(a: Option<(i32, usize)>, b: Option<(i32, usize)>) -> Option<(i32, usize)> {
            match (a, b) {
                (Some(x), Some(y)) => Some(if y.0 > x.0 { y } else { x }),
                (x, None) => x,
                (None, y) => y,
            }
        }

        // Highest-layer source upstream of each node.
        let mut upstream: Vec<Option<(i32, usize)>> = vec![None; nodes.len()];
        for id in order {
            let i = id.index();
            let node = &nodes[i];
            if node.is_source() {
                if let Some((layer, src)) = upstream[i] {
                    if layer > node.source_layer {
                        return Err(GraphError::SourceLayerInversion {
                            lower: node.name.to_string(),
                            lower_layer: node.source_layer,
                            higher: nodes[src].name.to_string(),
                            higher_layer: layer,
                        });
                    }
                }
                upstream[i] = higher(upstream[i], Some((node.source_layer, i)));
            }
            let here = upstream[i];
            for &j in &adj[i] {
                upstream[j] = higher(upstream[j], here);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraphConfig, NodeConfig, PacketGeneratorConfig};
    use crate::framework::calculator::Calculator;
    use crate::framework::context::CalculatorContext;

    #[derive(Default)]
    struct IntSource;

    impl Calculator for IntSource {
        fn contract(cc: &mut CalculatorContract) -> Result<()> {
            cc.outputs_mut().set_all(PacketType::of::<i64>());
            cc.input_side_packets_mut().set_all(PacketType::Any);
            cc.output_side_packets_mut().set_all(PacketType::of::<i64>());
            Ok(())
        }

        fn process(&mut self, _ctx: &mut CalculatorContext) -> Result<()> {
            Err(GraphError::Stop)
        }
    }

    #[derive(Default)]
    struct TextSink;

    impl Calculator for TextSink {
        fn contract(cc: &mut CalculatorContract) -> Result<()> {
            cc.inputs_mut().set_all(PacketType::of::<String>());
            cc.input_side_packets_mut().set_all(PacketType::of::<String>());
            Ok(())
        }

        fn process(&mut self, _ctx: &mut CalculatorContext) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Untyped;

    impl Calculator for Untyped {
        fn contract(_cc: &mut CalculatorContract) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, _ctx: &mut CalculatorContext) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> CalculatorRegistry {
        let mut registry = CalculatorRegistry::with_builtins();
        registry
            .register::<IntSource>("IntSource")
            .register::<TextSink>("TextSink")
            .register::<Untyped>("Untyped");
        registry
    }

    fn compile(config: &GraphConfig) -> Result<CompiledPlan> {
        GraphCompiler::compile(config, &registry(), &HashSet::new())
    }

    fn pass_through(input: &str, output: &str) -> NodeConfig {
        NodeConfig::new("PassThroughCalculator").input(input).output(output)
    }

    #[test]
    fn test_compile_linear_graph() {
        let config = GraphConfig::default()
            .with_input_stream("in")
            .with_output_stream("out")
            .with_node(pass_through("mid", "out"))
            .with_node(pass_through("in", "mid"));
        let plan = compile(&config).unwrap();

        assert_eq!(plan.stats.total_nodes, 2);
        assert_eq!(plan.stats.streams, 3);
        assert_eq!(plan.stats.source_nodes, 0);
        assert_eq!(plan.topo_order, vec![NodeId(1), NodeId(0)]);
        assert_eq!(plan.nodes[1].priority, 0);
        assert_eq!(plan.nodes[0].priority, 1);
        assert_ne!(plan.nodes[0].name, plan.nodes[1].name);
        assert_eq!(&*plan.nodes[1].name, "PassThroughCalculator_1");
    }

    #[test]
    fn test_rejects_empty_graph_and_unknown_calculator() {
        assert!(matches!(
            compile(&GraphConfig::default()),
            Err(GraphError::InvalidConfig(_))
        ));
        let config = GraphConfig::default().with_node(NodeConfig::new("NoSuchCalculator"));
        let err = compile(&config).unwrap_err();
        assert!(matches!(err.root(), GraphError::UnknownCalculator(_)));
    }

    #[test]
    fn test_rejects_bad_wiring() {
        let duplicate = GraphConfig::default()
            .with_input_stream("in")
            .with_node(pass_through("in", "out"))
            .with_node(pass_through("in", "out"));
        assert!(compile(&duplicate).is_err());

        let dangling = GraphConfig::default().with_node(pass_through("nowhere", "out"));
        assert!(compile(&dangling).is_err());

        let missing_output = GraphConfig::default()
            .with_input_stream("in")
            .with_output_stream("absent")
            .with_node(pass_through("in", "out"));
        assert!(compile(&missing_output).is_err());
    }

    #[test]
    fn test_rejects_untyped_ports() {
        let config = GraphConfig::default()
            .with_input_stream("in")
            .with_node(NodeConfig::new("Untyped").input("in"));
        let err = compile(&config).unwrap_err();
        assert!(err.to_string().contains("no declared type"));
    }

    #[test]
    fn test_type_mismatch_across_edge() {
        let config = GraphConfig::default()
            .with_node(NodeConfig::new("IntSource").output("numbers"))
            .with_node(NodeConfig::new("TextSink").input("numbers"));
        assert!(matches!(
            compile(&config),
            Err(GraphError::TypeMismatch { .. })
        ));

        // SameAs carries the source type through the pass-through node.
        let through = GraphConfig::default()
            .with_node(NodeConfig::new("IntSource").output("numbers"))
            .with_node(pass_through("numbers", "copied"))
            .with_node(NodeConfig::new("TextSink").input("copied"));
        assert!(matches!(
            compile(&through),
            Err(GraphError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_forwarded_stream_takes_producer_type() {
        let config = GraphConfig::default()
            .with_node(NodeConfig::new("IntSource").output("numbers"))
            .with_node(pass_through("numbers", "copied"))
            .with_node(pass_through("copied", "again"));
        let plan = compile(&config).unwrap();
        let int = ResolvedType::Exact {
            id: std::any::TypeId::of::<i64>(),
            name: std::any::type_name::<i64>(),
        };
        for name in ["numbers", "copied", "again"] {
            assert_eq!(plan.streams[plan.stream_by_name[name].index()].packet_type, int);
        }

        // Graph inputs stay untyped, and so does what is forwarded from them.
        let open = GraphConfig::default()
            .with_input_stream("in")
            .with_node(pass_through("in", "out"));
        let plan = compile(&open).unwrap();
        assert_eq!(
            plan.streams[plan.stream_by_name["out"].index()].packet_type,
            ResolvedType::Any
        );
    }

    #[test]
    fn test_side_packet_type_mismatch() {
        let config = GraphConfig::default()
            .with_node(NodeConfig::new("IntSource").output("a").output_side_packet("count"))
            .with_node(NodeConfig::new("TextSink").input_side_packet("count"));
        assert!(matches!(
            compile(&config),
            Err(GraphError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_cycle_needs_back_edge() {
        let cyclic = GraphConfig::default()
            .with_input_stream("in")
            .with_node(
                NodeConfig::new("PreviousLoopbackCalculator")
                    .input("MAIN:in")
                    .input("LOOP:looped")
                    .output("PREV_LOOP:prev"),
            )
            .with_node(pass_through("prev", "looped"));
        assert!(matches!(compile(&cyclic), Err(GraphError::Cycle(_))));

        let broken = GraphConfig::default()
            .with_input_stream("in")
            .with_node(
                NodeConfig::new("PreviousLoopbackCalculator")
                    .input("MAIN:in")
                    .input("LOOP:looped")
                    .output("PREV_LOOP:prev")
                    .back_edge("LOOP"),
            )
            .with_node(pass_through("prev", "looped"));
        let plan = compile(&broken).unwrap();
        assert_eq!(plan.stats.back_edges, 1);
        assert!(plan.nodes[0].back_edges[plan.nodes[0].inputs.id("LOOP", 0).unwrap().index()]);
    }

    #[test]
    fn test_source_layer_inversion() {
        // A layer-1 source feeds a side packet to a layer-0 source.
        let config = GraphConfig::default()
            .with_node(
                NodeConfig::new("IntSource")
                    .named("late")
                    .output("late_out")
                    .output_side_packet("seed")
                    .source_layer(1),
            )
            .with_node(
                NodeConfig::new("IntSource")
                    .named("early")
                    .output("early_out")
                    .input_side_packet("seed")
                    .source_layer(0),
            );
        match compile(&config) {
            Err(GraphError::SourceLayerInversion { lower, higher, .. }) => {
                assert_eq!(lower, "early");
                assert_eq!(higher, "late");
            }
            other => panic!("expected layer inversion, got {:?}", other.map(|p| p.stats)),
        }
    }

    #[test]
    fn test_max_in_flight_requires_shared_calculator() {
        let exclusive = GraphConfig::default()
            .with_input_stream("in")
            .with_node(NodeConfig::new("TextSink").input("in").max_in_flight(2));
        assert!(compile(&exclusive).is_err());

        let shared = GraphConfig::default()
            .with_input_stream("in")
            .with_node(pass_through("in", "out").max_in_flight(4));
        assert_eq!(compile(&shared).unwrap().nodes[0].max_in_flight, 4);
    }

    #[test]
    fn test_executor_names_must_exist() {
        let config = GraphConfig::default()
            .with_input_stream("in")
            .with_node(pass_through("in", "out").executor("gpu"));
        assert!(compile(&config).is_err());

        let declared = config.clone().with_executor("gpu", 1);
        assert!(compile(&declared).is_ok());

        let extra: HashSet<String> = ["gpu".to_string()].into_iter().collect();
        assert!(GraphCompiler::compile(&config, &registry(), &extra).is_ok());
    }

    #[test]
    fn test_generator_cannot_wait_for_node_side_packets() {
        let config = GraphConfig::default()
            .with_node(NodeConfig::new("IntSource").output("a").output_side_packet("count"))
            .with_packet_generator(
                PacketGeneratorConfig::new("ConstantSidePacketGenerator")
                    .input_side_packet("count")
                    .output_side_packet("other"),
            );
        assert!(compile(&config).is_err());
    }

    #[test]
    fn test_handler_config_is_validated() {
        let config = GraphConfig::default()
            .with_input_stream("in")
            .with_node(pass_through("in", "out").handler(
                crate::config::InputStreamHandlerConfig::SyncSet {
                    sync_sets: vec![vec!["MISSING".into()]],
                },
            ));
        assert!(compile(&config).is_err());
    }
}
