//! Run-time state of one node.
//!
//! Lock order, outermost first: `outputs`, then `core`, then `reorder` and the
//! scheduler queues. The outputs lock of one node is never held while another
//! node's scheduling is decided.

use super::compiled_plan::NodeSpec;
use super::side_packet::SidePacketStore;
use crate::error::{GraphError, Result};
use crate::framework::calculator::{Calculator, CalculatorInstance, SharedCalculator};
use crate::framework::clock::Clock;
use crate::framework::context::{
    CalculatorContext, Inputs, OutputStreamShard, Outputs, SidePacketSet,
};
use crate::framework::handler::{InputQueue, InputStreamHandler};
use crate::framework::id::NodeId;
use crate::framework::packet::Packet;
use crate::framework::profiler::{ProfilerSink, TraceEvent, TraceEventKind, TracePhase};
use crate::framework::timestamp::Timestamp;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting for input side packets
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Inputs and scheduling bookkeeping.
#[derive(Debug)]
pub(crate) struct NodeCore {
    pub state: NodeState,
    pub queues: Vec<InputQueue>,
    /// `None` for sources
    pub handler: Option<InputStreamHandler>,
    pub input_side_packets: Option<Arc<SidePacketSet>>,
    /// Queued or running tasks
    pub in_flight: usize,
    pub next_seq: u64,
    pub source_active: bool,
    pub source_done: bool,
    pub last_output: Timestamp,
    pub back_edges_released: bool,
}

impl NodeCore {
    pub(crate) fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Every non-back-edge input is done.
    pub(crate) fn forward_inputs_done(&self) -> bool {
        self.queues
            .iter()
            .filter(|q| !q.is_back_edge())
            .all(InputQueue::is_done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputStreamState {
    pub bound: Timestamp,
    pub closed: bool,
}

impl Default for OutputStreamState {
    fn default() -> Self {
        Self {
            bound: Timestamp::PRE_STREAM,
            closed: false,
        }
    }
}

/// Producer side of the node's output streams.
#[derive(Debug)]
pub(crate) struct NodeOutputs {
    pub streams: Vec<OutputStreamState>,
    /// Next task sequence number to propagate
    pub next_release: u64,
}

/// What one calculator call wrote to one output stream.
#[derive(Debug, Default)]
pub(crate) struct Emission {
    pub packets: Vec<Packet>,
    pub bound: Option<Timestamp>,
    pub closed: bool,
}

/// Buffered result of one calculator call, waiting for propagation.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    /// Input timestamp of a Process call
    pub input_timestamp: Option<Timestamp>,
    pub emissions: Vec<Emission>,
    pub side_packets: Vec<(String, Packet)>,
}

impl Completion {
    fn new(input_timestamp: Option<Timestamp>, outputs: Outputs, mut side_packets: SidePacketSet) -> Self {
        let emissions = outputs
            .into_shards()
            .into_iter()
            .map(|shard| {
                let (packets, bound, closed) = shard.into_parts();
                Emission {
                    packets,
                    bound,
                    closed,
                }
            })
            .collect();
        Self {
            input_timestamp,
            emissions,
            side_packets: side_packets.take_fresh(),
        }
    }

    /// Drop everything but stream closures.
    pub(crate) fn discard_data(&mut self) {
        for emission in &mut self.emissions {
            emission.packets.clear();
            emission.bound = None;
        }
        self.side_packets.clear();
    }

    pub(crate) fn last_packet_timestamp(&self) -> Option<Timestamp> {
        self.emissions
            .iter()
            .filter_map(|e| e.packets.last().map(Packet::timestamp))
            .max()
    }
}

/// The calculator instance of a run.
pub(crate) enum CalculatorCell {
    Exclusive(Mutex<Box<dyn Calculator>>),
    Shared(Arc<dyn SharedCalculator>),
}

impl CalculatorCell {
    fn new(instance: CalculatorInstance) -> Self {
        match instance {
            CalculatorInstance::Exclusive(c) => CalculatorCell::Exclusive(Mutex::new(c)),
            CalculatorInstance::Shared(c) => CalculatorCell::Shared(c),
        }
    }

    fn call(&self, kind: TraceEventKind, ctx: &mut CalculatorContext) -> Result<()> {
        match self {
            CalculatorCell::Exclusive(calculator) => {
                let mut calculator = calculator.lock();
                match kind {
                    TraceEventKind::Open => calculator.open(ctx),
                    TraceEventKind::Process => calculator.process(ctx),
                    TraceEventKind::Close => calculator.close(ctx),
                }
            }
            CalculatorCell::Shared(calculator) => match kind {
                TraceEventKind::Open => calculator.open(ctx),
                TraceEventKind::Process => calculator.process(ctx),
                TraceEventKind::Close => calculator.close(ctx),
            },
        }
    }
}

/// Ambient services a calculator call needs.
pub(crate) struct CallEnv<'a> {
    pub store: &'a SidePacketStore,
    pub clock: &'a Arc<dyn Clock>,
    pub profiler: Option<&'a Arc<dyn ProfilerSink>>,
}

pub(crate) struct NodeRuntime {
    pub id: NodeId,
    pub name: Arc<str>,
    pub core: Mutex<NodeCore>,
    pub outputs: Mutex<NodeOutputs>,
    pub reorder: Mutex<BTreeMap<u64, Vec<Completion>>>,
    calculator: CalculatorCell,
}

impl NodeRuntime {
    /// Fresh state and a fresh calculator instance for one run.
    pub(crate) fn new(spec: &NodeSpec) -> Result<Self> {
        let handler = if spec.is_source() {
            None
        } else {
            Some(InputStreamHandler::create(
                &spec.handler,
                &spec.name,
                &spec.inputs,
                &spec.back_edges,
                spec.process_timestamp_bounds,
            )?)
        };
        let queues = spec.back_edges.iter().map(|&b| InputQueue::new(b)).collect();

        Ok(Self {
            id: spec.id,
            name: Arc::clone(&spec.name),
            core: Mutex::new(NodeCore {
                state: NodeState::Unopened,
                queues,
                handler,
                input_side_packets: None,
                in_flight: 0,
                next_seq: 0,
                source_active: false,
                source_done: false,
                last_output: Timestamp::UNSET,
                back_edges_released: false,
            }),
            outputs: Mutex::new(NodeOutputs {
                streams: vec![OutputStreamState::default(); spec.outputs.len()],
                next_release: 0,
            }),
            reorder: Mutex::new(BTreeMap::new()),
            calculator: CalculatorCell::new((spec.entry.factory)()),
        })
    }

    pub(crate) fn state(&self) -> NodeState {
        self.core.lock().state
    }

    fn output_template(&self, spec: &NodeSpec) -> Outputs {
        let outputs = self.outputs.lock();
        let shards = spec
            .outputs
            .entries()
            .iter()
            .zip(&outputs.streams)
            .enumerate()
            .map(|(i, (entry, state))| {
                OutputStreamShard::new(entry.name.as_str(), spec.output_types[i], state.closed)
            })
            .collect();
        Outputs::new(Arc::clone(&spec.outputs), shards)
    }

    /// Run one calculator callback and buffer what it wrote.
    ///
    /// The completion is returned even when the callback fails, so a graceful
    /// stop keeps its output.
    pub(crate) fn invoke(
        &self,
        spec: &NodeSpec,
        kind: TraceEventKind,
        input_timestamp: Timestamp,
        inputs: Inputs,
        input_side_packets: &SidePacketSet,
        env: &CallEnv<'_>,
    ) -> (Completion, Result<()>) {
        let outputs = self.output_template(spec);
        let output_side_packets =
            env.store.view(&spec.output_side_packets, &spec.output_side_packet_types);
        let mut ctx = CalculatorContext::new(
            &spec.name,
            input_timestamp,
            inputs,
            outputs,
            input_side_packets,
            output_side_packets,
            &spec.options,
            env.clock,
        );

        self.trace(env, kind, TracePhase::Start, input_timestamp);
        let result = catch_unwind(AssertUnwindSafe(|| self.calculator.call(kind, &mut ctx)))
            .unwrap_or_else(|payload| Err(GraphError::failed(panic_message(payload.as_ref()))));
        self.trace(env, kind, TracePhase::Finish, input_timestamp);

        let (outputs, side_packets) = ctx.into_parts();
        let process_ts = (kind == TraceEventKind::Process).then_some(input_timestamp);
        (Completion::new(process_ts, outputs, side_packets), result)
    }

    fn trace(&self, env: &CallEnv<'_>, kind: TraceEventKind, phase: TracePhase, ts: Timestamp) {
        if let Some(profiler) = env.profiler {
            profiler.record(&TraceEvent {
                node: Arc::clone(&self.name),
                kind,
                phase,
                input_timestamp: ts,
                at: env.clock.now(),
            });
        }
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
