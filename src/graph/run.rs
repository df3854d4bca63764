//! One run of a compiled graph.
//!
//! `GraphRun` owns everything that is rebuilt by `start_run`: node runtimes,
//! task queues, graph input bounds and resolved side packets. Jobs handed to
//! executors keep the run alive through an `Arc`.
//!
//! Work accounting: `pending` counts queued tasks plus API calls in progress.
//! When it drops to zero the run is idle and `on_idle` decides what happens
//! next: activate the next source layer, close nodes held open only by
//! back-edges, report a deadlock, or finish the run.

use super::compiled_plan::{CompiledPlan, NodeSpec};
use super::node::{CallEnv, Completion, NodeCore, NodeRuntime, NodeState, OutputStreamState};
use super::observer::{PollerMessage, StreamObserver};
use super::node::panic_message;
use super::scheduler::{SchedulerQueue, Task, TaskKind, TaskPriority};
use super::side_packet::SidePacketStore;
use crate::error::{GraphError, Result};
use crate::framework::clock::Clock;
use crate::framework::context::{Inputs, SidePacketSet};
use crate::framework::handler::{settled_input_bound, InputSet, Readiness};
use crate::framework::id::{NodeId, StreamId};
use crate::framework::packet::Packet;
use crate::framework::profiler::{ProfilerSink, TraceEventKind};
use crate::framework::timestamp::{settled_timestamp, Timestamp};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Everything `start_run` resolved before the run begins.
pub(crate) struct RunSetup {
    pub plan: Arc<CompiledPlan>,
    pub queues: Vec<SchedulerQueue>,
    pub node_queue: Vec<usize>,
    pub observers: Vec<Vec<StreamObserver>>,
    pub pollers: Vec<Sender<PollerMessage>>,
    pub side_packets: HashMap<String, Packet>,
    pub clock: Arc<dyn Clock>,
    pub profiler: Option<Arc<dyn ProfilerSink>>,
}

#[derive(Debug, Default)]
struct RunStatus {
    idle: bool,
    error: Option<GraphError>,
    outcome: Option<Result<()>>,
}

#[derive(Debug, Default)]
struct IdleState {
    started: bool,
    /// Source layers below this index have been activated
    next_layer: usize,
}

pub(crate) struct GraphRun {
    plan: Arc<CompiledPlan>,
    nodes: Vec<NodeRuntime>,
    queues: Vec<SchedulerQueue>,
    node_queue: Vec<usize>,
    graph_inputs: Mutex<Vec<OutputStreamState>>,
    observers: Vec<Vec<StreamObserver>>,
    pollers: Vec<Sender<PollerMessage>>,
    side_packets: SidePacketStore,
    clock: Arc<dyn Clock>,
    profiler: Option<Arc<dyn ProfilerSink>>,

    pending: AtomicUsize,
    /// Tasks ever pushed; lets `on_idle` tell whether it scheduled anything
    pushed: AtomicU64,
    has_error: AtomicBool,
    status: Mutex<RunStatus>,
    changed: Condvar,
    idle: Mutex<IdleState>,
}

fn next_bound_after(ts: Timestamp) -> Result<Timestamp> {
    if ts == Timestamp::POST_STREAM {
        Ok(Timestamp::ONE_OVER_POST_STREAM)
    } else {
        ts.next_allowed_in_stream()
    }
}

impl GraphRun {
    pub(crate) fn new(setup: RunSetup) -> Result<Arc<Self>> {
        let nodes = setup
            .plan
            .nodes
            .iter()
            .map(NodeRuntime::new)
            .collect::<Result<Vec<_>>>()?;
        let graph_inputs = vec![OutputStreamState::default(); setup.plan.graph_inputs.len()];

        Ok(Arc::new(Self {
            plan: setup.plan,
            nodes,
            queues: setup.queues,
            node_queue: setup.node_queue,
            graph_inputs: Mutex::new(graph_inputs),
            observers: setup.observers,
            pollers: setup.pollers,
            side_packets: SidePacketStore::new(setup.side_packets),
            clock: setup.clock,
            profiler: setup.profiler,
            pending: AtomicUsize::new(0),
            pushed: AtomicU64::new(0),
            has_error: AtomicBool::new(false),
            status: Mutex::new(RunStatus::default()),
            changed: Condvar::new(),
            idle: Mutex::new(IdleState::default()),
        }))
    }

    /// Open every node whose side packets are available.
    pub(crate) fn start(self: &Arc<Self>) {
        tracing::info!(nodes = self.nodes.len(), "starting graph run");
        self.begin_work();
        for &id in &self.plan.topo_order {
            self.schedule_ready(id);
        }
        self.end_work();
    }

    // ── Status ──────────────────────────────────────────────────────────────

    pub(crate) fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.status.lock().outcome.is_some()
    }

    pub(crate) fn side_packet(&self, name: &str) -> Option<Packet> {
        self.side_packets.get(name)
    }

    pub(crate) fn node_state(&self, id: NodeId) -> NodeState {
        self.nodes[id.index()].state()
    }

    pub(crate) fn wait_until_idle(&self) -> Result<()> {
        let mut status = self.status.lock();
        while !status.idle && status.outcome.is_none() {
            self.changed.wait(&mut status);
        }
        match &status.outcome {
            Some(Err(e)) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    pub(crate) fn wait_until_done(&self) -> Result<()> {
        let mut status = self.status.lock();
        loop {
            if let Some(outcome) = &status.outcome {
                return outcome.clone();
            }
            self.changed.wait(&mut status);
        }
    }

    /// Keep the first error; later ones are only logged.
    fn record_error(&self, error: GraphError) {
        let mut status = self.status.lock();
        if status.error.is_none() {
            tracing::error!(error = %error, "graph run failed");
            status.error = Some(error);
            self.has_error.store(true, Ordering::SeqCst);
        } else {
            tracing::debug!(error = %error, "further error after run failure");
        }
    }

    fn finish(&self, outcome: Result<()>) {
        match &outcome {
            Ok(()) => tracing::info!("graph run finished"),
            Err(e) => tracing::warn!(error = %e, "graph run finished with an error"),
        }
        for poller in &self.pollers {
            // Pollers whose reader is gone are skipped.
            let _ = poller.send(PollerMessage::Done);
        }
        let mut status = self.status.lock();
        status.outcome = Some(outcome);
        status.idle = true;
        self.changed.notify_all();
    }

    // ── Work accounting ─────────────────────────────────────────────────────

    fn begin_work(&self) {
        if self.pending.fetch_add(1, Ordering::SeqCst) == 0 {
            self.status.lock().idle = false;
        }
    }

    fn end_work(self: &Arc<Self>) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.on_idle();
        }
    }

    fn env(&self) -> CallEnv<'_> {
        CallEnv {
            store: &self.side_packets,
            clock: &self.clock,
            profiler: self.profiler.as_ref(),
        }
    }

    // ── Scheduling ──────────────────────────────────────────────────────────

    fn push_task(self: &Arc<Self>, core: &mut NodeCore, id: NodeId, kind: TaskKind) {
        let spec = self.plan.node(id);
        let seq = core.take_seq();
        core.in_flight += 1;
        let task = Task {
            node: id,
            seq,
            kind,
            priority: TaskPriority {
                source: spec.is_source(),
                topo_position: spec.priority,
                source_layer: spec.source_layer,
                last_output: core.last_output,
            },
            order: self.pushed.fetch_add(1, Ordering::SeqCst),
        };
        tracing::trace!(node = %spec.name, task = task.kind.label(), seq, "task queued");

        self.begin_work();
        let queue = self.node_queue[id.index()];
        let run = Arc::clone(self);
        self.queues[queue].push(task, Box::new(move || run.run_next(queue)));
    }

    /// Decide what `id` can do now and queue it.
    fn schedule_ready(self: &Arc<Self>, id: NodeId) {
        if self.has_error() {
            return;
        }
        let spec = self.plan.node(id);
        let node = &self.nodes[id.index()];
        let mut offset_bound = None;
        {
            let mut core = node.core.lock();
            match core.state {
                NodeState::Unopened => {
                    if spec.side_packets_ready(|name| self.side_packets.contains(name)) {
                        let view = self
                            .side_packets
                            .view(&spec.input_side_packets, &spec.input_side_packet_types);
                        core.input_side_packets = Some(Arc::new(view));
                        core.state = NodeState::Opening;
                        self.push_task(&mut core, id, TaskKind::Open);
                    }
                    return;
                }
                NodeState::Open => {}
                NodeState::Opening | NodeState::Closing | NodeState::Closed => return,
            }

            if spec.is_source() {
                if core.in_flight == 0 {
                    if core.source_done {
                        core.state = NodeState::Closing;
                        self.push_task(&mut core, id, TaskKind::Close);
                    } else if core.source_active {
                        self.push_task(&mut core, id, TaskKind::SourceProcess);
                    }
                }
                return;
            }

            while core.in_flight < spec.max_in_flight {
                let NodeCore {
                    handler, queues, ..
                } = &mut *core;
                let Some(handler) = handler.as_mut() else {
                    return;
                };
                match handler.readiness(queues) {
                    Readiness::Ready(sets) => {
                        self.push_task(&mut core, id, TaskKind::Process { sets });
                    }
                    Readiness::ReadyForClose => {
                        if core.in_flight == 0 {
                            core.state = NodeState::Closing;
                            self.push_task(&mut core, id, TaskKind::Close);
                        }
                        break;
                    }
                    Readiness::NotReady => break,
                }
            }

            if let Some(offset) = spec.timestamp_offset {
                let buffered = core.handler.as_ref().is_some_and(|h| h.has_buffered());
                if core.state == NodeState::Open && core.in_flight == 0 && !buffered {
                    let bound = settled_input_bound(&core.queues);
                    if bound.is_range_value() {
                        offset_bound = bound.checked_add(offset).ok();
                    }
                }
            }
        }

        if let Some(bound) = offset_bound {
            self.advance_output_bounds(id, bound);
        }
    }

    fn schedule_all(self: &Arc<Self>, touched: Vec<NodeId>) {
        for id in touched {
            self.schedule_ready(id);
        }
    }

    // ── Task execution ──────────────────────────────────────────────────────

    fn run_next(self: &Arc<Self>, queue: usize) {
        if let Some(task) = self.queues[queue].pop() {
            self.run_task(task);
        }
        self.end_work();
    }

    fn run_task(self: &Arc<Self>, task: Task) {
        let id = task.node;
        match task.kind {
            TaskKind::Open => self.run_open(id, task.seq),
            TaskKind::Process { sets } => self.run_process(id, task.seq, sets),
            TaskKind::SourceProcess => self.run_source(id, task.seq),
            TaskKind::Close => self.run_close(id, task.seq),
        }
    }

    fn node_side_packets(&self, id: NodeId) -> Arc<SidePacketSet> {
        let spec = self.plan.node(id);
        let existing = self.nodes[id.index()].core.lock().input_side_packets.clone();
        existing.unwrap_or_else(|| {
            Arc::new(
                self.side_packets
                    .view(&spec.input_side_packets, &spec.input_side_packet_types),
            )
        })
    }

    fn run_open(self: &Arc<Self>, id: NodeId, seq: u64) {
        let spec = self.plan.node(id);
        if self.has_error() {
            self.complete(id, seq, Vec::new(), |_| {});
            return;
        }

        let side_packets = self.node_side_packets(id);
        let inputs = Inputs::empty(Arc::clone(&spec.inputs), Timestamp::UNSTARTED, false);
        let (mut completion, result) = self.nodes[id.index()].invoke(
            spec,
            TraceEventKind::Open,
            Timestamp::UNSTARTED,
            inputs,
            &side_packets,
            &self.env(),
        );

        let mut stopped = false;
        let opened = match result {
            Ok(()) => true,
            Err(e) if e.is_stop() => {
                stopped = true;
                true
            }
            Err(e) => {
                self.record_error(e.in_node(spec.name.to_string()));
                completion.discard_data();
                false
            }
        };
        tracing::debug!(node = %spec.name, opened, "node opened");

        let source = spec.is_source();
        self.complete(id, seq, vec![completion], |core| {
            if opened {
                core.state = NodeState::Open;
            }
            if stopped && source {
                core.source_done = true;
            }
        });
        if stopped && !source {
            self.close_all_packet_sources();
        }
    }

    fn run_process(self: &Arc<Self>, id: NodeId, seq: u64, sets: Vec<InputSet>) {
        let spec = self.plan.node(id);
        if self.has_error() {
            self.complete(id, seq, Vec::new(), |_| {});
            return;
        }

        let side_packets = self.node_side_packets(id);
        let env = self.env();
        let mut completions = Vec::with_capacity(sets.len());
        let mut stopped = false;
        for set in sets {
            let timestamp = set.timestamp;
            let inputs = Inputs::new(Arc::clone(&spec.inputs), set.shards);
            let (mut completion, result) = self.nodes[id.index()].invoke(
                spec,
                TraceEventKind::Process,
                timestamp,
                inputs,
                &side_packets,
                &env,
            );
            match result {
                Ok(()) => completions.push(completion),
                Err(e) if e.is_stop() => {
                    stopped = true;
                    completions.push(completion);
                }
                Err(e) => {
                    self.record_error(
                        e.with_context(format!("at {}", timestamp))
                            .in_node(spec.name.to_string()),
                    );
                    completion.discard_data();
                    completions.push(completion);
                    break;
                }
            }
        }

        self.complete(id, seq, completions, |_| {});
        if stopped {
            tracing::info!(node = %spec.name, "node requested a graceful stop");
            self.close_all_packet_sources();
        }
    }

    fn run_source(self: &Arc<Self>, id: NodeId, seq: u64) {
        let spec = self.plan.node(id);
        if self.has_error() {
            self.complete(id, seq, Vec::new(), |_| {});
            return;
        }

        let side_packets = self.node_side_packets(id);
        let inputs = Inputs::empty(Arc::clone(&spec.inputs), Timestamp::UNSTARTED, false);
        let (mut completion, result) = self.nodes[id.index()].invoke(
            spec,
            TraceEventKind::Process,
            Timestamp::UNSTARTED,
            inputs,
            &side_packets,
            &self.env(),
        );

        let done = match result {
            Ok(()) => false,
            Err(e) if e.is_stop() => {
                tracing::debug!(node = %spec.name, "source finished");
                true
            }
            Err(e) => {
                self.record_error(e.in_node(spec.name.to_string()));
                completion.discard_data();
                true
            }
        };
        let last = completion.last_packet_timestamp();
        self.complete(id, seq, vec![completion], |core| {
            if let Some(ts) = last {
                core.last_output = core.last_output.max(ts);
            }
            if done {
                core.source_done = true;
            }
        });
    }

    fn run_close(self: &Arc<Self>, id: NodeId, seq: u64) {
        let spec = self.plan.node(id);
        let side_packets = self.node_side_packets(id);
        let inputs = Inputs::empty(Arc::clone(&spec.inputs), Timestamp::DONE, true);
        let (mut completion, result) = self.nodes[id.index()].invoke(
            spec,
            TraceEventKind::Close,
            Timestamp::DONE,
            inputs,
            &side_packets,
            &self.env(),
        );
        if let Err(e) = result {
            if !e.is_stop() {
                self.record_error(e.in_node(spec.name.to_string()));
                completion.discard_data();
            }
        }
        for emission in &mut completion.emissions {
            emission.closed = true;
        }

        self.complete(id, seq, vec![completion], |core| core.state = NodeState::Closed);
        tracing::debug!(node = %spec.name, "node closed");
        self.check_output_side_packets(spec);
    }

    /// A closed node must have set every output side packet someone waits for.
    fn check_output_side_packets(&self, spec: &NodeSpec) {
        for name in spec.output_side_packets.names() {
            let needed = self
                .plan
                .side_packets
                .get(name)
                .is_some_and(|sp| !sp.consumer_nodes.is_empty());
            if needed && !self.side_packets.contains(name) {
                self.record_error(GraphError::MissingSidePacket(format!(
                    "'{}' was not set by node '{}' before it closed",
                    name, spec.name
                )));
            }
        }
    }

    /// Hand a task's output to the reorder buffer, propagate everything that
    /// is now in sequence, then update the node and reschedule.
    fn complete(
        self: &Arc<Self>,
        id: NodeId,
        seq: u64,
        completions: Vec<Completion>,
        update: impl FnOnce(&mut NodeCore),
    ) {
        let node = &self.nodes[id.index()];
        node.reorder.lock().insert(seq, completions);
        let mut touched = self.release(id);
        {
            let mut core = node.core.lock();
            core.in_flight = core.in_flight.saturating_sub(1);
            update(&mut core);
        }
        if !touched.contains(&id) {
            touched.push(id);
        }
        self.schedule_all(touched);
    }

    // ── Propagation ─────────────────────────────────────────────────────────

    /// Propagate buffered completions in task order. Returns the nodes whose
    /// inputs or side packets changed.
    fn release(&self, id: NodeId) -> Vec<NodeId> {
        let spec = self.plan.node(id);
        let node = &self.nodes[id.index()];
        let mut touched = Vec::new();
        let mut outputs = node.outputs.lock();
        loop {
            let next = {
                let mut reorder = node.reorder.lock();
                match reorder.first_key_value() {
                    Some((&seq, _)) if seq == outputs.next_release => reorder.pop_first(),
                    _ => None,
                }
            };
            let Some((_, completions)) = next else {
                break;
            };
            outputs.next_release += 1;
            for completion in completions {
                if let Err(e) = self.apply(spec, &mut outputs.streams, completion, &mut touched) {
                    self.record_error(e.in_node(spec.name.to_string()));
                }
            }
        }
        touched
    }

    fn apply(
        &self,
        spec: &NodeSpec,
        streams: &mut [OutputStreamState],
        completion: Completion,
        touched: &mut Vec<NodeId>,
    ) -> Result<()> {
        let input_timestamp = completion.input_timestamp;
        for (i, emission) in completion.emissions.into_iter().enumerate() {
            let stream_id = spec.output_streams[i];
            let state = &mut streams[i];
            if state.closed {
                if let Some(packet) = emission.packets.first() {
                    return Err(GraphError::InvalidState(format!(
                        "packet at {} added to closed stream '{}'",
                        packet.timestamp(),
                        self.plan.stream(stream_id).name
                    )));
                }
                continue;
            }

            let previous = state.bound;
            let mut bound = previous;
            for packet in &emission.packets {
                let ts = packet.timestamp();
                if ts < bound {
                    return Err(GraphError::TimestampOrder {
                        stream: self.plan.stream(stream_id).name.clone(),
                        timestamp: ts.to_string(),
                        bound: bound.to_string(),
                    });
                }
                bound = next_bound_after(ts)?;
            }
            if let Some(explicit) = emission.bound {
                bound = bound.max(explicit);
            }
            if let (Some(offset), Some(ts)) = (spec.timestamp_offset, input_timestamp) {
                if ts.is_range_value() {
                    bound = bound.max(ts.checked_add(offset)?.next_allowed_in_stream()?);
                }
            }
            let closed = emission.closed || bound == Timestamp::DONE;
            if closed {
                bound = Timestamp::DONE;
            }
            if emission.packets.is_empty() && bound == previous {
                continue;
            }

            state.bound = bound;
            state.closed = closed;
            self.deliver(stream_id, &emission.packets, previous, bound, touched)?;
        }

        for (name, packet) in completion.side_packets {
            if let Some(side_packet) = self.plan.side_packets.get(&name) {
                side_packet.validate(&packet)?;
                touched.extend(side_packet.consumer_nodes.iter().copied());
            }
            tracing::debug!(node = %spec.name, side_packet = %name, "side packet resolved");
            self.side_packets.insert(name, packet)?;
        }
        Ok(())
    }

    /// Push packets and the new bound of one stream to its consumers and
    /// observers. Called with the producer's output lock held.
    fn deliver(
        &self,
        stream_id: StreamId,
        packets: &[Packet],
        previous: Timestamp,
        bound: Timestamp,
        touched: &mut Vec<NodeId>,
    ) -> Result<()> {
        let stream = self.plan.stream(stream_id);
        for consumer in &stream.consumers {
            {
                let mut core = self.nodes[consumer.node.index()].core.lock();
                if core.state == NodeState::Closed {
                    continue;
                }
                let queue = &mut core.queues[consumer.input.index()];
                for packet in packets {
                    queue.push(packet.clone());
                }
                queue.set_bound(bound);
            }
            if !touched.contains(&consumer.node) {
                touched.push(consumer.node);
            }
        }

        for observer in &self.observers[stream_id.index()] {
            for packet in packets {
                Self::notify(observer, &stream.name, packet)?;
            }
            if observer.observe_bounds {
                let implied = match packets.last() {
                    Some(packet) => next_bound_after(packet.timestamp())?,
                    None => previous,
                };
                let settled = settled_timestamp(bound);
                if bound > implied && settled.is_range_value() {
                    Self::notify(observer, &stream.name, &Packet::empty().at(settled))?;
                }
            }
        }
        Ok(())
    }

    fn notify(observer: &StreamObserver, stream: &str, packet: &Packet) -> Result<()> {
        catch_unwind(AssertUnwindSafe(|| (observer.callback)(packet)))
            .unwrap_or_else(|payload| Err(GraphError::failed(panic_message(payload.as_ref()))))
            .map_err(|e| e.with_context(format!("observer of stream '{}'", stream)))
    }

    /// Raise the bound of every open output of `id` to `bound`.
    fn advance_output_bounds(self: &Arc<Self>, id: NodeId, bound: Timestamp) {
        let spec = self.plan.node(id);
        let mut touched = Vec::new();
        {
            let mut outputs = self.nodes[id.index()].outputs.lock();
            for (i, state) in outputs.streams.iter_mut().enumerate() {
                if state.closed || bound <= state.bound {
                    continue;
                }
                let previous = state.bound;
                state.bound = bound;
                if let Err(e) = self.deliver(spec.output_streams[i], &[], previous, bound, &mut touched) {
                    self.record_error(e.in_node(spec.name.to_string()));
                }
            }
        }
        self.schedule_all(touched);
    }

    // ── Graph inputs ────────────────────────────────────────────────────────

    fn graph_input_index(&self, name: &str) -> Result<usize> {
        self.plan
            .graph_inputs
            .iter()
            .position(|&id| self.plan.stream(id).name == name)
            .ok_or_else(|| GraphError::NotFound(format!("graph input stream '{}'", name)))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_finished() {
            return Err(GraphError::InvalidState("the graph run has finished".into()));
        }
        Ok(())
    }

    /// Run `f` on one graph input while counting as pending work.
    fn with_graph_input(
        self: &Arc<Self>,
        name: &str,
        f: impl FnOnce(&mut OutputStreamState) -> Result<Option<(Vec<Packet>, Timestamp)>>,
    ) -> Result<()> {
        let index = self.graph_input_index(name)?;
        self.ensure_running()?;
        let stream_id = self.plan.graph_inputs[index];

        self.begin_work();
        let mut touched = Vec::new();
        let result = {
            let mut inputs = self.graph_inputs.lock();
            let state = &mut inputs[index];
            let previous = state.bound;
            match f(state) {
                Ok(Some((packets, bound))) => self
                    .deliver(stream_id, &packets, previous, bound, &mut touched)
                    .inspect_err(|e| self.record_error(e.clone())),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        };
        self.schedule_all(touched);
        self.end_work();
        result
    }

    pub(crate) fn add_packet(self: &Arc<Self>, name: &str, packet: Packet) -> Result<()> {
        if packet.is_empty() {
            return Err(GraphError::InvalidState(format!(
                "cannot add an empty packet to input stream '{}'",
                name
            )));
        }
        let ts = packet.timestamp();
        if !ts.is_allowed_in_stream() {
            return Err(GraphError::InvalidTimestamp(format!(
                "{} is not allowed in input stream '{}'",
                ts, name
            )));
        }
        let index = self.graph_input_index(name)?;
        for consumer in &self.plan.stream(self.plan.graph_inputs[index]).consumers {
            self.plan.node(consumer.node).input_types[consumer.input.index()]
                .validate(&packet)
                .map_err(|e| e.with_context(format!("input stream '{}'", name)))?;
        }

        self.with_graph_input(name, |state| {
            if state.closed {
                return Err(GraphError::InvalidState(format!(
                    "input stream '{}' is closed",
                    name
                )));
            }
            if ts < state.bound {
                return Err(GraphError::TimestampOrder {
                    stream: name.to_string(),
                    timestamp: ts.to_string(),
                    bound: state.bound.to_string(),
                });
            }
            state.bound = next_bound_after(ts)?;
            Ok(Some((vec![packet], state.bound)))
        })
    }

    pub(crate) fn set_input_bound(self: &Arc<Self>, name: &str, bound: Timestamp) -> Result<()> {
        self.with_graph_input(name, |state| {
            if state.closed {
                return Err(GraphError::InvalidState(format!(
                    "input stream '{}' is closed",
                    name
                )));
            }
            if bound < state.bound {
                return Err(GraphError::TimestampOrder {
                    stream: name.to_string(),
                    timestamp: bound.to_string(),
                    bound: state.bound.to_string(),
                });
            }
            if bound == state.bound {
                return Ok(None);
            }
            state.bound = bound;
            state.closed = bound == Timestamp::DONE;
            Ok(Some((Vec::new(), bound)))
        })
    }

    pub(crate) fn close_input(self: &Arc<Self>, name: &str) -> Result<()> {
        self.with_graph_input(name, |state| {
            if state.closed {
                return Ok(None);
            }
            state.closed = true;
            state.bound = Timestamp::DONE;
            tracing::debug!(stream = name, "graph input closed");
            Ok(Some((Vec::new(), Timestamp::DONE)))
        })
    }

    pub(crate) fn close_all_inputs(self: &Arc<Self>) -> Result<()> {
        let names: Vec<String> = self
            .plan
            .graph_inputs
            .iter()
            .map(|&id| self.plan.stream(id).name.clone())
            .collect();
        for name in names {
            self.close_input(&name)?;
        }
        Ok(())
    }

    /// Close every graph input and end every source.
    pub(crate) fn close_all_packet_sources(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }
        self.begin_work();
        if let Err(e) = self.close_all_inputs() {
            tracing::warn!(error = %e, "failed to close graph inputs");
        }
        for spec in self.plan.nodes.iter().filter(|n| n.is_source()) {
            self.nodes[spec.id.index()].core.lock().source_done = true;
            self.schedule_ready(spec.id);
        }
        self.end_work();
    }

    // ── Idle handling ───────────────────────────────────────────────────────

    fn on_idle(self: &Arc<Self>) {
        let mut idle = self.idle.lock();
        if self.pending.load(Ordering::SeqCst) != 0 || self.is_finished() {
            return;
        }

        if self.has_error() {
            self.finish_with_error();
            return;
        }
        if self
            .plan
            .topo_order
            .iter()
            .all(|&id| self.node_state(id) == NodeState::Closed)
        {
            self.finish(Ok(()));
            return;
        }

        if !idle.started {
            idle.started = true;
            tracing::debug!("graph idle for the first time");
        }
        if self.activate_source_layers(&mut idle) {
            return;
        }

        let inputs_closed = self.graph_inputs.lock().iter().all(|s| s.closed);
        if inputs_closed && idle.next_layer >= self.plan.source_layers.len() {
            if self.release_back_edges() {
                return;
            }
            let stuck: Vec<&str> = self
                .plan
                .nodes
                .iter()
                .filter(|n| self.node_state(n.id) != NodeState::Closed)
                .map(|n| &*n.name)
                .collect();
            self.record_error(GraphError::Deadlock(format!(
                "every input is closed but these nodes cannot finish: {}",
                stuck.join(", ")
            )));
            self.finish_with_error();
            return;
        }

        let mut status = self.status.lock();
        if self.pending.load(Ordering::SeqCst) == 0 {
            status.idle = true;
            self.changed.notify_all();
        }
    }

    /// Start the next source layer once the previous one has closed.
    /// Returns whether any task was queued.
    fn activate_source_layers(self: &Arc<Self>, idle: &mut IdleState) -> bool {
        let layers = &self.plan.source_layers;
        while idle.next_layer < layers.len() {
            if idle.next_layer > 0 {
                let previous = layers[idle.next_layer - 1];
                let finished = self
                    .plan
                    .sources_in_layer(previous)
                    .all(|s| self.node_state(s.id) == NodeState::Closed);
                if !finished {
                    return false;
                }
            }

            let layer = layers[idle.next_layer];
            idle.next_layer += 1;
            tracing::debug!(layer, "activating source layer");
            let before = self.pushed.load(Ordering::SeqCst);
            for source in self.plan.sources_in_layer(layer) {
                self.nodes[source.id.index()].core.lock().source_active = true;
                self.schedule_ready(source.id);
            }
            if self.pushed.load(Ordering::SeqCst) != before {
                return true;
            }
        }
        false
    }

    /// Let open nodes whose forward inputs are done close without waiting for
    /// their back-edges. Returns whether any task was queued.
    fn release_back_edges(self: &Arc<Self>) -> bool {
        let before = self.pushed.load(Ordering::SeqCst);
        for &id in &self.plan.topo_order {
            let spec = self.plan.node(id);
            if spec.is_source() || !spec.back_edges.contains(&true) {
                continue;
            }
            {
                let mut core = self.nodes[id.index()].core.lock();
                if core.state != NodeState::Open
                    || core.in_flight > 0
                    || core.back_edges_released
                    || !core.forward_inputs_done()
                {
                    continue;
                }
                core.back_edges_released = true;
                if let Some(handler) = core.handler.as_mut() {
                    handler.release_back_edges();
                }
            }
            tracing::debug!(node = %spec.name, "closing node held open by back edges");
            self.schedule_ready(id);
        }
        self.pushed.load(Ordering::SeqCst) != before
    }

    /// Close every opened node, discarding its output, and end the run.
    fn finish_with_error(self: &Arc<Self>) {
        let env = self.env();
        for &id in &self.plan.topo_order {
            let spec = self.plan.node(id);
            let node = &self.nodes[id.index()];
            let (was_open, side_packets) = {
                let mut core = node.core.lock();
                let was_open = core.state == NodeState::Open;
                core.state = NodeState::Closed;
                (was_open, core.input_side_packets.clone())
            };
            if !was_open {
                continue;
            }
            let side_packets = side_packets.unwrap_or_else(|| {
                Arc::new(
                    self.side_packets
                        .view(&spec.input_side_packets, &spec.input_side_packet_types),
                )
            });
            let inputs = Inputs::empty(Arc::clone(&spec.inputs), Timestamp::DONE, true);
            let (_, result) = node.invoke(
                spec,
                TraceEventKind::Close,
                Timestamp::DONE,
                inputs,
                &side_packets,
                &env,
            );
            if let Err(e) = result {
                tracing::debug!(node = %spec.name, error = %e, "close failed after run error");
            }
        }

        let error = self
            .status
            .lock()
            .error
            .clone()
            .unwrap_or_else(|| GraphError::InvalidState("run failed".into()));
        self.finish(Err(error));
    }
}

#[cfg(test)]
impl GraphRun {
    /// Take away a node's input handler so it never becomes ready again.
    pub(crate) fn detach_handler(&self, id: NodeId) {
        self.nodes[id.index()].core.lock().handler = None;
    }
}

impl std::fmt::Debug for GraphRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRun")
            .field("nodes", &self.nodes.len())
            .field("queues", &self.queues.iter().map(|q| q.name()).collect::<Vec<_>>())
            .field("queued", &self.queues.iter().map(|q| q.len()).sum::<usize>())
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("has_error", &self.has_error())
            .finish()
    }
}
