//! The public graph object.
//!
//! A `CalculatorGraph` is initialized once from a `GraphConfig` and can then
//! run any number of times. Observers and pollers registered between
//! `initialize` and `start_run` stay attached for every later run.

use super::compiled_plan::{CompiledPlan, SidePacketProducer};
use super::compiler::GraphCompiler;
use super::executor::{Executor, ThreadPoolExecutor};
use super::node::NodeState;
use super::observer::{poller_observer, OutputStreamPoller, PollerMessage, StreamObserver};
use super::run::{GraphRun, RunSetup};
use super::scheduler::SchedulerQueue;
use super::side_packet::run_generators;
use crate::config::GraphConfig;
use crate::error::{GraphError, Result};
use crate::framework::calculator::CalculatorRegistry;
use crate::framework::clock::{Clock, SystemClock};
use crate::framework::id::StreamId;
use crate::framework::packet::Packet;
use crate::framework::profiler::ProfilerSink;
use crate::framework::timestamp::Timestamp;
use crossbeam_channel::Sender;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Name of the executor that runs nodes without an `executor` setting.
pub const DEFAULT_EXECUTOR: &str = "default";

pub struct CalculatorGraph {
    registry: CalculatorRegistry,
    clock: Arc<dyn Clock>,
    profiler: Option<Arc<dyn ProfilerSink>>,

    /// Installed through `set_executor`
    custom_executors: HashMap<String, Arc<dyn Executor>>,
    /// Everything nodes may run on, built by `initialize`
    executors: HashMap<String, Arc<dyn Executor>>,

    plan: Option<Arc<CompiledPlan>>,
    /// Base side packets plus what the generators made from them alone
    side_packets: HashMap<String, Packet>,
    generators_done: Vec<bool>,

    observers: Vec<(StreamId, StreamObserver)>,
    pollers: Vec<Sender<PollerMessage>>,
    run: Option<Arc<GraphRun>>,
}

impl CalculatorGraph {
    /// Graph using the built-in calculators and wall time.
    pub fn new() -> Self {
        Self::with_registry(CalculatorRegistry::with_builtins())
    }

    pub fn with_registry(registry: CalculatorRegistry) -> Self {
        Self {
            registry,
            clock: Arc::new(SystemClock),
            profiler: None,
            custom_executors: HashMap::new(),
            executors: HashMap::new(),
            plan: None,
            side_packets: HashMap::new(),
            generators_done: Vec::new(),
            observers: Vec::new(),
            pollers: Vec::new(),
            run: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_profiler(mut self, profiler: Arc<dyn ProfilerSink>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn registry_mut(&mut self) -> &mut CalculatorRegistry {
        &mut self.registry
    }

    pub fn plan(&self) -> Option<&CompiledPlan> {
        self.plan.as_deref()
    }

    /// Install an executor before `initialize`. Naming it `"default"`
    /// replaces the default pool.
    pub fn set_executor(&mut self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Result<()> {
        if self.plan.is_some() {
            return Err(GraphError::InvalidState(
                "executors must be set before initialize".into(),
            ));
        }
        let name = name.into();
        if self.custom_executors.contains_key(&name) {
            return Err(GraphError::InvalidState(format!(
                "executor '{}' is already set",
                name
            )));
        }
        self.custom_executors.insert(name, executor);
        Ok(())
    }

    /// Validate `config`, build executors and resolve what side packets can
    /// be resolved without per-run extras.
    pub fn initialize(&mut self, config: GraphConfig, side_packets: HashMap<String, Packet>) -> Result<()> {
        if self.plan.is_some() {
            return Err(GraphError::InvalidState("graph is already initialized".into()));
        }

        let extra: HashSet<String> = self.custom_executors.keys().cloned().collect();
        let plan = GraphCompiler::compile(&config, &self.registry, &extra)?;

        for (name, packet) in &side_packets {
            if let Some(spec) = plan.side_packets.get(name) {
                if spec.producer != SidePacketProducer::External {
                    return Err(GraphError::SidePacketAlreadySet(name.clone()));
                }
                spec.validate(packet)?;
            }
        }

        let mut available = side_packets;
        let mut done = vec![false; plan.generators.len()];
        run_generators(&plan, &mut available, &mut done, false)?;

        self.executors = self.build_executors(&plan)?;
        tracing::info!(
            nodes = plan.stats.total_nodes,
            streams = plan.stats.streams,
            executors = self.executors.len(),
            "graph initialized"
        );
        self.side_packets = available;
        self.generators_done = done;
        self.plan = Some(Arc::new(plan));
        Ok(())
    }

    fn build_executors(&self, plan: &CompiledPlan) -> Result<HashMap<String, Arc<dyn Executor>>> {
        let mut executors = self.custom_executors.clone();
        if !executors.contains_key(DEFAULT_EXECUTOR) {
            let threads = plan.num_threads.unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, |n| n.get())
            });
            let pool = ThreadPoolExecutor::new("calcgraph", threads, Arc::clone(&self.clock))?;
            executors.insert(DEFAULT_EXECUTOR.to_string(), Arc::new(pool));
        }
        for config in &plan.executors {
            if executors.contains_key(&config.name) {
                continue;
            }
            let threads = config.num_threads.unwrap_or(1);
            let pool = ThreadPoolExecutor::new(config.name.clone(), threads, Arc::clone(&self.clock))?;
            executors.insert(config.name.clone(), Arc::new(pool));
        }
        Ok(executors)
    }

    fn initialized_plan(&self) -> Result<&Arc<CompiledPlan>> {
        self.plan
            .as_ref()
            .ok_or_else(|| GraphError::InvalidState("graph is not initialized".into()))
    }

    fn stream_id(&self, name: &str) -> Result<StreamId> {
        self.initialized_plan()?
            .stream_by_name
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::NotFound(format!("stream '{}'", name)))
    }

    fn ensure_not_running(&self) -> Result<()> {
        match &self.run {
            Some(run) if !run.is_finished() => Err(GraphError::InvalidState(
                "a graph run is in progress".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Call `callback` for every packet on `stream`, in timestamp order.
    pub fn observe_output_stream<F>(&mut self, stream: &str, callback: F, observe_bounds: bool) -> Result<()>
    where
        F: Fn(&Packet) -> Result<()> + Send + Sync + 'static,
    {
        self.ensure_not_running()?;
        let id = self.stream_id(stream)?;
        self.observers.push((
            id,
            StreamObserver {
                callback: Arc::new(callback),
                observe_bounds,
            },
        ));
        Ok(())
    }

    pub fn add_output_stream_poller(&mut self, stream: &str) -> Result<OutputStreamPoller> {
        self.ensure_not_running()?;
        let id = self.stream_id(stream)?;
        let (poller, sender) = OutputStreamPoller::new(stream);
        self.observers.push((id, poller_observer(sender.clone())));
        self.pollers.push(sender);
        Ok(poller)
    }

    /// Begin a run with `extra_side_packets` on top of the base ones.
    pub fn start_run(&mut self, extra_side_packets: HashMap<String, Packet>) -> Result<()> {
        let plan = Arc::clone(self.initialized_plan()?);
        self.ensure_not_running()?;

        let mut available = self.side_packets.clone();
        for (name, packet) in extra_side_packets {
            if available.contains_key(&name) {
                return Err(GraphError::SidePacketAlreadySet(name));
            }
            if let Some(spec) = plan.side_packets.get(&name) {
                if spec.producer != SidePacketProducer::External {
                    return Err(GraphError::SidePacketAlreadySet(name));
                }
                spec.validate(&packet)?;
            }
            available.insert(name, packet);
        }

        let mut done = self.generators_done.clone();
        run_generators(&plan, &mut available, &mut done, true)?;
        for spec in plan.side_packets.values() {
            match available.get(&spec.name) {
                Some(packet) => spec.validate(packet)?,
                None if spec.producer == SidePacketProducer::External
                    && !spec.consumer_nodes.is_empty() =>
                {
                    return Err(GraphError::MissingSidePacket(format!(
                        "'{}' is needed by a node but was not supplied",
                        spec.name
                    )));
                }
                None => {}
            }
        }

        let run = GraphRun::new(self.run_setup(&plan, available)?)?;
        self.run = Some(Arc::clone(&run));
        run.start();
        Ok(())
    }

    fn run_setup(&self, plan: &Arc<CompiledPlan>, side_packets: HashMap<String, Packet>) -> Result<RunSetup> {
        let default = self
            .executors
            .get(DEFAULT_EXECUTOR)
            .ok_or_else(|| GraphError::InvalidState("default executor is missing".into()))?;
        let mut queues = vec![SchedulerQueue::new(DEFAULT_EXECUTOR, Arc::clone(default))];
        let mut queue_by_name: HashMap<&str, usize> = HashMap::from([(DEFAULT_EXECUTOR, 0)]);

        let mut node_queue = Vec::with_capacity(plan.nodes.len());
        for node in &plan.nodes {
            let name = node.executor.as_deref().unwrap_or(DEFAULT_EXECUTOR);
            let index = match queue_by_name.get(name) {
                Some(&index) => index,
                None => {
                    let executor = self.executors.get(name).ok_or_else(|| {
                        GraphError::NotFound(format!("executor '{}'", name))
                    })?;
                    queues.push(SchedulerQueue::new(name, Arc::clone(executor)));
                    queue_by_name.insert(name, queues.len() - 1);
                    queues.len() - 1
                }
            };
            node_queue.push(index);
        }

        let mut observers = vec![Vec::new(); plan.streams.len()];
        for (stream, observer) in &self.observers {
            observers[stream.index()].push(observer.clone());
        }

        Ok(RunSetup {
            plan: Arc::clone(plan),
            queues,
            node_queue,
            observers,
            pollers: self.pollers.clone(),
            side_packets,
            clock: Arc::clone(&self.clock),
            profiler: self.profiler.clone(),
        })
    }

    fn active_run(&self) -> Result<&Arc<GraphRun>> {
        self.run
            .as_ref()
            .ok_or_else(|| GraphError::InvalidState("no graph run has been started".into()))
    }

    pub fn add_packet_to_input_stream(&self, stream: &str, packet: Packet) -> Result<()> {
        self.active_run()?.add_packet(stream, packet)
    }

    /// Promise that no packet below `bound` will arrive on `stream`.
    pub fn set_input_stream_timestamp_bound(&self, stream: &str, bound: Timestamp) -> Result<()> {
        self.active_run()?.set_input_bound(stream, bound)
    }

    pub fn close_input_stream(&self, stream: &str) -> Result<()> {
        self.active_run()?.close_input(stream)
    }

    pub fn close_all_input_streams(&self) -> Result<()> {
        self.active_run()?.close_all_inputs()
    }

    /// Close every graph input and stop every source node.
    pub fn close_all_packet_sources(&self) -> Result<()> {
        self.active_run()?.close_all_packet_sources();
        Ok(())
    }

    /// Block until no task is queued or running.
    pub fn wait_until_idle(&self) -> Result<()> {
        self.active_run()?.wait_until_idle()
    }

    /// Block until every node has closed or the run failed.
    pub fn wait_until_done(&self) -> Result<()> {
        self.active_run()?.wait_until_done()
    }

    /// Start a run and wait for it. Graphs fed through input streams must use
    /// `start_run` instead.
    pub fn run(&mut self, extra_side_packets: HashMap<String, Packet>) -> Result<()> {
        if !self.initialized_plan()?.graph_inputs.is_empty() {
            return Err(GraphError::InvalidState(
                "graph has input streams; use start_run and close them".into(),
            ));
        }
        self.start_run(extra_side_packets)?;
        self.wait_until_done()
    }

    pub fn has_error(&self) -> bool {
        self.run.as_ref().is_some_and(|run| run.has_error())
    }

    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.is_finished())
    }

    /// State of `node` in the current or last run.
    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        let spec = self.plan.as_ref()?.node_by_name(node)?;
        self.run.as_ref().map(|run| run.node_state(spec.id))
    }

    /// A side packet of the current or last run, or a base packet before the
    /// first run.
    pub fn get_output_side_packet(&self, name: &str) -> Result<Packet> {
        let found = match &self.run {
            Some(run) => run.side_packet(name),
            None => self.side_packets.get(name).cloned(),
        };
        if let Some(packet) = found {
            return Ok(packet);
        }
        match &self.plan {
            Some(plan) if plan.side_packets.contains_key(name) => {
                Err(GraphError::SidePacketUnavailable(name.to_string()))
            }
            _ => Err(GraphError::NotFound(format!("side packet '{}'", name))),
        }
    }
}

impl Default for CalculatorGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CalculatorGraph {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            if !run.is_finished() {
                tracing::warn!("graph dropped during a run; closing sources");
                run.close_all_packet_sources();
                if let Err(e) = run.wait_until_done() {
                    tracing::debug!(error = %e, "run ended with an error while dropping the graph");
                }
            }
        }
    }
}

impl std::fmt::Debug for CalculatorGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculatorGraph")
            .field("initialized", &self.plan.is_some())
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .field("observers", &self.observers.len())
            .field("run", &self.run)
            .finish()
    }
}
