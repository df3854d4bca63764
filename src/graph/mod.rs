//! Graph compilation and execution.
//!
//! A `GraphConfig` is compiled once into an immutable `CompiledPlan`. Each run
//! builds fresh node runtimes from the plan and drives them on executor
//! threads:
//!
//! ```text
//! GraphConfig ──► GraphCompiler ──► CompiledPlan ──► GraphRun
//!                                                    ├── NodeRuntime (one per node)
//!                                                    ├── SchedulerQueue ──► Executor
//!                                                    └── observers / pollers
//! ```
//!
//! - **Ordered propagation**: a node's task results are released in task order
//!   even when several tasks of the node run at once.
//! - **Idle-driven lifecycle**: sources start, loops close and deadlocks are
//!   detected only when no task is queued or running.

pub mod calculator_graph;
pub mod compiled_plan;
pub mod compiler;
pub mod executor;
pub mod node;
pub mod observer;
pub(crate) mod run;
pub(crate) mod scheduler;
pub(crate) mod side_packet;

pub use calculator_graph::{CalculatorGraph, DEFAULT_EXECUTOR};
pub use compiled_plan::{
    CompiledPlan, GeneratorSpec, NodeSpec, PlanStats, SidePacketProducer, SidePacketSpec,
    StreamConsumer, StreamProducer, StreamSpec,
};
pub use compiler::GraphCompiler;
pub use executor::{Executor, Job, ThreadPoolExecutor};
pub use node::NodeState;
pub use observer::{OutputStreamPoller, PacketCallback};
