//! Building blocks shared by the compiler, the scheduler and calculators.
//!
//! - `timestamp`, `packet`: the values that flow through streams
//! - `tag_map`, `port`, `contract`: how a node names and types its ports
//! - `calculator`, `context`: what node implementations see
//! - `handler`: input readiness policies
//! - `clock`, `profiler`: services injected into a graph

pub mod calculator;
pub mod clock;
pub mod context;
pub mod contract;
pub mod handler;
pub mod id;
pub mod packet;
pub mod port;
pub mod profiler;
pub mod tag_map;
pub mod timestamp;

pub use calculator::{
    Calculator, CalculatorEntry, CalculatorInstance, CalculatorRegistry, GeneratorEntry,
    PacketGenerator, SharedCalculator,
};
pub use clock::{Clock, SimulationClock, SystemClock};
pub use context::{
    CalculatorContext, InputStreamShard, Inputs, OutputStreamShard, Outputs, SidePacketSet,
};
pub use contract::CalculatorContract;
pub use handler::{InputQueue, InputSet, InputStreamHandler, Readiness};
pub use id::{CollectionItemId, NodeId, StreamId};
pub use packet::Packet;
pub use port::{PacketType, PortSet, ResolvedType};
pub use profiler::{ProfilerSink, TraceEvent, TraceEventKind, TracePhase, TracingProfiler};
pub use tag_map::{TagEntry, TagMap};
pub use timestamp::{Timestamp, TimestampDiff};
