//! Scheduling trace events.
//!
//! The graph reports the start and finish of every Open, Process and Close
//! call to an optional `ProfilerSink`. Persisting traces is left to the sink.

use crate::framework::timestamp::Timestamp;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    Open,
    Process,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePhase {
    Start,
    Finish,
}

/// One calculator callback boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub node: Arc<str>,
    pub kind: TraceEventKind,
    pub phase: TracePhase,
    pub input_timestamp: Timestamp,
    pub at: DateTime<Utc>,
}

/// Receives trace events from executor threads.
#[cfg_attr(test, mockall::automock)]
pub trait ProfilerSink: Send + Sync {
    fn record(&self, event: &TraceEvent);
}

/// Forwards trace events to `tracing` at TRACE level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProfiler;

impl ProfilerSink for TracingProfiler {
    fn record(&self, event: &TraceEvent) {
        tracing::trace!(
            node = %event.node,
            kind = ?event.kind,
            phase = ?event.phase,
            input_timestamp = %event.input_timestamp,
            at = %event.at,
            "calculator event"
        );
    }
}
