//! Input stream handlers.
//!
//! A handler owns the readiness policy of one node: given the node's input
//! queues it decides whether the node can run, which packets form the next
//! input set(s), and when the node is ready to close.
//!
//! Streams are grouped into sync sets. Within a set, forward streams gate
//! readiness and back-edge streams only contribute their queued packets; a set
//! made only of back-edges is gated by them. A set is done once every one of
//! its streams is empty with a Done bound.
//!
//! Built-in handlers use enum dispatch so the hot path avoids a vtable.

mod default;
mod early_close;
mod fixed_size;
mod sync_set;

pub use default::DefaultHandler;
pub use early_close::EarlyCloseHandler;
pub use fixed_size::FixedSizeHandler;
pub use sync_set::SyncSetHandler;

use crate::config::InputStreamHandlerConfig;
use crate::error::Result;
use crate::framework::context::InputStreamShard;
use crate::framework::packet::Packet;
use crate::framework::tag_map::TagMap;
use crate::framework::timestamp::{settled_timestamp, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;

// ── Queues ──────────────────────────────────────────────────────────────────

/// Consumer-side queue of one input stream.
#[derive(Debug, Clone)]
pub struct InputQueue {
    packets: VecDeque<Packet>,
    bound: Timestamp,
    back_edge: bool,
}

impl InputQueue {
    pub fn new(back_edge: bool) -> Self {
        Self {
            packets: VecDeque::new(),
            bound: Timestamp::PRE_STREAM,
            back_edge,
        }
    }

    pub fn is_back_edge(&self) -> bool {
        self.back_edge
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn head_timestamp(&self) -> Option<Timestamp> {
        self.packets.front().map(Packet::timestamp)
    }

    /// Timestamp of the `i`-th queued packet.
    pub fn timestamp_at(&self, i: usize) -> Option<Timestamp> {
        self.packets.get(i).map(Packet::timestamp)
    }

    /// Lowest timestamp a packet may still arrive with.
    pub fn bound(&self) -> Timestamp {
        self.bound
    }

    /// Head timestamp if a packet is queued, otherwise the bound.
    pub fn frontier(&self) -> Timestamp {
        self.head_timestamp().unwrap_or(self.bound)
    }

    pub fn is_done(&self) -> bool {
        self.packets.is_empty() && self.bound == Timestamp::DONE
    }

    /// Enqueue a packet already validated by its producer.
    pub(crate) fn push(&mut self, packet: Packet) {
        let ts = packet.timestamp();
        let next = if ts == Timestamp::POST_STREAM {
            Timestamp::ONE_OVER_POST_STREAM
        } else {
            ts.next_allowed_in_stream().unwrap_or(Timestamp::DONE)
        };
        self.bound = self.bound.max(next);
        self.packets.push_back(packet);
    }

    pub(crate) fn set_bound(&mut self, bound: Timestamp) {
        if bound > self.bound {
            self.bound = bound;
        }
    }

    /// Discard packets with a timestamp before `cut`.
    pub(crate) fn drop_before(&mut self, cut: Timestamp) -> usize {
        let mut dropped = 0;
        while self.head_timestamp().is_some_and(|ts| ts < cut) {
            self.packets.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Discard packets with a timestamp at or before `last`.
    pub(crate) fn drop_through(&mut self, last: Timestamp) -> usize {
        let mut dropped = 0;
        while self.head_timestamp().is_some_and(|ts| ts <= last) {
            self.packets.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Pop the packet at `ts` if it heads the queue, otherwise an empty
    /// packet at the stream's settled timestamp.
    fn take_shard(&mut self, ts: Timestamp) -> InputStreamShard {
        if self.head_timestamp() == Some(ts) {
            if let Some(packet) = self.packets.pop_front() {
                return InputStreamShard::new(packet, self.is_done());
            }
        }
        self.empty_shard()
    }

    fn empty_shard(&self) -> InputStreamShard {
        let settled = settled_timestamp(self.frontier());
        InputStreamShard::new(Packet::empty().at(settled), self.is_done())
    }
}

/// Earliest timestamp any queue may still deliver.
///
/// A node with a timestamp offset can promise `bound + offset` downstream.
pub fn settled_input_bound(queues: &[InputQueue]) -> Timestamp {
    queues
        .iter()
        .map(InputQueue::frontier)
        .min()
        .unwrap_or(Timestamp::DONE)
}

/// Build an input set at `ts`: streams selected by `take` yield their packet
/// at `ts`, the rest an empty packet at their settled timestamp.
pub(crate) fn fill_input_set(
    queues: &mut [InputQueue],
    ts: Timestamp,
    take: impl Fn(usize) -> bool,
) -> InputSet {
    let shards = queues
        .iter_mut()
        .enumerate()
        .map(|(i, q)| if take(i) { q.take_shard(ts) } else { q.empty_shard() })
        .collect();
    InputSet {
        timestamp: ts,
        shards,
    }
}

// ── Readiness ───────────────────────────────────────────────────────────────

/// Inputs of one Process call.
#[derive(Debug, Clone)]
pub struct InputSet {
    pub timestamp: Timestamp,
    pub shards: Vec<InputStreamShard>,
}

#[derive(Debug)]
pub enum Readiness {
    NotReady,
    /// Input sets to hand to one task, in timestamp order.
    Ready(Vec<InputSet>),
    ReadyForClose,
}

/// Outcome of polling one sync set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetPoll {
    NotReady,
    Ready(Timestamp),
    Done,
}

/// A group of streams whose packets are synchronized by timestamp.
#[derive(Debug, Clone)]
pub(crate) struct SyncSet {
    streams: Vec<usize>,
    gating: Vec<usize>,
    last_processed: Timestamp,
}

impl SyncSet {
    pub(crate) fn new(streams: Vec<usize>, back_edges: &[bool]) -> Self {
        let forward: Vec<usize> = streams.iter().copied().filter(|&i| !back_edges[i]).collect();
        let gating = if forward.is_empty() {
            streams.clone()
        } else {
            forward
        };
        Self {
            streams,
            gating,
            last_processed: Timestamp::UNSTARTED,
        }
    }

    pub(crate) fn streams(&self) -> &[usize] {
        &self.streams
    }

    pub(crate) fn gating(&self) -> &[usize] {
        &self.gating
    }

    pub(crate) fn mark_processed(&mut self, ts: Timestamp) {
        self.last_processed = ts;
    }

    fn is_done(&self, queues: &[InputQueue], ignore_back_edges: bool) -> bool {
        self.streams
            .iter()
            .filter(|&&i| !(ignore_back_edges && queues[i].is_back_edge()))
            .all(|&i| queues[i].is_done())
    }

    /// Whether a forward stream of this set is done.
    pub(crate) fn any_forward_done(&self, queues: &[InputQueue]) -> bool {
        self.streams
            .iter()
            .any(|&i| !queues[i].is_back_edge() && queues[i].is_done())
    }

    fn drop_stale_back_edges(&self, node: &str, queues: &mut [InputQueue]) {
        for &i in &self.streams {
            if !queues[i].is_back_edge() {
                continue;
            }
            let dropped = queues[i].drop_through(self.last_processed);
            if dropped > 0 {
                tracing::warn!(
                    node,
                    stream = i,
                    dropped,
                    last_processed = %self.last_processed,
                    "dropped back-edge packets at already processed timestamps"
                );
            }
        }
    }

    pub(crate) fn poll(
        &mut self,
        node: &str,
        queues: &mut [InputQueue],
        process_bounds: bool,
        ignore_back_edges: bool,
    ) -> SetPoll {
        self.drop_stale_back_edges(node, queues);

        if self.is_done(queues, ignore_back_edges) {
            if process_bounds && self.last_processed < Timestamp::ONE_OVER_POST_STREAM {
                return SetPoll::Ready(Timestamp::ONE_OVER_POST_STREAM);
            }
            return SetPoll::Done;
        }

        let min_packet = self
            .streams
            .iter()
            .filter_map(|&i| queues[i].head_timestamp())
            .min();
        let min_bound = self
            .gating
            .iter()
            .filter(|&&i| queues[i].is_empty())
            .map(|&i| queues[i].bound())
            .min()
            .unwrap_or(Timestamp::DONE);

        if let Some(ts) = min_packet {
            if ts < min_bound {
                return SetPoll::Ready(ts);
            }
        }
        if process_bounds {
            let candidate = settled_timestamp(min_bound);
            if candidate.is_allowed_in_stream() && candidate > self.last_processed {
                return SetPoll::Ready(candidate);
            }
        }
        SetPoll::NotReady
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────────

/// Readiness policy of one node, rebuilt for every run.
#[derive(Debug)]
pub enum InputStreamHandler {
    Default(DefaultHandler),
    Immediate(SyncSetHandler),
    SyncSet(SyncSetHandler),
    FixedSize(FixedSizeHandler),
    EarlyClose(EarlyCloseHandler),
}

impl InputStreamHandler {
    /// Build the handler described by `config` for a node with inputs `tag_map`.
    pub fn create(
        config: &InputStreamHandlerConfig,
        node: &str,
        tag_map: &TagMap,
        back_edges: &[bool],
        process_bounds: bool,
    ) -> Result<Self> {
        let node: Arc<str> = Arc::from(node);
        let handler = match config {
            InputStreamHandlerConfig::Default { batch_size } => InputStreamHandler::Default(
                DefaultHandler::new(node, back_edges, process_bounds, *batch_size)?,
            ),
            InputStreamHandlerConfig::Immediate => InputStreamHandler::Immediate(
                SyncSetHandler::immediate(node, back_edges, process_bounds),
            ),
            InputStreamHandlerConfig::SyncSet { sync_sets } => InputStreamHandler::SyncSet(
                SyncSetHandler::new(node, tag_map, sync_sets, back_edges, process_bounds)?,
            ),
            InputStreamHandlerConfig::FixedSize {
                trigger_queue_size,
                target_queue_size,
                fixed_min_size,
            } => InputStreamHandler::FixedSize(FixedSizeHandler::new(
                node,
                back_edges,
                process_bounds,
                *trigger_queue_size,
                *target_queue_size,
                *fixed_min_size,
            )?),
            InputStreamHandlerConfig::EarlyClose => InputStreamHandler::EarlyClose(
                EarlyCloseHandler::new(node, back_edges, process_bounds),
            ),
        };
        Ok(handler)
    }

    pub fn name(&self) -> &'static str {
        match self {
            InputStreamHandler::Default(_) => "Default",
            InputStreamHandler::Immediate(_) => "Immediate",
            InputStreamHandler::SyncSet(_) => "SyncSet",
            InputStreamHandler::FixedSize(_) => "FixedSize",
            InputStreamHandler::EarlyClose(_) => "EarlyClose",
        }
    }

    pub fn readiness(&mut self, queues: &mut [InputQueue]) -> Readiness {
        match self {
            InputStreamHandler::Default(h) => h.readiness(queues),
            InputStreamHandler::Immediate(h) => h.readiness(queues),
            InputStreamHandler::SyncSet(h) => h.readiness(queues),
            InputStreamHandler::FixedSize(h) => h.readiness(queues),
            InputStreamHandler::EarlyClose(h) => h.readiness(queues),
        }
    }

    /// Input sets are held back waiting for a full batch.
    pub fn has_buffered(&self) -> bool {
        match self {
            InputStreamHandler::Default(h) => h.has_buffered(),
            InputStreamHandler::FixedSize(h) => h.has_buffered(),
            InputStreamHandler::EarlyClose(h) => h.has_buffered(),
            InputStreamHandler::Immediate(_) | InputStreamHandler::SyncSet(_) => false,
        }
    }

    /// Stop waiting for back-edge streams before closing.
    ///
    /// Used once the graph is idle and only back-edges keep a node open.
    pub fn release_back_edges(&mut self) {
        match self {
            InputStreamHandler::Default(h) => h.release_back_edges(),
            InputStreamHandler::Immediate(h) => h.release_back_edges(),
            InputStreamHandler::SyncSet(h) => h.release_back_edges(),
            InputStreamHandler::FixedSize(h) => h.release_back_edges(),
            InputStreamHandler::EarlyClose(h) => h.release_back_edges(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn ts(v: i64) -> Timestamp {
        Timestamp::new(v).unwrap()
    }

    pub fn push(queue: &mut InputQueue, v: i64) {
        queue.push(Packet::new(v).at(ts(v)));
    }

    pub fn ready_timestamps(readiness: &Readiness) -> Vec<Timestamp> {
        match readiness {
            Readiness::Ready(sets) => sets.iter().map(|s| s.timestamp).collect(),
            _ => Vec::new(),
        }
    }
}
