//! Per-invocation view handed to calculators.
//!
//! A `CalculatorContext` is built for each Open, Process and Close call. It
//! owns the input set of the call and buffers everything the calculator
//! emits; the scheduler validates and propagates the buffered output after the
//! call returns.

use crate::error::{GraphError, Result};
use crate::framework::clock::Clock;
use crate::framework::contract::parse_options;
use crate::framework::id::CollectionItemId;
use crate::framework::packet::Packet;
use crate::framework::port::ResolvedType;
use crate::framework::tag_map::{TagEntry, TagMap};
use crate::framework::timestamp::Timestamp;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::sync::Arc;

// ── Inputs ──────────────────────────────────────────────────────────────────

/// One input stream's entry in the current input set.
///
/// Streams without a packet at the input timestamp hold an empty packet
/// stamped with the stream's settled timestamp.
#[derive(Debug, Clone)]
pub struct InputStreamShard {
    packet: Packet,
    done: bool,
}

impl InputStreamShard {
    pub(crate) fn new(packet: Packet, done: bool) -> Self {
        Self { packet, done }
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// No packet will ever arrive on this stream again.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn timestamp(&self) -> Timestamp {
        self.packet.timestamp()
    }

    pub fn get<T: Any>(&self) -> Result<&T> {
        self.packet.get::<T>()
    }
}

/// Input streams of the current call, addressed by tag and index.
#[derive(Debug, Clone)]
pub struct Inputs {
    tag_map: Arc<TagMap>,
    shards: Vec<InputStreamShard>,
}

impl Inputs {
    pub(crate) fn new(tag_map: Arc<TagMap>, shards: Vec<InputStreamShard>) -> Self {
        Self { tag_map, shards }
    }

    /// An input view where every stream is empty at `timestamp`.
    pub(crate) fn empty(tag_map: Arc<TagMap>, timestamp: Timestamp, done: bool) -> Self {
        let shards = (0..tag_map.len())
            .map(|_| InputStreamShard::new(Packet::empty().at(timestamp), done))
            .collect();
        Self { tag_map, shards }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn tag_map(&self) -> &TagMap {
        &self.tag_map
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag_map.has_tag(tag)
    }

    pub fn get(&self, tag: &str, index: usize) -> Result<&InputStreamShard> {
        let id = self
            .tag_map
            .id(tag, index)
            .ok_or_else(|| GraphError::NotFound(format!("input stream {}:{}", tag, index)))?;
        Ok(&self.shards[id.index()])
    }

    pub fn tag(&self, tag: &str) -> Result<&InputStreamShard> {
        self.get(tag, 0)
    }

    pub fn by_id(&self, id: CollectionItemId) -> &InputStreamShard {
        &self.shards[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TagEntry, &InputStreamShard)> {
        self.tag_map.entries().iter().zip(self.shards.iter())
    }
}

// ── Outputs ─────────────────────────────────────────────────────────────────

/// Buffered output of one stream during a call.
#[derive(Debug, Clone)]
pub struct OutputStreamShard {
    name: String,
    packet_type: ResolvedType,
    packets: Vec<Packet>,
    next_bound: Option<Timestamp>,
    closed: bool,
}

impl OutputStreamShard {
    pub(crate) fn new(name: impl Into<String>, packet_type: ResolvedType, closed: bool) -> Self {
        Self {
            name: name.into(),
            packet_type,
            packets: Vec::new(),
            next_bound: None,
            closed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emit a packet. Its timestamp must be allowed in a stream and later
    /// than anything emitted before it in this call.
    pub fn add(&mut self, packet: Packet) -> Result<()> {
        if self.closed {
            return Err(GraphError::InvalidState(format!(
                "output stream '{}' is closed",
                self.name
            )));
        }
        if packet.is_empty() {
            return Err(GraphError::InvalidState(format!(
                "cannot add an empty packet to output stream '{}'",
                self.name
            )));
        }
        let ts = packet.timestamp();
        if !ts.is_allowed_in_stream() {
            return Err(GraphError::InvalidTimestamp(format!(
                "{} is not allowed in stream '{}'",
                ts, self.name
            )));
        }
        if let Some(last) = self.packets.last() {
            let min = if last.timestamp() == Timestamp::POST_STREAM {
                Timestamp::ONE_OVER_POST_STREAM
            } else {
                last.timestamp().next_allowed_in_stream()?
            };
            if ts < min {
                return Err(GraphError::TimestampOrder {
                    stream: self.name.clone(),
                    timestamp: ts.to_string(),
                    bound: min.to_string(),
                });
            }
        }
        self.packet_type.validate(&packet)?;
        self.packets.push(packet);
        Ok(())
    }

    /// Emit `value` at `timestamp`.
    pub fn add_value<T: Any + Send + Sync>(&mut self, value: T, timestamp: Timestamp) -> Result<()> {
        self.add(Packet::new(value).at(timestamp))
    }

    /// Promise that nothing earlier than `bound` will be emitted.
    /// Bounds only move forward; a smaller bound is ignored.
    pub fn set_next_timestamp_bound(&mut self, bound: Timestamp) {
        self.next_bound = Some(self.next_bound.map_or(bound, |b| b.max(bound)));
    }

    /// Close the stream; its bound becomes Done.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn into_parts(self) -> (Vec<Packet>, Option<Timestamp>, bool) {
        (self.packets, self.next_bound, self.closed)
    }
}

/// Output streams of the current call.
#[derive(Debug, Clone)]
pub struct Outputs {
    tag_map: Arc<TagMap>,
    shards: Vec<OutputStreamShard>,
}

impl Outputs {
    pub(crate) fn new(tag_map: Arc<TagMap>, shards: Vec<OutputStreamShard>) -> Self {
        Self { tag_map, shards }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn tag_map(&self) -> &TagMap {
        &self.tag_map
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag_map.has_tag(tag)
    }

    pub fn get(&mut self, tag: &str, index: usize) -> Result<&mut OutputStreamShard> {
        let id = self
            .tag_map
            .id(tag, index)
            .ok_or_else(|| GraphError::NotFound(format!("output stream {}:{}", tag, index)))?;
        Ok(&mut self.shards[id.index()])
    }

    pub fn tag(&mut self, tag: &str) -> Result<&mut OutputStreamShard> {
        self.get(tag, 0)
    }

    pub fn by_id(&mut self, id: CollectionItemId) -> &mut OutputStreamShard {
        &mut self.shards[id.index()]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutputStreamShard> {
        self.shards.iter_mut()
    }

    /// Close every output stream.
    pub fn close_all(&mut self) {
        for shard in &mut self.shards {
            shard.close();
        }
    }

    pub(crate) fn into_shards(self) -> Vec<OutputStreamShard> {
        self.shards
    }
}

// ── Side packets ────────────────────────────────────────────────────────────

/// Side packets of a node, addressed by tag and index.
#[derive(Debug, Clone)]
pub struct SidePacketSet {
    tag_map: Arc<TagMap>,
    types: Vec<ResolvedType>,
    packets: Vec<Option<Packet>>,
    fresh: Vec<bool>,
}

impl SidePacketSet {
    pub(crate) fn new(tag_map: Arc<TagMap>, types: Vec<ResolvedType>) -> Self {
        let len = tag_map.len();
        Self {
            tag_map,
            types,
            packets: vec![None; len],
            fresh: vec![false; len],
        }
    }

    pub(crate) fn with_packets(
        tag_map: Arc<TagMap>,
        types: Vec<ResolvedType>,
        packets: Vec<Option<Packet>>,
    ) -> Self {
        let len = tag_map.len();
        Self {
            tag_map,
            types,
            packets,
            fresh: vec![false; len],
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn tag_map(&self) -> &TagMap {
        &self.tag_map
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag_map.has_tag(tag)
    }

    fn id(&self, tag: &str, index: usize) -> Result<CollectionItemId> {
        self.tag_map
            .id(tag, index)
            .ok_or_else(|| GraphError::NotFound(format!("side packet {}:{}", tag, index)))
    }

    pub fn get(&self, tag: &str, index: usize) -> Result<&Packet> {
        let id = self.id(tag, index)?;
        self.by_id(id)
    }

    pub fn tag(&self, tag: &str) -> Result<&Packet> {
        self.get(tag, 0)
    }

    fn check_id(&self, id: CollectionItemId) -> Result<usize> {
        if id.index() < self.packets.len() {
            Ok(id.index())
        } else {
            Err(GraphError::NotFound(format!("side packet #{}", id.index())))
        }
    }

    pub fn by_id(&self, id: CollectionItemId) -> Result<&Packet> {
        let index = self.check_id(id)?;
        self.packets[index].as_ref().ok_or_else(|| {
            GraphError::SidePacketUnavailable(self.tag_map.entry(id).name.clone())
        })
    }

    /// Whether the side packet is set; unknown ids are never set.
    pub fn is_set(&self, id: CollectionItemId) -> bool {
        self.packets.get(id.index()).is_some_and(Option::is_some)
    }

    /// Set a side packet. Each side packet is set at most once, without a timestamp.
    pub fn set(&mut self, tag: &str, index: usize, packet: Packet) -> Result<()> {
        let id = self.id(tag, index)?;
        self.set_by_id(id, packet)
    }

    pub fn set_tag(&mut self, tag: &str, packet: Packet) -> Result<()> {
        self.set(tag, 0, packet)
    }

    pub fn set_by_id(&mut self, id: CollectionItemId, packet: Packet) -> Result<()> {
        let index = self.check_id(id)?;
        let name = &self.tag_map.entry(id).name;
        if self.packets[index].is_some() {
            return Err(GraphError::SidePacketAlreadySet(name.clone()));
        }
        if packet.timestamp() != Timestamp::UNSET {
            return Err(GraphError::InvalidTimestamp(format!(
                "side packet '{}' must not carry a timestamp (got {})",
                name,
                packet.timestamp()
            )));
        }
        if packet.is_empty() {
            return Err(GraphError::InvalidState(format!(
                "side packet '{}' cannot be empty",
                name
            )));
        }
        self.types[index].validate(&packet)?;
        self.packets[index] = Some(packet);
        self.fresh[index] = true;
        Ok(())
    }

    /// Packets set since the set was built, with their names.
    pub(crate) fn take_fresh(&mut self) -> Vec<(String, Packet)> {
        let mut out = Vec::new();
        for (i, fresh) in self.fresh.iter_mut().enumerate() {
            if *fresh {
                *fresh = false;
                if let Some(packet) = &self.packets[i] {
                    out.push((self.tag_map.entries()[i].name.clone(), packet.clone()));
                }
            }
        }
        out
    }
}

// ── Context ─────────────────────────────────────────────────────────────────

/// Everything a calculator sees during one callback.
pub struct CalculatorContext<'a> {
    node_name: &'a str,
    input_timestamp: Timestamp,
    inputs: Inputs,
    outputs: Outputs,
    input_side_packets: &'a SidePacketSet,
    output_side_packets: SidePacketSet,
    options: &'a serde_json::Value,
    clock: &'a Arc<dyn Clock>,
}

impl<'a> CalculatorContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_name: &'a str,
        input_timestamp: Timestamp,
        inputs: Inputs,
        outputs: Outputs,
        input_side_packets: &'a SidePacketSet,
        output_side_packets: SidePacketSet,
        options: &'a serde_json::Value,
        clock: &'a Arc<dyn Clock>,
    ) -> Self {
        Self {
            node_name,
            input_timestamp,
            inputs,
            outputs,
            input_side_packets,
            output_side_packets,
            options,
            clock,
        }
    }

    pub fn node_name(&self) -> &str {
        self.node_name
    }

    /// Timestamp of the current input set. Unstarted during Open, Done during Close.
    pub fn input_timestamp(&self) -> Timestamp {
        self.input_timestamp
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn outputs(&mut self) -> &mut Outputs {
        &mut self.outputs
    }

    pub fn input_side_packets(&self) -> &SidePacketSet {
        self.input_side_packets
    }

    pub fn output_side_packets(&mut self) -> &mut SidePacketSet {
        &mut self.output_side_packets
    }

    pub fn options<T: DeserializeOwned + Default>(&self) -> Result<T> {
        parse_options(self.node_name, self.options)
    }

    pub fn raw_options(&self) -> &serde_json::Value {
        self.options
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.clock
    }

    pub(crate) fn into_parts(self) -> (Outputs, SidePacketSet) {
        (self.outputs, self.output_side_packets)
    }
}
