//! FlowLimiterCalculator — throttles frames entering a slow part of a graph.
//!
//! ```text
//!  in ──►┌─────────────┐ out ──► [slow nodes] ──┐
//!        │ FlowLimiter │                        │
//!        └─────────────┘◄── FINISHED ◄──────────┘ (back edge)
//! ```
//!
//! At most `max_in_flight` frames are let through until a FINISHED packet
//! reports that one of them left the throttled section. Up to `max_in_queue`
//! frames wait for a free slot; older frames are dropped beyond that. A dropped
//! frame still advances the output bound, and the optional ALLOW output
//! reports `true` or `false` for every frame at its timestamp.

use crate::config::InputStreamHandlerConfig;
use crate::error::{GraphError, Result};
use crate::framework::calculator::Calculator;
use crate::framework::context::CalculatorContext;
use crate::framework::contract::CalculatorContract;
use crate::framework::packet::Packet;
use crate::framework::port::PacketType;
use crate::framework::timestamp::Timestamp;
use serde::Deserialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowLimiterOptions {
    pub max_in_flight: usize,
    pub max_in_queue: usize,
}

impl Default for FlowLimiterOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            max_in_queue: 0,
        }
    }
}

#[derive(Debug)]
struct Frame {
    timestamp: Timestamp,
    packets: Vec<Packet>,
}

#[derive(Debug)]
pub struct FlowLimiterCalculator {
    options: FlowLimiterOptions,
    in_flight: usize,
    queue: VecDeque<Frame>,
    /// Latest settled timestamp across the data inputs
    data_settled: Timestamp,
    passed: u64,
    dropped: u64,
}

impl Default for FlowLimiterCalculator {
    fn default() -> Self {
        Self {
            options: FlowLimiterOptions::default(),
            in_flight: 0,
            queue: VecDeque::new(),
            data_settled: Timestamp::UNSET,
            passed: 0,
            dropped: 0,
        }
    }
}

impl FlowLimiterCalculator {
    fn allow(ctx: &mut CalculatorContext, allowed: bool, ts: Timestamp) -> Result<()> {
        if ctx.outputs().has_tag("ALLOW") {
            ctx.outputs().tag("ALLOW")?.add_value(allowed, ts)?;
        }
        Ok(())
    }

    fn pass(&mut self, ctx: &mut CalculatorContext, frame: Frame) -> Result<()> {
        for (i, packet) in frame.packets.into_iter().enumerate() {
            if !packet.is_empty() {
                ctx.outputs().get("", i)?.add(packet)?;
            }
        }
        Self::allow(ctx, true, frame.timestamp)?;
        self.in_flight += 1;
        self.passed += 1;
        Ok(())
    }

    fn drop_frame(&mut self, ctx: &mut CalculatorContext, frame: Frame) -> Result<()> {
        let bound = frame.timestamp.next_allowed_in_stream()?;
        for i in 0..frame.packets.len() {
            ctx.outputs().get("", i)?.set_next_timestamp_bound(bound);
        }
        Self::allow(ctx, false, frame.timestamp)?;
        self.dropped += 1;
        tracing::trace!(node = ctx.node_name(), timestamp = %frame.timestamp, "frame dropped");
        Ok(())
    }
}

impl Calculator for FlowLimiterCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        cc.inputs().expect_tags(&["", "FINISHED"])?;
        cc.outputs().expect_tags(&["", "ALLOW"])?;
        let data = cc.inputs().count("");
        if data == 0 || data != cc.outputs().count("") || !cc.inputs().has_tag("FINISHED") {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}' needs data inputs, a FINISHED input and one output per data input",
                cc.node_name()
            )));
        }
        let options: FlowLimiterOptions = cc.options()?;
        if options.max_in_flight == 0 {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': max_in_flight must be at least 1",
                cc.node_name()
            )));
        }

        cc.inputs_mut().set_all(PacketType::Any);
        for i in 0..data {
            let input = cc.inputs().id("", i);
            if let Some(input) = input {
                cc.outputs_mut().set("", i, PacketType::same_as_input(input))?;
            }
        }
        if cc.outputs().has_tag("ALLOW") {
            cc.outputs_mut().set_tag("ALLOW", PacketType::of::<bool>())?;
        }
        cc.set_input_stream_handler(InputStreamHandlerConfig::Immediate);
        cc.set_process_timestamp_bounds(true);
        Ok(())
    }

    fn open(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        self.options = ctx.options()?;
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let ts = ctx.input_timestamp();
        if !ctx.inputs().tag("FINISHED")?.is_empty() {
            self.in_flight = self.in_flight.saturating_sub(1);
        }

        let data_count = ctx.inputs().tag_map().count("");
        let mut packets = Vec::with_capacity(data_count);
        for i in 0..data_count {
            let shard = ctx.inputs().get("", i)?;
            if shard.timestamp().is_range_value() {
                self.data_settled = self.data_settled.max(shard.timestamp());
            }
            packets.push(shard.packet().clone());
        }
        if packets.iter().any(|p| !p.is_empty()) {
            self.queue.push_back(Frame {
                timestamp: ts,
                packets,
            });
        }

        while self.in_flight < self.options.max_in_flight {
            let Some(frame) = self.queue.pop_front() else {
                break;
            };
            self.pass(ctx, frame)?;
        }
        while self.queue.len() > self.options.max_in_queue {
            let Some(frame) = self.queue.pop_front() else {
                break;
            };
            self.drop_frame(ctx, frame)?;
        }

        if self.queue.is_empty() && self.data_settled.is_range_value() {
            let bound = self.data_settled.next_allowed_in_stream()?;
            for i in 0..data_count {
                ctx.outputs().get("", i)?.set_next_timestamp_bound(bound);
            }
        }
        Ok(())
    }

    fn close(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        tracing::debug!(
            node = ctx.node_name(),
            passed = self.passed,
            dropped = self.dropped + self.queue.len() as u64,
            "flow limiter closed"
        );
        Ok(())
    }
}
