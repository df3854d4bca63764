//! Bridges between side packets and streams.

use crate::error::{GraphError, Result};
use crate::framework::calculator::Calculator;
use crate::framework::context::CalculatorContext;
use crate::framework::contract::CalculatorContract;
use crate::framework::id::CollectionItemId;
use crate::framework::port::PacketType;
use crate::framework::timestamp::Timestamp;

const OUTPUT_TAGS: [&str; 4] = ["AT_PRESTREAM", "AT_POSTSTREAM", "AT_ZERO", "AT_TICK"];

/// Emits input side packet `i` on output `i` of a single output tag:
///
/// - `AT_PRESTREAM`, `AT_POSTSTREAM`, `AT_ZERO`: once, at that timestamp
/// - `AT_TICK`: at the timestamp of every packet on the `TICK` input
#[derive(Debug, Default)]
pub struct SidePacketToStreamCalculator;

impl SidePacketToStreamCalculator {
    fn output_tag(ctx: &mut CalculatorContext) -> Result<&'static str> {
        OUTPUT_TAGS
            .into_iter()
            .find(|tag| ctx.outputs().has_tag(tag))
            .ok_or_else(|| GraphError::InvalidConfig("no output tag".into()))
    }

    fn emit_all(ctx: &mut CalculatorContext, tag: &'static str, ts: Timestamp) -> Result<()> {
        let count = ctx.input_side_packets().len();
        for i in 0..count {
            let packet = ctx.input_side_packets().by_id(CollectionItemId(i as u32))?.at(ts);
            ctx.outputs().get(tag, i)?.add(packet)?;
        }
        Ok(())
    }
}

impl Calculator for SidePacketToStreamCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        cc.inputs().expect_tags(&["TICK"])?;
        cc.outputs().expect_tags(&OUTPUT_TAGS)?;
        let tags = cc.outputs().tag_map().tags();
        let [tag] = tags.as_slice() else {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}' needs exactly one output tag",
                cc.node_name()
            )));
        };
        let tag = tag.to_string();
        if cc.outputs().count(&tag) != cc.input_side_packets().len() {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}' needs one {} output per input side packet",
                cc.node_name(),
                tag
            )));
        }
        if (tag == "AT_TICK") != cc.inputs().has_tag("TICK") {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': a TICK input goes with AT_TICK and only AT_TICK",
                cc.node_name()
            )));
        }

        cc.inputs_mut().set_all(PacketType::Any);
        cc.input_side_packets_mut().set_all(PacketType::Any);
        for i in 0..cc.input_side_packets().len() {
            let side = CollectionItemId(i as u32);
            cc.outputs_mut()
                .set(&tag, i, PacketType::same_as_input_side_packet(side))?;
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let tag = Self::output_tag(ctx)?;
        let ts = match tag {
            "AT_TICK" => {
                if ctx.inputs().tag("TICK")?.is_empty() {
                    return Ok(());
                }
                let ts = ctx.input_timestamp();
                return Self::emit_all(ctx, tag, ts);
            }
            "AT_PRESTREAM" => Timestamp::PRE_STREAM,
            "AT_POSTSTREAM" => Timestamp::POST_STREAM,
            _ => Timestamp::new(0)?,
        };
        Self::emit_all(ctx, tag, ts)?;
        ctx.outputs().close_all();
        Err(GraphError::Stop)
    }
}

/// Turns the single packet of its input stream into an output side packet.
///
/// A second packet is an error; a stream that closes empty leaves the side
/// packet unset.
#[derive(Debug, Default)]
pub struct StreamToSidePacketCalculator;

impl Calculator for StreamToSidePacketCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        if cc.inputs().len() != 1 || cc.output_side_packets().len() != 1 {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}' needs one input stream and one output side packet",
                cc.node_name()
            )));
        }
        cc.inputs_mut().set_all(PacketType::Any);
        cc.output_side_packets_mut()
            .set_by_id(CollectionItemId(0), PacketType::same_as_input(CollectionItemId(0)));
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let packet = ctx.inputs().by_id(CollectionItemId(0)).packet().clone();
        if packet.is_empty() {
            return Ok(());
        }
        ctx.output_side_packets()
            .set_by_id(CollectionItemId(0), packet.at(Timestamp::UNSET))
    }
}
