//! PassThroughCalculator — forwards every input stream to the output stream
//! at the same index, and input side packets to output side packets.

use crate::error::{GraphError, Result};
use crate::framework::calculator::SharedCalculator;
use crate::framework::context::CalculatorContext;
use crate::framework::contract::CalculatorContract;
use crate::framework::port::PacketType;
use crate::framework::timestamp::TimestampDiff;

#[derive(Debug, Default)]
pub struct PassThroughCalculator;

impl SharedCalculator for PassThroughCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        if cc.inputs().len() != cc.outputs().len() {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': {} inputs but {} outputs",
                cc.node_name(),
                cc.inputs().len(),
                cc.outputs().len()
            )));
        }
        if cc.input_side_packets().len() != cc.output_side_packets().len() {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': side packet counts differ",
                cc.node_name()
            )));
        }

        cc.inputs_mut().set_all(PacketType::Any);
        let outputs: Vec<_> = cc.outputs().ids().collect();
        for id in outputs {
            cc.outputs_mut().set_by_id(id, PacketType::same_as_input(id));
        }
        cc.input_side_packets_mut().set_all(PacketType::Any);
        let side_outputs: Vec<_> = cc.output_side_packets().ids().collect();
        for id in side_outputs {
            cc.output_side_packets_mut()
                .set_by_id(id, PacketType::same_as_input_side_packet(id));
        }
        cc.set_timestamp_offset(TimestampDiff::new(0));
        Ok(())
    }

    fn open(&self, ctx: &mut CalculatorContext) -> Result<()> {
        let side_packets: Vec<_> = ctx
            .input_side_packets()
            .tag_map()
            .ids()
            .map(|id| ctx.input_side_packets().by_id(id).cloned().map(|p| (id, p)))
            .collect::<Result<_>>()?;
        for (id, packet) in side_packets {
            ctx.output_side_packets().set_by_id(id, packet)?;
        }
        Ok(())
    }

    fn process(&self, ctx: &mut CalculatorContext) -> Result<()> {
        let ids: Vec<_> = ctx.inputs().tag_map().ids().collect();
        for id in ids {
            let packet = ctx.inputs().by_id(id).packet().clone();
            if !packet.is_empty() {
                ctx.outputs().by_id(id).add(packet)?;
            }
        }
        Ok(())
    }
}
