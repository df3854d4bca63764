//! ConstantSidePacketGenerator — side packets from literal option values.
//!
//! `options.values[i]` becomes output side packet `i`. Integers become `i64`,
//! other numbers `f64`, strings `String`, booleans `bool`; arrays and objects
//! stay `serde_json::Value`. Input side packets are accepted and only order
//! the generator after their producers.

use crate::error::{GraphError, Result};
use crate::framework::calculator::PacketGenerator;
use crate::framework::context::SidePacketSet;
use crate::framework::contract::CalculatorContract;
use crate::framework::id::CollectionItemId;
use crate::framework::packet::Packet;
use crate::framework::port::PacketType;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConstantOptions {
    pub values: Vec<serde_json::Value>,
}

/// Convert one literal to the packet it stands for.
pub fn constant_packet(value: &serde_json::Value) -> Packet {
    match value {
        serde_json::Value::Bool(b) => Packet::new(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Packet::new(i),
            None => Packet::new(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Packet::new(s.clone()),
        other => Packet::new(other.clone()),
    }
}

#[derive(Debug, Default)]
pub struct ConstantSidePacketGenerator;

impl PacketGenerator for ConstantSidePacketGenerator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        let options: ConstantOptions = cc.options()?;
        if options.values.len() != cc.output_side_packets().len() {
            return Err(GraphError::InvalidConfig(format!(
                "'{}' has {} values for {} output side packets",
                cc.node_name(),
                options.values.len(),
                cc.output_side_packets().len()
            )));
        }
        cc.input_side_packets_mut().set_all(PacketType::Any);
        cc.output_side_packets_mut().set_all(PacketType::Any);
        Ok(())
    }

    fn generate(
        options: &serde_json::Value,
        _inputs: &SidePacketSet,
        outputs: &mut SidePacketSet,
    ) -> Result<()> {
        let options: ConstantOptions = if options.is_null() {
            ConstantOptions::default()
        } else {
            serde_json::from_value(options.clone())?
        };
        for (i, value) in options.values.iter().enumerate() {
            outputs.set_by_id(CollectionItemId(i as u32), constant_packet(value))?;
        }
        Ok(())
    }
}
