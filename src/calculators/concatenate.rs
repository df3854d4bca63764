//! ConcatenateVectorCalculator — joins the vectors arriving at one timestamp,
//! in input index order.
//!
//! Each input carries either a `Vec<T>` or a single `T`. With
//! `only_emit_if_all_present`, nothing is emitted unless every input has a
//! packet at the timestamp.

use crate::error::{GraphError, Result};
use crate::framework::calculator::SharedCalculator;
use crate::framework::context::CalculatorContext;
use crate::framework::contract::CalculatorContract;
use crate::framework::id::CollectionItemId;
use crate::framework::port::PacketType;
use crate::framework::timestamp::TimestampDiff;
use serde::Deserialize;
use std::any::Any;
use std::marker::PhantomData;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConcatenateOptions {
    pub only_emit_if_all_present: bool,
}

pub struct ConcatenateVectorCalculator<T> {
    _element: PhantomData<fn() -> T>,
}

impl<T> Default for ConcatenateVectorCalculator<T> {
    fn default() -> Self {
        Self {
            _element: PhantomData,
        }
    }
}

pub type ConcatenateI64VectorCalculator = ConcatenateVectorCalculator<i64>;
pub type ConcatenateF64VectorCalculator = ConcatenateVectorCalculator<f64>;
pub type ConcatenateStringVectorCalculator = ConcatenateVectorCalculator<String>;

impl<T> SharedCalculator for ConcatenateVectorCalculator<T>
where
    T: Any + Clone + Send + Sync,
{
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        if cc.inputs().is_empty() || cc.outputs().len() != 1 {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}' needs at least one input and exactly one output",
                cc.node_name()
            )));
        }
        cc.options::<ConcatenateOptions>()?;
        cc.inputs_mut().set_all(PacketType::Any);
        cc.outputs_mut().set_all(PacketType::of::<Vec<T>>());
        cc.set_timestamp_offset(TimestampDiff::new(0));
        Ok(())
    }

    fn process(&self, ctx: &mut CalculatorContext) -> Result<()> {
        let options: ConcatenateOptions = ctx.options()?;
        if options.only_emit_if_all_present
            && ctx.inputs().iter().any(|(_, shard)| shard.is_empty())
        {
            return Ok(());
        }

        let mut joined: Vec<T> = Vec::new();
        for (entry, shard) in ctx.inputs().iter() {
            let packet = shard.packet();
            if packet.is_empty() {
                continue;
            }
            if let Ok(items) = packet.get::<Vec<T>>() {
                joined.extend_from_slice(items);
            } else if let Ok(item) = packet.get::<T>() {
                joined.push(item.clone());
            } else {
                let error = GraphError::PacketType {
                    expected: format!("{} or a single element", std::any::type_name::<Vec<T>>()),
                    actual: packet.type_name().to_string(),
                };
                return Err(error.with_context(format!("input '{}'", entry.name)));
            }
        }

        let ts = ctx.input_timestamp();
        ctx.outputs().by_id(CollectionItemId(0)).add_value(joined, ts)
    }
}
