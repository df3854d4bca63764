//! Test calculators and graph builders

use calcgraph::framework::{CollectionItemId, TimestampDiff};
use calcgraph::{
    Calculator, CalculatorContext, CalculatorContract, CalculatorGraph, CalculatorRegistry,
    GraphConfig, GraphError, NodeConfig, PacketType, Result, SharedCalculator,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Sums the i64 inputs present at a timestamp.
#[derive(Debug, Default)]
pub struct AdderCalculator;

impl Calculator for AdderCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        cc.inputs_mut().set_all(PacketType::of::<i64>());
        cc.outputs_mut().set_all(PacketType::of::<i64>());
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let mut sum = 0;
        let mut any = false;
        for (_, shard) in ctx.inputs().iter() {
            if !shard.is_empty() {
                sum += *shard.get::<i64>()?;
                any = true;
            }
        }
        if any {
            let ts = ctx.input_timestamp();
            ctx.outputs().by_id(CollectionItemId(0)).add_value(sum, ts)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TriggerOptions {
    /// Timestamp at which the calculator reacts
    pub at: i64,
}

/// Passes packets through and fails at `options.at`.
#[derive(Debug, Default)]
pub struct FailingCalculator;

impl Calculator for FailingCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        cc.options::<TriggerOptions>()?;
        cc.inputs_mut().set_all(PacketType::Any);
        cc.outputs_mut()
            .set_all(PacketType::same_as_input(CollectionItemId(0)));
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let options: TriggerOptions = ctx.options()?;
        if ctx.input_timestamp().value() >= options.at {
            return Err(GraphError::failed("boom"));
        }
        let packet = ctx.inputs().by_id(CollectionItemId(0)).packet().clone();
        ctx.outputs().by_id(CollectionItemId(0)).add(packet)
    }
}

/// Passes packets through and requests a graceful stop at `options.at`.
#[derive(Debug, Default)]
pub struct StoppingCalculator;

impl Calculator for StoppingCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        cc.options::<TriggerOptions>()?;
        cc.inputs_mut().set_all(PacketType::Any);
        cc.outputs_mut()
            .set_all(PacketType::same_as_input(CollectionItemId(0)));
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let options: TriggerOptions = ctx.options()?;
        let packet = ctx.inputs().by_id(CollectionItemId(0)).packet().clone();
        ctx.outputs().by_id(CollectionItemId(0)).add(packet)?;
        if ctx.input_timestamp().value() >= options.at {
            return Err(GraphError::Stop);
        }
        Ok(())
    }
}

/// Shared pass-through that sleeps longer for earlier timestamps, so that
/// concurrent tasks finish out of order.
#[derive(Debug, Default)]
pub struct SlowPassThroughCalculator;

impl SharedCalculator for SlowPassThroughCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        cc.inputs_mut().set_all(PacketType::of::<i64>());
        cc.outputs_mut().set_all(PacketType::of::<i64>());
        cc.set_timestamp_offset(TimestampDiff::new(0));
        Ok(())
    }

    fn process(&self, ctx: &mut CalculatorContext) -> Result<()> {
        let delay = 8 - ctx.input_timestamp().value().rem_euclid(4) * 2;
        std::thread::sleep(Duration::from_millis(delay as u64));
        let packet = ctx.inputs().by_id(CollectionItemId(0)).packet().clone();
        ctx.outputs().by_id(CollectionItemId(0)).add(packet)
    }
}

/// Builtins plus the test calculators above
pub fn test_registry() -> CalculatorRegistry {
    let mut registry = CalculatorRegistry::with_builtins();
    registry
        .register::<AdderCalculator>("AdderCalculator")
        .register::<FailingCalculator>("FailingCalculator")
        .register::<StoppingCalculator>("StoppingCalculator")
        .register_shared::<SlowPassThroughCalculator>("SlowPassThroughCalculator");
    registry
}

/// A graph initialized from `config` with the test registry
pub fn graph_for(config: GraphConfig) -> CalculatorGraph {
    let mut graph = CalculatorGraph::with_registry(test_registry());
    graph.initialize(config, HashMap::new()).unwrap();
    graph
}

/// `in` → PassThroughCalculator → `out`
pub fn pass_through_config() -> GraphConfig {
    GraphConfig::default()
        .with_input_stream("in")
        .with_output_stream("out")
        .with_node(
            NodeConfig::new("PassThroughCalculator")
                .named("pass")
                .input("in")
                .output("out"),
        )
}

/// CountingSourceCalculator emitting `count` packets on `out`
pub fn counting_config(count: i64) -> GraphConfig {
    GraphConfig::default().with_node(
        NodeConfig::new("CountingSourceCalculator")
            .named("source")
            .output("out")
            .options(serde_json::json!({ "max_count": count })),
    )
}
