//! CountingSourceCalculator — a source emitting `initial_value`,
//! `initial_value + increment`, ... at timestamps 0, 1, 2, ...
//!
//! Options: `max_count` packets in total (overridden by a `MAX_COUNT` side
//! packet), `batch_size` packets per Process call, and `error_count` to fail
//! after that many Process calls.

use crate::error::{GraphError, Result};
use crate::framework::calculator::Calculator;
use crate::framework::context::CalculatorContext;
use crate::framework::contract::CalculatorContract;
use crate::framework::id::CollectionItemId;
use crate::framework::port::PacketType;
use crate::framework::timestamp::Timestamp;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CountingSourceOptions {
    pub max_count: i64,
    pub batch_size: i64,
    pub initial_value: i64,
    pub increment: i64,
    pub error_count: Option<u64>,
}

impl Default for CountingSourceOptions {
    fn default() -> Self {
        Self {
            max_count: 10,
            batch_size: 1,
            initial_value: 0,
            increment: 1,
            error_count: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct CountingSourceCalculator {
    options: CountingSourceOptions,
    emitted: i64,
    calls: u64,
}

impl Calculator for CountingSourceCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        if !cc.inputs().is_empty() || cc.outputs().len() != 1 {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}' takes no inputs and has one output",
                cc.node_name()
            )));
        }
        cc.input_side_packets().expect_tags(&["MAX_COUNT"])?;
        let options: CountingSourceOptions = cc.options()?;
        if options.batch_size < 1 {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}': batch_size must be positive",
                cc.node_name()
            )));
        }
        cc.outputs_mut().set_all(PacketType::of::<i64>());
        cc.input_side_packets_mut().set_all(PacketType::of::<i64>());
        Ok(())
    }

    fn open(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        self.options = ctx.options()?;
        if ctx.input_side_packets().has_tag("MAX_COUNT") {
            self.options.max_count = *ctx.input_side_packets().tag("MAX_COUNT")?.get::<i64>()?;
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        self.calls += 1;
        if self.options.error_count.is_some_and(|n| self.calls > n) {
            return Err(GraphError::failed(format!(
                "configured to fail after {} calls",
                self.calls - 1
            )));
        }

        for _ in 0..self.options.batch_size {
            if self.emitted >= self.options.max_count {
                return Err(GraphError::Stop);
            }
            let value = self.options.initial_value + self.emitted * self.options.increment;
            let ts = Timestamp::new(self.emitted)?;
            ctx.outputs()
                .by_id(CollectionItemId(0))
                .add_value(value, ts)?;
            self.emitted += 1;
        }
        if self.emitted >= self.options.max_count {
            return Err(GraphError::Stop);
        }
        Ok(())
    }
}
