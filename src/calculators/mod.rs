//! Built-in calculators and packet generators.
//!
//! [`register_builtins`] adds all of them to a registry under their type
//! names; [`CalculatorRegistry::with_builtins`] does this for you.
//!
//! [`CalculatorRegistry::with_builtins`]: crate::framework::CalculatorRegistry::with_builtins

mod concatenate;
mod constant_generator;
mod counting_source;
mod flow_limiter;
mod pass_through;
mod previous_loopback;
mod side_packet;

pub use concatenate::{
    ConcatenateF64VectorCalculator, ConcatenateI64VectorCalculator, ConcatenateOptions,
    ConcatenateStringVectorCalculator, ConcatenateVectorCalculator,
};
pub use constant_generator::{constant_packet, ConstantOptions, ConstantSidePacketGenerator};
pub use counting_source::{CountingSourceCalculator, CountingSourceOptions};
pub use flow_limiter::{FlowLimiterCalculator, FlowLimiterOptions};
pub use pass_through::PassThroughCalculator;
pub use previous_loopback::PreviousLoopbackCalculator;
pub use side_packet::{SidePacketToStreamCalculator, StreamToSidePacketCalculator};

use crate::framework::calculator::CalculatorRegistry;

pub fn register_builtins(registry: &mut CalculatorRegistry) {
    registry
        .register_shared::<PassThroughCalculator>("PassThroughCalculator")
        .register_shared::<ConcatenateI64VectorCalculator>("ConcatenateI64VectorCalculator")
        .register_shared::<ConcatenateF64VectorCalculator>("ConcatenateF64VectorCalculator")
        .register_shared::<ConcatenateStringVectorCalculator>("ConcatenateStringVectorCalculator")
        .register::<PreviousLoopbackCalculator>("PreviousLoopbackCalculator")
        .register::<FlowLimiterCalculator>("FlowLimiterCalculator")
        .register::<SidePacketToStreamCalculator>("SidePacketToStreamCalculator")
        .register::<StreamToSidePacketCalculator>("StreamToSidePacketCalculator")
        .register::<CountingSourceCalculator>("CountingSourceCalculator")
        .register_generator::<ConstantSidePacketGenerator>("ConstantSidePacketGenerator");
}
