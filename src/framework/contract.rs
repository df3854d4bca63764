//! Calculator contracts.
//!
//! Before a graph runs, every calculator fills a `CalculatorContract` for each
//! node that uses it: it declares the types of the ports the node was wired
//! with and may request scheduling behaviour. Returning an error rejects the
//! wiring.

use crate::config::InputStreamHandlerConfig;
use crate::error::{GraphError, Result};
use crate::framework::port::PortSet;
use crate::framework::tag_map::TagMap;
use crate::framework::timestamp::TimestampDiff;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Port declarations and scheduling requests for one node.
#[derive(Debug, Clone)]
pub struct CalculatorContract {
    node_name: String,
    inputs: PortSet,
    outputs: PortSet,
    input_side_packets: PortSet,
    output_side_packets: PortSet,
    options: serde_json::Value,
    input_stream_handler: Option<InputStreamHandlerConfig>,
    max_in_flight: Option<usize>,
    timestamp_offset: Option<TimestampDiff>,
    process_timestamp_bounds: bool,
}

impl CalculatorContract {
    pub fn new(
        node_name: impl Into<String>,
        inputs: Arc<TagMap>,
        outputs: Arc<TagMap>,
        input_side_packets: Arc<TagMap>,
        output_side_packets: Arc<TagMap>,
        options: serde_json::Value,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            inputs: PortSet::new(inputs),
            outputs: PortSet::new(outputs),
            input_side_packets: PortSet::new(input_side_packets),
            output_side_packets: PortSet::new(output_side_packets),
            options,
            input_stream_handler: None,
            max_in_flight: None,
            timestamp_offset: None,
            process_timestamp_bounds: false,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn inputs(&self) -> &PortSet {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut PortSet {
        &mut self.inputs
    }

    pub fn outputs(&self) -> &PortSet {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut PortSet {
        &mut self.outputs
    }

    pub fn input_side_packets(&self) -> &PortSet {
        &self.input_side_packets
    }

    pub fn input_side_packets_mut(&mut self) -> &mut PortSet {
        &mut self.input_side_packets
    }

    pub fn output_side_packets(&self) -> &PortSet {
        &self.output_side_packets
    }

    pub fn output_side_packets_mut(&mut self) -> &mut PortSet {
        &mut self.output_side_packets
    }

    /// Raw node options.
    pub fn raw_options(&self) -> &serde_json::Value {
        &self.options
    }

    /// Node options deserialized into `T`; missing options give `T::default()`.
    pub fn options<T: DeserializeOwned + Default>(&self) -> Result<T> {
        parse_options(&self.node_name, &self.options)
    }

    pub fn set_input_stream_handler(&mut self, handler: InputStreamHandlerConfig) {
        self.input_stream_handler = Some(handler);
    }

    pub fn input_stream_handler(&self) -> Option<&InputStreamHandlerConfig> {
        self.input_stream_handler.as_ref()
    }

    /// Allow up to `max` concurrent Process calls. Needs a shared calculator.
    pub fn set_max_in_flight(&mut self, max: usize) {
        self.max_in_flight = Some(max);
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        self.max_in_flight
    }

    /// Outputs trail the input timestamp by at most `offset`.
    pub fn set_timestamp_offset(&mut self, offset: TimestampDiff) {
        self.timestamp_offset = Some(offset);
    }

    pub fn timestamp_offset(&self) -> Option<TimestampDiff> {
        self.timestamp_offset
    }

    /// Also call Process for timestamps that settle without packets.
    pub fn set_process_timestamp_bounds(&mut self, enabled: bool) {
        self.process_timestamp_bounds = enabled;
    }

    pub fn process_timestamp_bounds(&self) -> bool {
        self.process_timestamp_bounds
    }
}

pub(crate) fn parse_options<T: DeserializeOwned + Default>(
    node: &str,
    options: &serde_json::Value,
) -> Result<T> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone()).map_err(|e| {
        GraphError::InvalidConfig(format!("invalid options for node '{}': {}", node, e))
    })
}
