//! Graph configuration for calcgraph
//!
//! A graph is described declaratively: graph input/output streams, executors,
//! nodes and packet generators. Files are TOML or JSON, picked by extension.
//!
//! # Example
//!
//! ```toml
//! input_stream = ["in"]
//! output_stream = ["out"]
//! num_threads = 2
//!
//! [[node]]
//! calculator = "PassThroughCalculator"
//! input_stream = ["in"]
//! output_stream = ["out"]
//! ```
//!
//! Streams are written `name`, `TAG:name` or `TAG:index:name`. Node options are
//! free-form and deserialized by the calculator that owns them.

pub mod handler;

pub use handler::InputStreamHandlerConfig;

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete graph description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Streams fed through `add_packet_to_input_stream`.
    pub input_stream: Vec<String>,
    /// Streams the embedding application is expected to observe.
    pub output_stream: Vec<String>,
    /// Threads of the default executor. Defaults to the available parallelism.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<usize>,
    /// Additional named executors.
    pub executor: Vec<ExecutorConfig>,
    /// Handler for nodes that neither configure nor request one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_stream_handler: Option<InputStreamHandlerConfig>,
    pub node: Vec<NodeConfig>,
    pub packet_generator: Vec<PacketGeneratorConfig>,
}

/// One calculator instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node name. Defaults to the calculator name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub calculator: String,
    pub input_stream: Vec<String>,
    pub output_stream: Vec<String>,
    pub input_side_packet: Vec<String>,
    pub output_side_packet: Vec<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_stream_handler: Option<InputStreamHandlerConfig>,
    pub input_stream_info: Vec<InputStreamInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    pub source_layer: i32,
    /// Named executor to run on. Defaults to the shared pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
}

/// Per-input annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputStreamInfo {
    /// `TAG`, `TAG:index` or `:index` of the input.
    pub tag_index: String,
    pub back_edge: bool,
}

/// A packet generator producing side packets before the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketGeneratorConfig {
    pub packet_generator: String,
    pub input_side_packet: Vec<String>,
    pub output_side_packet: Vec<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

/// A named thread pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            calculator: String::new(),
            input_stream: Vec::new(),
            output_stream: Vec::new(),
            input_side_packet: Vec::new(),
            output_side_packet: Vec::new(),
            options: serde_json::Value::Null,
            input_stream_handler: None,
            input_stream_info: Vec::new(),
            max_in_flight: None,
            source_layer: 0,
            executor: None,
        }
    }
}

impl GraphConfig {
    /// Load a graph from a `.toml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GraphError::InvalidConfig(format!("Failed to read graph file {:?}: {}", path, e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(GraphError::InvalidConfig(format!(
                "Unsupported graph file extension {:?} for {:?}",
                other, path
            ))),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GraphError::Parse(format!("Failed to serialize graph: {}", e)))
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save the graph, choosing the format by extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => self.to_json_string()?,
            _ => self.to_toml_string()?,
        };
        std::fs::write(path, content).map_err(|e| {
            GraphError::InvalidConfig(format!("Failed to write graph file {:?}: {}", path, e))
        })
    }

    pub fn with_input_stream(mut self, stream: impl Into<String>) -> Self {
        self.input_stream.push(stream.into());
        self
    }

    pub fn with_output_stream(mut self, stream: impl Into<String>) -> Self {
        self.output_stream.push(stream.into());
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node.push(node);
        self
    }

    pub fn with_packet_generator(mut self, generator: PacketGeneratorConfig) -> Self {
        self.packet_generator.push(generator);
        self
    }

    pub fn with_executor(mut self, name: impl Into<String>, num_threads: usize) -> Self {
        self.executor.push(ExecutorConfig {
            name: name.into(),
            num_threads: Some(num_threads),
        });
        self
    }

    pub fn with_input_stream_handler(mut self, handler: InputStreamHandlerConfig) -> Self {
        self.input_stream_handler = Some(handler);
        self
    }
}

impl NodeConfig {
    pub fn new(calculator: impl Into<String>) -> Self {
        Self {
            calculator: calculator.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input(mut self, stream: impl Into<String>) -> Self {
        self.input_stream.push(stream.into());
        self
    }

    pub fn output(mut self, stream: impl Into<String>) -> Self {
        self.output_stream.push(stream.into());
        self
    }

    pub fn input_side_packet(mut self, name: impl Into<String>) -> Self {
        self.input_side_packet.push(name.into());
        self
    }

    pub fn output_side_packet(mut self, name: impl Into<String>) -> Self {
        self.output_side_packet.push(name.into());
        self
    }

    pub fn back_edge(mut self, tag_index: impl Into<String>) -> Self {
        self.input_stream_info.push(InputStreamInfo {
            tag_index: tag_index.into(),
            back_edge: true,
        });
        self
    }

    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn handler(mut self, handler: InputStreamHandlerConfig) -> Self {
        self.input_stream_handler = Some(handler);
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    pub fn source_layer(mut self, layer: i32) -> Self {
        self.source_layer = layer;
        self
    }

    pub fn executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }
}

impl PacketGeneratorConfig {
    pub fn new(generator: impl Into<String>) -> Self {
        Self {
            packet_generator: generator.into(),
            ..Default::default()
        }
    }

    pub fn input_side_packet(mut self, name: impl Into<String>) -> Self {
        self.input_side_packet.push(name.into());
        self
    }

    pub fn output_side_packet(mut self, name: impl Into<String>) -> Self {
        self.output_side_packet.push(name.into());
        self
    }

    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}
