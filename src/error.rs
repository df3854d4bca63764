//! Error handling for calcgraph
//!
//! This module defines the error type shared by graph validation, side-packet
//! resolution, the scheduler and calculators, plus a Result alias.
//!
//! `GraphError` is `Clone` because the outcome of a run is handed to every
//! caller of `wait_until_done`.

use std::sync::Arc;
use thiserror::Error;

/// Main error type for calcgraph operations
#[derive(Error, Debug, Clone)]
pub enum GraphError {
    /// Malformed graph wiring or node configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A node names a calculator or packet generator that is not registered
    #[error("Unknown calculator: {0}")]
    UnknownCalculator(String),

    /// Connected ports declare incompatible packet types
    #[error("Type mismatch on {port}: {message}")]
    TypeMismatch { port: String, message: String },

    /// The graph has a cycle that is not broken by a back edge
    #[error("Cycle detected among nodes not connected by back edges: {0}")]
    Cycle(String),

    /// A lower source layer depends on a higher one
    #[error("Source layer inversion: {lower} (layer {lower_layer}) depends on {higher} (layer {higher_layer})")]
    SourceLayerInversion {
        lower: String,
        lower_layer: i32,
        higher: String,
        higher_layer: i32,
    },

    /// A required side packet was never provided
    #[error("Missing side packet: {0}")]
    MissingSidePacket(String),

    /// A side packet was set more than once
    #[error("Side packet already set: {0}")]
    SidePacketAlreadySet(String),

    /// A known side packet has not been resolved yet
    #[error("Side packet not yet available: {0}")]
    SidePacketUnavailable(String),

    /// Lookup of an unknown stream, side packet or executor
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timestamp misuse (special value arithmetic, sentinel construction)
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A packet or bound would move a stream backwards
    #[error("Timestamp {timestamp} on stream '{stream}' is not allowed: next allowed timestamp is {bound}")]
    TimestampOrder {
        stream: String,
        timestamp: String,
        bound: String,
    },

    /// Packet payload does not have the requested type
    #[error("Packet type error: expected {expected}, got {actual}")]
    PacketType { expected: String, actual: String },

    /// An error raised by a calculator callback
    #[error("Calculator '{node}' failed: {source}")]
    Calculator {
        node: String,
        #[source]
        source: Box<GraphError>,
    },

    /// Calculator-level business error
    #[error("{0}")]
    Failed(String),

    /// Graceful stop signalled by a calculator; never surfaces as a run failure
    #[error("Graceful stop requested")]
    Stop,

    /// The scheduler cannot make progress
    #[error("Graph deadlock: {0}")]
    Deadlock(String),

    /// API call not valid in the current graph state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration file could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<GraphError>,
    },
}

impl GraphError {
    /// Create a calculator-level failure
    pub fn failed(message: impl Into<String>) -> Self {
        GraphError::Failed(message.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        GraphError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Attribute an error to a node
    pub fn in_node(self, node: impl Into<String>) -> Self {
        GraphError::Calculator {
            node: node.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error is the graceful-stop signal
    pub fn is_stop(&self) -> bool {
        matches!(self, GraphError::Stop)
    }

    /// The innermost error, skipping context and node attribution
    pub fn root(&self) -> &GraphError {
        match self {
            GraphError::Calculator { source, .. } | GraphError::WithContext { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        GraphError::Io(Arc::new(err))
    }
}

impl From<toml::de::Error> for GraphError {
    fn from(err: toml::de::Error) -> Self {
        GraphError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Parse(err.to_string())
    }
}

/// Result type alias for calcgraph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
