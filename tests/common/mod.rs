//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use calcgraph::{CalculatorGraph, Packet, Timestamp};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Range timestamp shorthand
pub fn ts(value: i64) -> Timestamp {
    Timestamp::new(value).unwrap()
}

/// i64 packet at `at`
pub fn int_at(value: i64, at: i64) -> Packet {
    Packet::new(value).at(ts(at))
}

/// Record every packet observed on `stream`.
pub fn collect(graph: &mut CalculatorGraph, stream: &str) -> Arc<Mutex<Vec<Packet>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    graph
        .observe_output_stream(
            stream,
            move |packet| {
                sink.lock().push(packet.clone());
                Ok(())
            },
            false,
        )
        .unwrap();
    seen
}

/// `(timestamp, value)` pairs of i64 packets
pub fn int_values(packets: &[Packet]) -> Vec<(i64, i64)> {
    packets
        .iter()
        .map(|p| (p.timestamp().value(), *p.get::<i64>().unwrap()))
        .collect()
}

pub fn timestamps(packets: &[Packet]) -> Vec<i64> {
    packets.iter().map(|p| p.timestamp().value()).collect()
}
