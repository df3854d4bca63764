//! Timestamped, type-erased packets.
//!
//! A `Packet` shares its payload through an `Arc`: cloning a packet or
//! re-stamping it with [`Packet::at`] never copies the value, and the payload
//! is released with the last reference.

use crate::error::{GraphError, Result};
use crate::framework::timestamp::Timestamp;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Immutable payload plus exactly one timestamp.
#[derive(Clone)]
pub struct Packet {
    payload: Option<Arc<dyn Any + Send + Sync>>,
    type_id: Option<TypeId>,
    type_name: &'static str,
    timestamp: Timestamp,
}

impl Packet {
    /// Wrap a value. The timestamp starts out Unset.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            payload: Some(Arc::new(value)),
            type_id: Some(TypeId::of::<T>()),
            type_name: std::any::type_name::<T>(),
            timestamp: Timestamp::UNSET,
        }
    }

    /// A packet that carries only a timestamp.
    pub fn empty() -> Self {
        Self {
            payload: None,
            type_id: None,
            type_name: "<empty>",
            timestamp: Timestamp::UNSET,
        }
    }

    /// Same payload, new timestamp.
    pub fn at(&self, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    pub fn payload_type_id(&self) -> Option<TypeId> {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the payload is a `T`.
    pub fn holds<T: Any>(&self) -> bool {
        self.type_id == Some(TypeId::of::<T>())
    }

    /// Borrow the payload as a `T`.
    pub fn get<T: Any>(&self) -> Result<&T> {
        let payload = self.payload.as_ref().ok_or_else(|| GraphError::PacketType {
            expected: std::any::type_name::<T>().to_string(),
            actual: "<empty>".to_string(),
        })?;
        payload
            .downcast_ref::<T>()
            .ok_or_else(|| GraphError::PacketType {
                expected: std::any::type_name::<T>().to_string(),
                actual: self.type_name.to_string(),
            })
    }

    /// Whether both packets share the same payload allocation.
    pub fn ptr_eq(&self, other: &Packet) -> bool {
        match (&self.payload, &other.payload) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.type_name)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
