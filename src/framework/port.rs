//! Port type declarations.
//!
//! A calculator contract fills one `PortSet` per collection (input streams,
//! output streams, input and output side packets). The compiler resolves
//! `SameAs` links inside a node, carries stream types from producers into
//! `Any` inputs, and then checks every edge.

use crate::error::{GraphError, Result};
use crate::framework::id::CollectionItemId;
use crate::framework::packet::Packet;
use crate::framework::tag_map::TagMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Which collection of a node a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSide {
    Input,
    Output,
    InputSidePacket,
    OutputSidePacket,
}

/// A port of the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub side: PortSide,
    pub id: CollectionItemId,
}

/// Declared type of a port.
#[derive(Clone, PartialEq, Eq)]
pub enum PacketType {
    /// Not yet declared by the contract.
    Unset,
    /// Accepts any payload.
    Any,
    Exact { id: TypeId, name: &'static str },
    /// Whatever the referenced port resolves to.
    SameAs(PortRef),
}

impl PacketType {
    pub fn of<T: Any + Send + Sync>() -> Self {
        PacketType::Exact {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn same_as_input(id: CollectionItemId) -> Self {
        PacketType::SameAs(PortRef {
            side: PortSide::Input,
            id,
        })
    }

    pub fn same_as_input_side_packet(id: CollectionItemId) -> Self {
        PacketType::SameAs(PortRef {
            side: PortSide::InputSidePacket,
            id,
        })
    }
}

impl fmt::Debug for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Unset => write!(f, "Unset"),
            PacketType::Any => write!(f, "Any"),
            PacketType::Exact { name, .. } => write!(f, "{}", name),
            PacketType::SameAs(port) => write!(f, "SameAs({:?} {:?})", port.side, port.id),
        }
    }
}

/// A port type after `SameAs` resolution.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ResolvedType {
    Any,
    Exact { id: TypeId, name: &'static str },
}

impl ResolvedType {
    /// Whether values of `self` may flow into a port of type `other`.
    pub fn compatible_with(&self, other: &ResolvedType) -> bool {
        match (self, other) {
            (ResolvedType::Exact { id: a, .. }, ResolvedType::Exact { id: b, .. }) => a == b,
            _ => true,
        }
    }

    /// Check a packet payload against this type. Empty packets always pass.
    pub fn validate(&self, packet: &Packet) -> Result<()> {
        match self {
            ResolvedType::Exact { id, name } => match packet.payload_type_id() {
                Some(actual) if actual != *id => Err(GraphError::PacketType {
                    expected: name.to_string(),
                    actual: packet.type_name().to_string(),
                }),
                _ => Ok(()),
            },
            ResolvedType::Any => Ok(()),
        }
    }
}

impl fmt::Debug for ResolvedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedType::Any => write!(f, "Any"),
            ResolvedType::Exact { name, .. } => write!(f, "{}", name),
        }
    }
}

/// Ports of one collection with their declared types.
#[derive(Debug, Clone)]
pub struct PortSet {
    tag_map: Arc<TagMap>,
    types: Vec<PacketType>,
}

impl PortSet {
    pub fn new(tag_map: Arc<TagMap>) -> Self {
        let types = vec![PacketType::Unset; tag_map.len()];
        Self { tag_map, types }
    }

    pub fn tag_map(&self) -> &Arc<TagMap> {
        &self.tag_map
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag_map.has_tag(tag)
    }

    pub fn count(&self, tag: &str) -> usize {
        self.tag_map.count(tag)
    }

    pub fn id(&self, tag: &str, index: usize) -> Option<CollectionItemId> {
        self.tag_map.id(tag, index)
    }

    pub fn ids(&self) -> impl Iterator<Item = CollectionItemId> + '_ {
        self.tag_map.ids()
    }

    pub fn get_type(&self, id: CollectionItemId) -> &PacketType {
        &self.types[id.index()]
    }

    /// Declare the type of `tag`/`index`.
    pub fn set(&mut self, tag: &str, index: usize, packet_type: PacketType) -> Result<()> {
        let id = self.tag_map.id(tag, index).ok_or_else(|| {
            GraphError::InvalidConfig(format!("no port {}:{} to declare", tag, index))
        })?;
        self.types[id.index()] = packet_type;
        Ok(())
    }

    /// Declare the type of port 0 of `tag`.
    pub fn set_tag(&mut self, tag: &str, packet_type: PacketType) -> Result<()> {
        self.set(tag, 0, packet_type)
    }

    /// Declare every index of `tag`.
    pub fn set_tag_all(&mut self, tag: &str, packet_type: PacketType) {
        let ids: Vec<CollectionItemId> = self.tag_map.ids_for_tag(tag).collect();
        for id in ids {
            self.types[id.index()] = packet_type.clone();
        }
    }

    pub fn set_by_id(&mut self, id: CollectionItemId, packet_type: PacketType) {
        self.types[id.index()] = packet_type;
    }

    /// Declare every port of the collection.
    pub fn set_all(&mut self, packet_type: PacketType) {
        for t in &mut self.types {
            *t = packet_type.clone();
        }
    }

    /// Fail unless every tag is in `allowed`.
    pub fn expect_tags(&self, allowed: &[&str]) -> Result<()> {
        for tag in self.tag_map.tags() {
            if !allowed.contains(&tag) {
                return Err(GraphError::InvalidConfig(format!(
                    "unexpected tag '{}' (allowed: {:?})",
                    tag, allowed
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(specs: &[&str]) -> PortSet {
        PortSet::new(Arc::new(TagMap::new(specs).unwrap()))
    }

    #[test]
    fn test_set_by_tag() {
        let mut set = ports(&["MAIN:in", "LOOP:loop"]);
        set.set_tag("MAIN", PacketType::of::<i64>()).unwrap();
        set.set_tag("LOOP", PacketType::Any).unwrap();
        assert!(set.set_tag("PREV", PacketType::Any).is_err());
        let main = set.id("MAIN", 0).unwrap();
        assert_eq!(set.get_type(main), &PacketType::of::<i64>());
    }

    #[test]
    fn test_set_tag_all_and_expect_tags() {
        let mut set = ports(&["a", "b", "FINISHED:f"]);
        set.set_tag_all("", PacketType::Any);
        assert_eq!(set.get_type(set.id("", 1).unwrap()), &PacketType::Any);
        assert_eq!(set.get_type(set.id("FINISHED", 0).unwrap()), &PacketType::Unset);
        assert!(set.expect_tags(&["", "FINISHED"]).is_ok());
        assert!(set.expect_tags(&[""]).is_err());
    }

    #[test]
    fn test_resolved_compatibility() {
        let int = ResolvedType::Exact {
            id: TypeId::of::<i64>(),
            name: "i64",
        };
        let text = ResolvedType::Exact {
            id: TypeId::of::<String>(),
            name: "String",
        };
        assert!(int.compatible_with(&ResolvedType::Any));
        assert!(!int.compatible_with(&text));
        assert!(int.validate(&Packet::new(3i64)).is_ok());
        assert!(int.validate(&Packet::new("x".to_string())).is_err());
        assert!(int.validate(&Packet::empty()).is_ok());
    }
}
