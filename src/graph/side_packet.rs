//! Side-packet resolution.
//!
//! Side packets resolve in three tiers: base packets handed to `initialize`,
//! packets made by packet generators, and per-run extras handed to
//! `start_run`. Nodes may add more while the graph runs. Every name is set at
//! most once per run.

use super::compiled_plan::{CompiledPlan, GeneratorSpec};
use crate::error::{GraphError, Result};
use crate::framework::context::SidePacketSet;
use crate::framework::packet::Packet;
use crate::framework::port::ResolvedType;
use crate::framework::tag_map::TagMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolved side packets of one run.
#[derive(Debug, Default)]
pub(crate) struct SidePacketStore {
    packets: RwLock<HashMap<String, Packet>>,
}

impl SidePacketStore {
    pub(crate) fn new(packets: HashMap<String, Packet>) -> Self {
        Self {
            packets: RwLock::new(packets),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Packet> {
        self.packets.read().get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.packets.read().contains_key(name)
    }

    pub(crate) fn insert(&self, name: String, packet: Packet) -> Result<()> {
        let mut packets = self.packets.write();
        if packets.contains_key(&name) {
            return Err(GraphError::SidePacketAlreadySet(name));
        }
        packets.insert(name, packet);
        Ok(())
    }

    /// A node-facing view of the packets named by `tag_map`.
    pub(crate) fn view(&self, tag_map: &Arc<TagMap>, types: &[ResolvedType]) -> SidePacketSet {
        let packets = self.packets.read();
        let values = tag_map.names().map(|name| packets.get(name).cloned()).collect();
        SidePacketSet::with_packets(Arc::clone(tag_map), types.to_vec(), values)
    }
}

/// Run every generator whose inputs are available, until none can run.
///
/// `done` marks generators that already ran. With `require_all`, a generator
/// left waiting is a `MissingSidePacket` error.
pub(crate) fn run_generators(
    plan: &CompiledPlan,
    available: &mut HashMap<String, Packet>,
    done: &mut [bool],
    require_all: bool,
) -> Result<()> {
    loop {
        let mut progressed = false;
        for (i, generator) in plan.generators.iter().enumerate() {
            if done[i] || !generator.inputs.names().all(|n| available.contains_key(n)) {
                continue;
            }
            for (name, packet) in run_generator(generator, available)? {
                if available.contains_key(&name) {
                    return Err(GraphError::SidePacketAlreadySet(name));
                }
                available.insert(name, packet);
            }
            done[i] = true;
            progressed = true;
        }
        if !progressed {
            break;
        }
    }

    if require_all {
        for (i, generator) in plan.generators.iter().enumerate() {
            if done[i] {
                continue;
            }
            let missing = generator
                .inputs
                .names()
                .find(|n| !available.contains_key(*n))
                .unwrap_or_default();
            return Err(GraphError::MissingSidePacket(format!(
                "'{}' needed by packet generator '{}'",
                missing, generator.name
            )));
        }
    }
    Ok(())
}

fn run_generator(
    generator: &GeneratorSpec,
    available: &HashMap<String, Packet>,
) -> Result<Vec<(String, Packet)>> {
    let values = generator
        .inputs
        .names()
        .map(|name| available.get(name).cloned())
        .collect();
    let inputs = SidePacketSet::with_packets(
        Arc::clone(&generator.inputs),
        generator.input_types.clone(),
        values,
    );
    let mut outputs =
        SidePacketSet::new(Arc::clone(&generator.outputs), generator.output_types.clone());

    (generator.entry.generate)(&generator.options, &inputs, &mut outputs)
        .map_err(|e| e.in_node(generator.name.clone()))?;

    for id in generator.outputs.ids() {
        if !outputs.is_set(id) {
            return Err(GraphError::MissingSidePacket(format!(
                "'{}' was not produced by packet generator '{}'",
                generator.outputs.entry(id).name,
                generator.name
            )));
        }
    }
    tracing::debug!(generator = %generator.name, outputs = outputs.len(), "packet generator ran");
    Ok(outputs.take_fresh())
}
