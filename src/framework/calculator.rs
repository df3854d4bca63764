//! Calculator abstraction.
//!
//! Two-layer design, mirroring how nodes are dispatched:
//! - **`Calculator`** — exclusive `&mut self` access; the scheduler never runs
//!   two callbacks of the same node at once.
//! - **`SharedCalculator`** — `&self` + `Sync`; required for `max_in_flight > 1`
//!   where several Process calls of one node overlap.
//!
//! `CalculatorInstance` wraps either variant so the runtime handles both
//! uniformly. Packet generators produce side packets before a run and have no
//! instance state.

use crate::error::{GraphError, Result};
use crate::framework::context::{CalculatorContext, SidePacketSet};
use crate::framework::contract::CalculatorContract;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A node implementation with exclusive access to its state.
pub trait Calculator: Send {
    /// Declare port types and scheduling requests for a node.
    fn contract(cc: &mut CalculatorContract) -> Result<()>
    where
        Self: Sized;

    /// Called once per run after the node's input side packets resolve.
    fn open(&mut self, _ctx: &mut CalculatorContext) -> Result<()> {
        Ok(())
    }

    /// Called once per input set.
    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()>;

    /// Called once when every input is done.
    fn close(&mut self, _ctx: &mut CalculatorContext) -> Result<()> {
        Ok(())
    }
}

/// A node implementation whose callbacks may run concurrently.
pub trait SharedCalculator: Send + Sync {
    fn contract(cc: &mut CalculatorContract) -> Result<()>
    where
        Self: Sized;

    fn open(&self, _ctx: &mut CalculatorContext) -> Result<()> {
        Ok(())
    }

    fn process(&self, ctx: &mut CalculatorContext) -> Result<()>;

    fn close(&self, _ctx: &mut CalculatorContext) -> Result<()> {
        Ok(())
    }
}

/// Either calculator flavour.
pub enum CalculatorInstance {
    Exclusive(Box<dyn Calculator>),
    Shared(Arc<dyn SharedCalculator>),
}

impl CalculatorInstance {
    pub fn is_shared(&self) -> bool {
        matches!(self, CalculatorInstance::Shared(_))
    }
}

impl fmt::Debug for CalculatorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalculatorInstance::Exclusive(_) => write!(f, "CalculatorInstance::Exclusive"),
            CalculatorInstance::Shared(_) => write!(f, "CalculatorInstance::Shared"),
        }
    }
}

/// Produces side packets from side packets, before nodes open.
pub trait PacketGenerator {
    fn contract(cc: &mut CalculatorContract) -> Result<()>;

    fn generate(
        options: &serde_json::Value,
        inputs: &SidePacketSet,
        outputs: &mut SidePacketSet,
    ) -> Result<()>;
}

pub type ContractFn = Arc<dyn Fn(&mut CalculatorContract) -> Result<()> + Send + Sync>;
pub type FactoryFn = Arc<dyn Fn() -> CalculatorInstance + Send + Sync>;
pub type GenerateFn =
    Arc<dyn Fn(&serde_json::Value, &SidePacketSet, &mut SidePacketSet) -> Result<()> + Send + Sync>;

/// Registered calculator: its contract and how to build instances.
#[derive(Clone)]
pub struct CalculatorEntry {
    pub contract: ContractFn,
    pub factory: FactoryFn,
    pub shared: bool,
}

/// Registered packet generator.
#[derive(Clone)]
pub struct GeneratorEntry {
    pub contract: ContractFn,
    pub generate: GenerateFn,
}

impl fmt::Debug for CalculatorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatorEntry")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for GeneratorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorEntry").finish_non_exhaustive()
    }
}

/// Name → implementation table consulted when a graph is initialized.
#[derive(Clone, Default)]
pub struct CalculatorRegistry {
    calculators: HashMap<String, CalculatorEntry>,
    generators: HashMap<String, GeneratorEntry>,
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the framework calculators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::calculators::register_builtins(&mut registry);
        registry
    }

    /// Register an exclusive calculator built with `Default`.
    pub fn register<C>(&mut self, name: impl Into<String>) -> &mut Self
    where
        C: Calculator + Default + 'static,
    {
        self.calculators.insert(
            name.into(),
            CalculatorEntry {
                contract: Arc::new(C::contract),
                factory: Arc::new(|| CalculatorInstance::Exclusive(Box::new(C::default()))),
                shared: false,
            },
        );
        self
    }

    /// Register a shared calculator built with `Default`.
    pub fn register_shared<C>(&mut self, name: impl Into<String>) -> &mut Self
    where
        C: SharedCalculator + Default + 'static,
    {
        self.calculators.insert(
            name.into(),
            CalculatorEntry {
                contract: Arc::new(C::contract),
                factory: Arc::new(|| CalculatorInstance::Shared(Arc::new(C::default()))),
                shared: true,
            },
        );
        self
    }

    /// Register a calculator from closures. `shared` must match what `factory` builds.
    pub fn register_with<F, G>(
        &mut self,
        name: impl Into<String>,
        contract: F,
        factory: G,
        shared: bool,
    ) -> &mut Self
    where
        F: Fn(&mut CalculatorContract) -> Result<()> + Send + Sync + 'static,
        G: Fn() -> CalculatorInstance + Send + Sync + 'static,
    {
        self.calculators.insert(
            name.into(),
            CalculatorEntry {
                contract: Arc::new(contract),
                factory: Arc::new(factory),
                shared,
            },
        );
        self
    }

    pub fn register_generator<G>(&mut self, name: impl Into<String>) -> &mut Self
    where
        G: PacketGenerator + 'static,
    {
        self.generators.insert(
            name.into(),
            GeneratorEntry {
                contract: Arc::new(G::contract),
                generate: Arc::new(G::generate),
            },
        );
        self
    }

    pub fn calculator(&self, name: &str) -> Result<&CalculatorEntry> {
        self.calculators
            .get(name)
            .ok_or_else(|| GraphError::UnknownCalculator(name.to_string()))
    }

    pub fn generator(&self, name: &str) -> Result<&GeneratorEntry> {
        self.generators
            .get(name)
            .ok_or_else(|| GraphError::UnknownCalculator(name.to_string()))
    }

    pub fn has_calculator(&self, name: &str) -> bool {
        self.calculators.contains_key(name)
    }

    /// Registered calculator names, sorted.
    pub fn calculator_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.calculators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CalculatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatorRegistry")
            .field("calculators", &self.calculator_names())
            .field("generators", &self.generators.len())
            .finish()
    }
}
