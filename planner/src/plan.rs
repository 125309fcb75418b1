use std::{collections::BTreeMap, sync::Arc};

use tessera_core::{
    CacheToken, Device, Memory, Model, Operand, PreparedModel, SourceOperandIndex,
};

use crate::step::LogicalStep;

// CONSTANTS
// ================================================================================================

/// The main model's index in a plan's source graph registry.
pub const MAIN_GRAPH_INDEX: u32 = 0;

// SOURCE GRAPHS
// ================================================================================================

/// The registry of every graph taking part in one compilation: the main model
/// first, then each referenced model as the partitioner recurses into it. A
/// [`SourceOperandIndex`] names an operand through this registry.
#[derive(Debug, Default)]
pub struct SourceGraphs {
    models: Vec<Arc<Model>>,
}

impl SourceGraphs {
    pub fn add_model(&mut self, model: Arc<Model>) -> u32 {
        self.models.push(model);
        (self.models.len() - 1) as u32
    }

    pub fn model(&self, index: u32) -> &Arc<Model> {
        &self.models[index as usize]
    }

    pub fn operand(&self, index: SourceOperandIndex) -> &Operand {
        self.model(index.graph).operand(index.operand)
    }

    pub fn len(&self) -> u32 {
        self.models.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

// BOUNDARY CONSTANT LOCATIONS
// ================================================================================================

/// An inline constant that crosses a control-flow boundary; its bytes are
/// copied into the temporaries arena when a controller is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantCopyLocation {
    pub bytes: Vec<u8>,
}

/// A by-reference constant that crosses a control-flow boundary; executions
/// read it in place.
#[derive(Debug, Clone)]
pub struct ConstantReferenceLocation {
    pub memory: Arc<Memory>,
    pub offset: u32,
    pub length: u32,
}

// PLAN BODIES
// ================================================================================================

/// A plan whose whole model runs as a single step on one device.
pub struct SimpleBody {
    pub device: Arc<dyn Device>,
    pub device_index: u32,
    pub model: Arc<Model>,
    pub prepared: Arc<dyn PreparedModel>,
    pub cache_token: Option<CacheToken>,
}

/// A plan that interleaves device steps with interpreted control flow.
pub struct CompoundBody {
    pub steps: Vec<LogicalStep>,
    /// Main-model input operands -> external input position.
    pub input_positions: BTreeMap<SourceOperandIndex, u32>,
    /// Main-model output operands -> external output position.
    pub output_positions: BTreeMap<SourceOperandIndex, u32>,
    /// Inline constants on control-flow boundaries.
    pub boundary_constant_copies: BTreeMap<SourceOperandIndex, ConstantCopyLocation>,
    /// By-reference constants on control-flow boundaries.
    pub boundary_constant_references: BTreeMap<SourceOperandIndex, ConstantReferenceLocation>,
    /// Whether any step model output has a shape only known at execution
    /// time.
    pub has_dynamic_step_outputs: bool,
}

/// The finished output of the partitioner.
pub enum PlanBody {
    /// A plan for a model with no operations.
    Empty,
    Simple(SimpleBody),
    Compound(CompoundBody),
}

// EXECUTION PLAN
// ================================================================================================

/// A finalised, immutable execution plan.
///
/// Shared across any number of concurrent executions; all per-execution state
/// lives in each execution's controller.
pub struct ExecutionPlan {
    body: PlanBody,
    source_graphs: SourceGraphs,
    /// The compilation's device list; the last entry is the fallback device.
    devices: Vec<Arc<dyn Device>>,
}

impl ExecutionPlan {
    pub(crate) fn new(
        body: PlanBody,
        source_graphs: SourceGraphs,
        devices: Vec<Arc<dyn Device>>,
    ) -> Self {
        Self { body, source_graphs, devices }
    }

    pub fn body(&self) -> &PlanBody {
        &self.body
    }

    pub fn source_graphs(&self) -> &SourceGraphs {
        &self.source_graphs
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    /// The guaranteed software back-end: by contract, the last device of the
    /// compilation's device list.
    pub fn fallback_device(&self) -> &Arc<dyn Device> {
        self.devices.last().expect("a plan always has at least the fallback device")
    }

    pub fn is_fallback_device_index(&self, device_index: u32) -> bool {
        device_index as usize == self.devices.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.body, PlanBody::Empty)
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.body, PlanBody::Simple(_))
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.body, PlanBody::Compound(_))
    }

    /// Whether the plan is a simple plan already targeting the fallback
    /// device, in which case no form of fallback can make progress.
    pub fn is_simple_on_fallback(&self) -> bool {
        match &self.body {
            PlanBody::Simple(simple) => self.is_fallback_device_index(simple.device_index),
            _ => false,
        }
    }

    pub fn as_simple(&self) -> Option<&SimpleBody> {
        match &self.body {
            PlanBody::Simple(simple) => Some(simple),
            _ => None,
        }
    }

    pub fn as_compound(&self) -> Option<&CompoundBody> {
        match &self.body {
            PlanBody::Compound(compound) => Some(compound),
            _ => None,
        }
    }

    pub fn steps(&self) -> &[LogicalStep] {
        match &self.body {
            PlanBody::Compound(compound) => &compound.steps,
            _ => &[],
        }
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            PlanBody::Empty => write!(f, "ExecutionPlan::Empty"),
            PlanBody::Simple(simple) => {
                write!(f, "ExecutionPlan::Simple(device = {})", simple.device.name())
            },
            PlanBody::Compound(compound) => {
                write!(f, "ExecutionPlan::Compound({} steps)", compound.steps.len())
            },
        }
    }
}
