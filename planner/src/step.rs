use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use tessera_core::{
    CacheToken, Device, Model, ModelBuilder, PrepareOptions, PreparedModel, SourceOperandIndex,
    operand::OperandLifetime,
};
use tracing::debug;

use crate::{CompileError, strip, token::TokenHasher};

// EXECUTION STEP
// ================================================================================================

/// Whether an operand joins a step model through an operation's input list or
/// its output list; a temporary's role in the step depends on which comes
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Input,
    Output,
}

/// Pairs of (source graph operand index, step model operand index).
pub type OperandRemap = Vec<(u32, u32)>;

/// An excerpt of a source graph to be run on one device.
///
/// While the partitioner assigns operations, the step accumulates a private
/// step model plus the boundary tables that let an execution correlate the
/// step model's inputs and outputs back to source operands. `finish` fixes
/// the external orderings, strips redundant trailing arguments, and compiles
/// the step model on its device.
pub struct ExecutionStep {
    index: u32,
    source_graph: u32,
    device: Arc<dyn Device>,
    device_index: u32,
    builder: ModelBuilder,
    model: Option<Arc<Model>>,
    prepared: Option<Arc<dyn PreparedModel>>,
    /// Source operand index -> step model operand index.
    operand_map: BTreeMap<u32, u32>,
    /// All step model inputs / outputs, in final binding order. Populated by
    /// `finish`; `model_inputs` is a prefix of `step_model_inputs` and
    /// `model_outputs` a prefix of `step_model_outputs`.
    step_model_inputs: OperandRemap,
    step_model_outputs: OperandRemap,
    /// Main-model inputs that are inputs of this step model.
    model_inputs: OperandRemap,
    /// Main-model outputs that are outputs of this step model.
    model_outputs: OperandRemap,
    /// Source temporaries written by other steps and read by this one.
    temps_as_step_inputs: OperandRemap,
    /// Source temporaries written by this step and read by later steps,
    /// ordered by source operand index.
    temps_as_step_outputs: BTreeMap<u32, u32>,
    /// Main-model outputs read (not written) by this step.
    outputs_as_step_inputs: OperandRemap,
    /// Step-model input position -> main-model input position, covering the
    /// `model_inputs` prefix only.
    input_index_step_to_main: Vec<u32>,
    /// Step-model output position -> main-model output position, covering the
    /// `model_outputs` prefix only.
    output_index_step_to_main: Vec<u32>,
    /// Position in `outputs_as_step_inputs` -> main-model output position.
    outputs_as_inputs_index_to_main: Vec<u32>,
    token: TokenHasher,
    cache_token: Option<CacheToken>,
}

impl ExecutionStep {
    pub(crate) fn new(
        index: u32,
        source_graph: u32,
        device: Arc<dyn Device>,
        device_index: u32,
        client_token: Option<&CacheToken>,
    ) -> Self {
        Self {
            index,
            source_graph,
            device,
            device_index,
            builder: ModelBuilder::new(),
            model: None,
            prepared: None,
            operand_map: BTreeMap::new(),
            step_model_inputs: Vec::new(),
            step_model_outputs: Vec::new(),
            model_inputs: Vec::new(),
            model_outputs: Vec::new(),
            temps_as_step_inputs: Vec::new(),
            temps_as_step_outputs: BTreeMap::new(),
            outputs_as_step_inputs: Vec::new(),
            input_index_step_to_main: Vec::new(),
            output_index_step_to_main: Vec::new(),
            outputs_as_inputs_index_to_main: Vec::new(),
            token: TokenHasher::new(client_token),
            cache_token: None,
        }
    }

    /// Adds one source-graph operation to this step, pulling each operand it
    /// references into the step model on first encounter.
    pub(crate) fn add_operation(
        &mut self,
        operation_index: u32,
        source: &Model,
        temp_definitions: &mut BTreeMap<SourceOperandIndex, u32>,
    ) -> Result<(), CompileError> {
        self.token.update_u32(self.source_graph);
        self.token.update_u32(operation_index);

        let operation = source.operation(operation_index).clone();
        let mut inputs = Vec::with_capacity(operation.inputs.len());
        for &source_index in &operation.inputs {
            inputs.push(self.add_operand(source_index, source, OperandKind::Input, temp_definitions)?);
        }
        let mut outputs = Vec::with_capacity(operation.outputs.len());
        for &source_index in &operation.outputs {
            outputs.push(self.add_operand(
                source_index,
                source,
                OperandKind::Output,
                temp_definitions,
            )?);
        }
        self.builder.add_operation(operation.ty, &inputs, &outputs)?;
        Ok(())
    }

    /// Adds an operand to the step model if it has not been added already and
    /// returns its step model index. The operand's role in the step follows
    /// from its lifetime in the source graph and whether it is first seen as
    /// an input or an output.
    fn add_operand(
        &mut self,
        source_index: u32,
        source: &Model,
        kind: OperandKind,
        temp_definitions: &mut BTreeMap<SourceOperandIndex, u32>,
    ) -> Result<u32, CompileError> {
        if let Some(&step_index) = self.operand_map.get(&source_index) {
            debug_assert_eq!(kind, OperandKind::Input, "operations arrive in execution order");
            return Ok(step_index);
        }

        let operand = source.operand(source_index);
        let step_index = self.builder.add_operand_like(operand);
        self.operand_map.insert(source_index, step_index);

        match operand.lifetime {
            OperandLifetime::ConstantCopy => {
                let bytes = source
                    .operand_value(operand)
                    .expect("constant-copy operand has a pool window");
                self.builder.set_operand_value(step_index, bytes)?;
            },
            OperandLifetime::ConstantReference => {
                let (memory, offset, length) = source
                    .constant_reference(operand)
                    .expect("constant-reference operand has a region");
                self.builder
                    .set_operand_value_from_memory(step_index, Arc::clone(memory), offset, length)?;
            },
            OperandLifetime::NoValue => {
                self.builder.set_operand_no_value(step_index)?;
            },
            OperandLifetime::Temporary => match kind {
                // First seen as an input: defined by a different step.
                OperandKind::Input => {
                    self.temps_as_step_inputs.push((source_index, step_index));
                },
                // First seen as an output: a later step may consume it.
                OperandKind::Output => {
                    let key = SourceOperandIndex::new(self.source_graph, source_index);
                    let previous = temp_definitions.insert(key, self.index);
                    debug_assert!(
                        previous.is_none(),
                        "temporary {key} defined by steps {previous:?} and {}",
                        self.index
                    );
                },
            },
            OperandLifetime::GraphInput => {
                self.model_inputs.push((source_index, step_index));
            },
            OperandLifetime::GraphOutput => match kind {
                OperandKind::Input => {
                    self.outputs_as_step_inputs.push((source_index, step_index));
                },
                OperandKind::Output => {
                    self.model_outputs.push((source_index, step_index));
                },
            },
            OperandLifetime::Subgraph => {
                let referenced = source
                    .referenced_model(operand)
                    .expect("subgraph operand references a graph");
                self.builder.set_operand_subgraph(step_index, Arc::clone(referenced))?;
            },
        }
        Ok(step_index)
    }

    /// Marks a source temporary written by this step as a step model output
    /// because another step consumes it.
    pub(crate) fn record_temp_as_step_output(&mut self, source_index: u32) {
        let step_index = *self
            .operand_map
            .get(&source_index)
            .expect("temporary was added to the step that defines it");
        self.temps_as_step_outputs.insert(source_index, step_index);
    }

    /// Fixes the external orderings of the step model, compiles it on the
    /// step's device, and reports whether any step output has unknown size.
    ///
    /// External input order: main-model inputs, then temporaries read from
    /// other steps, then main-model outputs read as inputs. External output
    /// order: main-model outputs, then temporaries consumed by later steps.
    /// Back-ends rely on these orderings to correlate positions.
    pub(crate) fn finish(
        &mut self,
        main_model: &Model,
        options: &PrepareOptions,
    ) -> Result<bool, CompileError> {
        let mut has_dynamic_output = false;
        for (&source_index, &step_index) in &self.temps_as_step_outputs {
            if self.builder.operand(step_index).has_unknown_size() {
                debug!(
                    source_operand = source_index,
                    step = self.index,
                    "step model output has unknown size"
                );
                has_dynamic_output = true;
            }
        }

        self.builder
            .relax_computation_float32_to_float16(main_model.is_relaxed_float32_to_float16());

        self.step_model_inputs = self.model_inputs.clone();
        self.step_model_inputs.extend(self.temps_as_step_inputs.iter().copied());
        self.step_model_inputs.extend(self.outputs_as_step_inputs.iter().copied());
        self.step_model_outputs = self.model_outputs.clone();
        self.step_model_outputs.extend(self.temps_as_step_outputs.iter().map(|(&s, &t)| (s, t)));

        if self.source_graph == crate::plan::MAIN_GRAPH_INDEX {
            let main_input_positions: BTreeMap<u32, u32> = main_model
                .input_indexes()
                .iter()
                .enumerate()
                .map(|(position, &operand)| (operand, position as u32))
                .collect();
            let main_output_positions: BTreeMap<u32, u32> = main_model
                .output_indexes()
                .iter()
                .enumerate()
                .map(|(position, &operand)| (operand, position as u32))
                .collect();
            self.input_index_step_to_main = self
                .model_inputs
                .iter()
                .map(|(source, _)| main_input_positions[source])
                .collect();
            self.output_index_step_to_main = self
                .model_outputs
                .iter()
                .map(|(source, _)| main_output_positions[source])
                .collect();
            self.outputs_as_inputs_index_to_main = self
                .outputs_as_step_inputs
                .iter()
                .map(|(source, _)| main_output_positions[source])
                .collect();
        }

        let inputs: Vec<u32> = self.step_model_inputs.iter().map(|&(_, step)| step).collect();
        let outputs: Vec<u32> = self.step_model_outputs.iter().map(|&(_, step)| step).collect();
        self.builder.identify_inputs_outputs(&inputs, &outputs)?;

        // Widen back-end acceptance without changing semantics. The cache
        // token is computed from the pre-stripping contents; stripping is
        // deterministic per model, so the token remains a sound key.
        strip::strip_trailing_default_arguments(&mut self.builder);

        self.token.update_str(self.device.name());
        self.token.update_str(self.device.version());
        self.token.update_u32(options.preference as u32);
        self.token.update_u32(options.priority as u32);
        self.cache_token = self.token.finish();

        let model = std::mem::take(&mut self.builder).finish()?;
        debug!(
            step = self.index,
            device = self.device.name(),
            operations = model.operation_count(),
            "compiling step model"
        );
        let prepare_options = PrepareOptions {
            preference: options.preference,
            priority: options.priority,
            deadline: options.deadline,
            cache_dir: options.cache_dir.clone(),
            cache_token: if self.device.is_caching_supported() { self.cache_token } else { None },
        };
        let prepared = self.device.prepare(&model, &prepare_options).map_err(|source| {
            CompileError::PrepareFailed { device: self.device.name().to_string(), source }
        })?;
        self.model = Some(model);
        self.prepared = Some(prepared);
        Ok(has_dynamic_output)
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn source_graph(&self) -> u32 {
        self.source_graph
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    /// The step model. Only available once the step has been finished.
    pub fn model(&self) -> &Arc<Model> {
        self.model.as_ref().expect("step model has been finished")
    }

    pub fn prepared(&self) -> &Arc<dyn PreparedModel> {
        self.prepared.as_ref().expect("step model has been compiled")
    }

    pub fn step_model_inputs(&self) -> &OperandRemap {
        &self.step_model_inputs
    }

    pub fn step_model_outputs(&self) -> &OperandRemap {
        &self.step_model_outputs
    }

    pub fn model_inputs(&self) -> &OperandRemap {
        &self.model_inputs
    }

    pub fn model_outputs(&self) -> &OperandRemap {
        &self.model_outputs
    }

    pub fn temps_as_step_inputs(&self) -> &OperandRemap {
        &self.temps_as_step_inputs
    }

    pub fn temps_as_step_outputs(&self) -> &BTreeMap<u32, u32> {
        &self.temps_as_step_outputs
    }

    pub fn outputs_as_step_inputs(&self) -> &OperandRemap {
        &self.outputs_as_step_inputs
    }

    pub fn input_index_step_to_main(&self) -> &[u32] {
        &self.input_index_step_to_main
    }

    pub fn output_index_step_to_main(&self) -> &[u32] {
        &self.output_index_step_to_main
    }

    pub fn outputs_as_inputs_index_to_main(&self) -> &[u32] {
        &self.outputs_as_inputs_index_to_main
    }

    pub fn cache_token(&self) -> Option<&CacheToken> {
        self.cache_token.as_ref()
    }
}

impl fmt::Debug for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStep")
            .field("index", &self.index)
            .field("source_graph", &self.source_graph)
            .field("device", &self.device.name())
            .finish_non_exhaustive()
    }
}

// CONTROL FLOW STEPS
// ================================================================================================

/// An IF operation interpreted by the plan driver.
///
/// Plan layout:
/// ```text
/// Index  Step
///   i    if then=(i + 1) else=(j + 1)
///  ...   (then branch steps)
///   j    goto k
///  ...   (else branch steps)
///   k    (steps after the IF)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfStep {
    pub index: u32,
    pub then_step_index: u32,
    pub else_step_index: u32,
    pub condition_operand: SourceOperandIndex,
    pub outer_inputs: Vec<SourceOperandIndex>,
    pub outer_outputs: Vec<SourceOperandIndex>,
    pub then_branch_inputs: Vec<SourceOperandIndex>,
    pub then_branch_outputs: Vec<SourceOperandIndex>,
    pub else_branch_inputs: Vec<SourceOperandIndex>,
    pub else_branch_outputs: Vec<SourceOperandIndex>,
}

impl IfStep {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            then_step_index: 0,
            else_step_index: 0,
            condition_operand: SourceOperandIndex::new(u32::MAX, u32::MAX),
            outer_inputs: Vec::new(),
            outer_outputs: Vec::new(),
            then_branch_inputs: Vec::new(),
            then_branch_outputs: Vec::new(),
            else_branch_inputs: Vec::new(),
            else_branch_outputs: Vec::new(),
        }
    }
}

impl fmt::Display for IfStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step#{}: if {} then={} else={}",
            self.index, self.condition_operand, self.then_step_index, self.else_step_index
        )
    }
}

/// A WHILE operation interpreted by the plan driver.
///
/// Plan layout:
/// ```text
/// Index  Step
///   i    while cond=(i + 1) body=(j + 1) exit=(k + 1)
///  ...   (condition steps)
///   j    goto i
///  ...   (body steps)
///   k    goto i
///  ...   (steps after the WHILE)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhileStep {
    pub index: u32,
    pub cond_step_index: u32,
    pub body_step_index: u32,
    pub exit_step_index: u32,
    pub outer_inputs: Vec<SourceOperandIndex>,
    pub outer_outputs: Vec<SourceOperandIndex>,
    pub cond_inputs: Vec<SourceOperandIndex>,
    pub cond_output: SourceOperandIndex,
    pub body_inputs: Vec<SourceOperandIndex>,
    pub body_outputs: Vec<SourceOperandIndex>,
}

impl WhileStep {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            cond_step_index: 0,
            body_step_index: 0,
            exit_step_index: 0,
            outer_inputs: Vec::new(),
            outer_outputs: Vec::new(),
            cond_inputs: Vec::new(),
            cond_output: SourceOperandIndex::new(u32::MAX, u32::MAX),
            body_inputs: Vec::new(),
            body_outputs: Vec::new(),
        }
    }
}

impl fmt::Display for WhileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step#{}: while cond={} body={} exit={}",
            self.index, self.cond_step_index, self.body_step_index, self.exit_step_index
        )
    }
}

/// An unconditional jump threading the linear plan around branch bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GotoStep {
    pub index: u32,
    pub target_step_index: u32,
}

impl fmt::Display for GotoStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step#{}: goto {}", self.index, self.target_step_index)
    }
}

// LOGICAL STEP
// ================================================================================================

/// One entry of a compound plan's linear program.
#[derive(Debug)]
pub enum LogicalStep {
    Execution(ExecutionStep),
    If(IfStep),
    While(WhileStep),
    Goto(GotoStep),
}

impl LogicalStep {
    pub fn index(&self) -> u32 {
        match self {
            Self::Execution(step) => step.index(),
            Self::If(step) => step.index,
            Self::While(step) => step.index,
            Self::Goto(step) => step.index,
        }
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    pub fn as_execution(&self) -> Option<&ExecutionStep> {
        match self {
            Self::Execution(step) => Some(step),
            _ => None,
        }
    }

    pub(crate) fn as_execution_mut(&mut self) -> Option<&mut ExecutionStep> {
        match self {
            Self::Execution(step) => Some(step),
            _ => None,
        }
    }

    pub fn as_if(&self) -> Option<&IfStep> {
        match self {
            Self::If(step) => Some(step),
            _ => None,
        }
    }

    pub fn as_while(&self) -> Option<&WhileStep> {
        match self {
            Self::While(step) => Some(step),
            _ => None,
        }
    }

    pub fn as_goto(&self) -> Option<&GotoStep> {
        match self {
            Self::Goto(step) => Some(step),
            _ => None,
        }
    }
}
