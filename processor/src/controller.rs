//! Per-execution mutable state: the temporaries arena and the maps that
//! resolve every partition-boundary operand to a concrete location.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use tessera_core::{FenceStatus, Memory, SourceOperandIndex, SyncFence, operand::OperandLifetime};
use tessera_planner::{ConstantReferenceLocation, ExecutionPlan, LogicalStep, PlanBody};
use tracing::trace;

use crate::ExecutionError;

// WHILE STATE
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WhileStage {
    EvaluateCondition,
    EvaluateBody,
}

/// Interpreter state for one WhileStep.
#[derive(Debug)]
pub(crate) struct WhileState {
    pub stage: WhileStage,
    /// Current iteration, or [`WhileState::OUTSIDE_LOOP`] when the loop is
    /// not running.
    pub iteration: u64,
    pub start_time: Instant,
}

impl WhileState {
    pub const OUTSIDE_LOOP: u64 = u64::MAX;
}

impl Default for WhileState {
    fn default() -> Self {
        Self {
            stage: WhileStage::EvaluateCondition,
            iteration: Self::OUTSIDE_LOOP,
            start_time: Instant::now(),
        }
    }
}

// CONTROLLER
// ================================================================================================

pub(crate) const BAD_STEP_INDEX: u32 = u32::MAX;

const ARENA_ALIGNMENT: u32 = 8;

/// Owns one execution's walk through a plan.
///
/// A source operand appears in at most one of the location maps at any time;
/// IF and WHILE advancement re-aliases entries as branches are taken and
/// loops iterate. The secondary temporary map exists only for WHILE
/// double-buffering and is exempt from the exclusivity rule.
pub(crate) struct Controller {
    pub arena: Option<Arc<Memory>>,
    /// Source operand -> offset of its slot in the arena.
    pub operand_to_temporary: BTreeMap<SourceOperandIndex, u32>,
    /// Second slot per WHILE body output, for double-buffering.
    pub operand_to_temporary2: BTreeMap<SourceOperandIndex, u32>,
    /// Source operand -> main-model input position.
    pub operand_to_input: BTreeMap<SourceOperandIndex, u32>,
    /// Source operand -> main-model output position.
    pub operand_to_output: BTreeMap<SourceOperandIndex, u32>,
    /// Boundary constants read in place.
    pub operand_to_constant_reference: BTreeMap<SourceOperandIndex, ConstantReferenceLocation>,
    /// Lazily-allocated regions for temporaries whose size is only known
    /// once the producing step reports its output shapes.
    pub dynamic_temporaries: BTreeMap<SourceOperandIndex, Arc<Memory>>,
    /// Shapes refined at execution time, keyed by source operand.
    pub refined_dimensions: BTreeMap<SourceOperandIndex, Vec<u32>>,
    pub next_step_index: u32,
    /// Where partial fallback re-enters the plan.
    pub fallback_next_step_index: u32,
    pub while_state: BTreeMap<u32, WhileState>,
    /// Sync fence produced by the most recently dispatched step, if any.
    pub last_step_fence: Option<SyncFence>,
}

impl Controller {
    pub fn new(plan: &ExecutionPlan) -> Result<Self, ExecutionError> {
        let mut controller = Self {
            arena: None,
            operand_to_temporary: BTreeMap::new(),
            operand_to_temporary2: BTreeMap::new(),
            operand_to_input: BTreeMap::new(),
            operand_to_output: BTreeMap::new(),
            operand_to_constant_reference: BTreeMap::new(),
            dynamic_temporaries: BTreeMap::new(),
            refined_dimensions: BTreeMap::new(),
            next_step_index: 0,
            fallback_next_step_index: BAD_STEP_INDEX,
            while_state: BTreeMap::new(),
            last_step_fence: None,
        };
        let PlanBody::Compound(compound) = plan.body() else {
            return Ok(controller);
        };

        controller.operand_to_input = compound.input_positions.clone();
        controller.operand_to_output = compound.output_positions.clone();
        controller.operand_to_constant_reference = compound.boundary_constant_references.clone();

        // Lay out one slot per operand that crosses a partition boundary.
        // Main-model inputs and outputs are bound by the client and take no
        // slot; temporaries of unknown size are allocated lazily instead.
        let mut total: u32 = 0;
        let mut add_slot = |size: u32| -> Result<u32, ExecutionError> {
            let aligned = total
                .checked_next_multiple_of(ARENA_ALIGNMENT)
                .ok_or(ExecutionError::OutOfMemory)?;
            let end = aligned.checked_add(size).ok_or(ExecutionError::OutOfMemory)?;
            total = end;
            Ok(aligned)
        };
        let graphs = plan.source_graphs();
        let mut map_static = |map: &mut BTreeMap<SourceOperandIndex, u32>,
                              index: SourceOperandIndex|
         -> Result<(), ExecutionError> {
            let size = graphs.operand(index).byte_size().expect("boundary operand has known size");
            let offset = add_slot(size)?;
            let displaced = map.insert(index, offset);
            debug_assert!(displaced.is_none(), "operand {index} allocated twice");
            trace!(operand = %index, offset, size, "arena slot");
            Ok(())
        };

        for step in &compound.steps {
            match step {
                LogicalStep::Execution(step) => {
                    // Temporary outputs read by other steps. Unknown-size
                    // temporaries go to the dynamic map on first write.
                    for (&source_operand, _) in step.temps_as_step_outputs() {
                        let index = SourceOperandIndex::new(step.source_graph(), source_operand);
                        if graphs.operand(index).byte_size().is_some() {
                            map_static(&mut controller.operand_to_temporary, index)?;
                        }
                    }
                },
                LogicalStep::If(step) => {
                    // Branch outputs alias the outer outputs, so only the
                    // outer outputs need storage. Graph-output operands are
                    // skipped: main-model outputs are client-bound, and
                    // nested branch or loop outputs get their location from
                    // the enclosing control-flow step.
                    for &index in &step.outer_outputs {
                        if graphs.operand(index).lifetime == OperandLifetime::Temporary {
                            map_static(&mut controller.operand_to_temporary, index)?;
                        }
                    }
                },
                LogicalStep::While(step) => {
                    for &index in &step.outer_outputs {
                        if graphs.operand(index).lifetime == OperandLifetime::Temporary {
                            map_static(&mut controller.operand_to_temporary, index)?;
                        }
                    }
                    // Two slots per body output implement double-buffering.
                    for &index in &step.body_outputs {
                        map_static(&mut controller.operand_to_temporary, index)?;
                        map_static(&mut controller.operand_to_temporary2, index)?;
                    }
                    map_static(&mut controller.operand_to_temporary, step.cond_output)?;
                },
                LogicalStep::Goto(_) => {},
            }
        }
        // Inline boundary constants are copied into the arena once.
        let mut constant_offsets = Vec::new();
        for (&index, location) in &compound.boundary_constant_copies {
            let offset = add_slot(location.bytes.len() as u32)?;
            controller.operand_to_temporary.insert(index, offset);
            constant_offsets.push((offset, index));
        }

        if total > 0 {
            let arena = Memory::allocate(total);
            for (offset, index) in constant_offsets {
                let bytes = &compound.boundary_constant_copies[&index].bytes;
                arena.write(offset, bytes).map_err(|_| ExecutionError::OutOfMemory)?;
            }
            controller.arena = Some(arena);
        }
        Ok(controller)
    }

    /// Points `inner` at the same location as `outer`, replacing any stale
    /// binding `inner` may carry from an earlier branch entry or loop
    /// iteration.
    pub fn set_input(&mut self, outer: SourceOperandIndex, inner: SourceOperandIndex) {
        trace!(outer = %outer, inner = %inner, "aliasing input");
        self.erase(inner);
        if let Some(&offset) = self.operand_to_temporary.get(&outer) {
            self.operand_to_temporary.insert(inner, offset);
        } else if let Some(memory) = self.dynamic_temporaries.get(&outer).cloned() {
            self.dynamic_temporaries.insert(inner, memory);
        } else if let Some(&position) = self.operand_to_input.get(&outer) {
            self.operand_to_input.insert(inner, position);
        } else if let Some(&position) = self.operand_to_output.get(&outer) {
            self.operand_to_output.insert(inner, position);
        } else if let Some(location) = self.operand_to_constant_reference.get(&outer).cloned() {
            self.operand_to_constant_reference.insert(inner, location);
        } else {
            unreachable!("cannot alias input {inner} from unbound operand {outer}");
        }
        self.alias_dimensions(outer, inner);
    }

    /// Like [`Controller::set_input`], for output aliases: an output can only
    /// live in the arena or in a client-bound output position.
    pub fn set_output(&mut self, outer: SourceOperandIndex, inner: SourceOperandIndex) {
        trace!(outer = %outer, inner = %inner, "aliasing output");
        self.erase(inner);
        if let Some(&offset) = self.operand_to_temporary.get(&outer) {
            self.operand_to_temporary.insert(inner, offset);
        } else if let Some(memory) = self.dynamic_temporaries.get(&outer).cloned() {
            self.dynamic_temporaries.insert(inner, memory);
        } else if let Some(&position) = self.operand_to_output.get(&outer) {
            self.operand_to_output.insert(inner, position);
        } else {
            unreachable!("cannot alias output {inner} from unbound operand {outer}");
        }
        self.alias_dimensions(outer, inner);
    }

    fn erase(&mut self, operand: SourceOperandIndex) {
        self.operand_to_temporary.remove(&operand);
        self.operand_to_input.remove(&operand);
        self.operand_to_output.remove(&operand);
        self.operand_to_constant_reference.remove(&operand);
        self.dynamic_temporaries.remove(&operand);
    }

    fn alias_dimensions(&mut self, outer: SourceOperandIndex, inner: SourceOperandIndex) {
        match self.refined_dimensions.get(&outer).cloned() {
            Some(dimensions) => {
                self.refined_dimensions.insert(inner, dimensions);
            },
            None => {
                self.refined_dimensions.remove(&inner);
            },
        }
    }

    /// Blocks until the previous step's outputs are materialised. A no-op
    /// when the previous step produced no fence.
    pub fn wait_for_last_step_fence(&self) -> Result<(), ExecutionError> {
        if let Some(fence) = &self.last_step_fence
            && fence.wait() == FenceStatus::Error
        {
            return Err(ExecutionError::OpFailed(
                "previous step's sync fence signalled an error".into(),
            ));
        }
        Ok(())
    }
}
