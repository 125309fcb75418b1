//! Dispatch of a single execution step to a back-end, including dynamic
//! output-shape propagation and re-compilation on the fallback device.

use std::{sync::Arc, time::Duration};

use tessera_core::{
    Device, DeviceError, ExecuteConfig, ExecuteOutcome, Memory, Model, OutputShape,
    PrepareOptions, PreparedModel, Request, RequestArgument, SourceOperandIndex, SyncFence,
    device::{BurstSession, ExecutionPreference, FencedOutcome, Priority},
    operand::byte_size_of,
};
use tessera_planner::{ExecutionPlan, ExecutionStep};
use tracing::{debug, warn};

use crate::{
    ExecutionError,
    argument::{Argument, ArgumentState},
    controller::Controller,
};

// LOCATION RESOLUTION
// ================================================================================================

/// Resolves a partition-boundary operand to a bound argument, consulting the
/// controller's maps in priority order: temporaries arena, dynamic
/// temporaries, main-model inputs, main-model outputs, boundary constants.
///
/// When `allocate_dynamic` is set and the operand is an unknown-size
/// temporary with no region yet, a region is allocated from its refined
/// shape (or left empty until the producing step reports one).
pub(crate) fn resolve_operand_location(
    plan: &ExecutionPlan,
    controller: &mut Controller,
    execution_inputs: &[Argument],
    execution_outputs: &[Argument],
    index: SourceOperandIndex,
    allocate_dynamic: bool,
) -> Result<Argument, ExecutionError> {
    let operand = plan.source_graphs().operand(index);
    let dimensions = controller
        .refined_dimensions
        .get(&index)
        .cloned()
        .unwrap_or_else(|| operand.dimensions.to_vec());

    if let Some(&offset) = controller.operand_to_temporary.get(&index) {
        let length = operand.byte_size().expect("arena slots have static sizes");
        let arena = controller.arena.as_ref().expect("arena exists when slots do");
        return Ok(Argument {
            state: ArgumentState::Memory { memory: Arc::clone(arena), offset, length },
            dimensions,
        });
    }
    if let Some(memory) = controller.dynamic_temporaries.get(&index) {
        let length = memory.size();
        return Ok(Argument {
            state: ArgumentState::Memory { memory: Arc::clone(memory), offset: 0, length },
            dimensions,
        });
    }
    if let Some(&position) = controller.operand_to_input.get(&index) {
        return Ok(execution_inputs[position as usize].clone());
    }
    if let Some(&position) = controller.operand_to_output.get(&index) {
        return Ok(execution_outputs[position as usize].clone());
    }
    if let Some(location) = controller.operand_to_constant_reference.get(&index) {
        return Ok(Argument {
            state: ArgumentState::Memory {
                memory: Arc::clone(&location.memory),
                offset: location.offset,
                length: location.length,
            },
            dimensions,
        });
    }
    if allocate_dynamic {
        // First write to an unknown-size temporary: size it from the refined
        // shape if one is known, otherwise start empty and let the producing
        // step report the required size.
        let length = byte_size_of(operand.ty, &dimensions).unwrap_or(0);
        let memory = Memory::allocate(length);
        controller.dynamic_temporaries.insert(index, Arc::clone(&memory));
        return Ok(Argument {
            state: ArgumentState::Memory { memory, offset: 0, length },
            dimensions,
        });
    }
    Err(ExecutionError::BadData(format!("operand {index} has no bound location")))
}

// STEP EXECUTOR
// ================================================================================================

/// Packages one step's bound inputs and outputs and dispatches them to the
/// step's prepared artifact.
pub struct StepExecutor {
    device: Arc<dyn Device>,
    device_index: u32,
    model: Arc<Model>,
    prepared: Arc<dyn PreparedModel>,
    inputs: Vec<Argument>,
    outputs: Vec<Argument>,
    /// Source operand behind each output; `None` for whole-model executors.
    output_sources: Vec<Option<SourceOperandIndex>>,
    /// Step-model output position -> main-model output position, for the
    /// prefix of outputs that are main-model outputs.
    output_index_to_main: Vec<u32>,
    /// Index of the step in the plan; `None` for whole-model executors.
    step_index: Option<u32>,
}

impl StepExecutor {
    /// Builds an executor for one compound-plan step, resolving every step
    /// model input and output location through the controller.
    pub(crate) fn for_step(
        step: &ExecutionStep,
        plan: &ExecutionPlan,
        controller: &mut Controller,
        execution_inputs: &[Argument],
        execution_outputs: &[Argument],
    ) -> Result<Self, ExecutionError> {
        let mut inputs = Vec::with_capacity(step.step_model_inputs().len());
        for &(source_operand, _) in step.step_model_inputs() {
            let index = SourceOperandIndex::new(step.source_graph(), source_operand);
            inputs.push(resolve_operand_location(
                plan,
                controller,
                execution_inputs,
                execution_outputs,
                index,
                false,
            )?);
        }
        let mut outputs = Vec::with_capacity(step.step_model_outputs().len());
        let mut output_sources = Vec::with_capacity(step.step_model_outputs().len());
        for &(source_operand, _) in step.step_model_outputs() {
            let index = SourceOperandIndex::new(step.source_graph(), source_operand);
            outputs.push(resolve_operand_location(
                plan,
                controller,
                execution_inputs,
                execution_outputs,
                index,
                true,
            )?);
            output_sources.push(Some(index));
        }
        Ok(Self {
            device: Arc::clone(step.device()),
            device_index: step.device_index(),
            model: Arc::clone(step.model()),
            prepared: Arc::clone(step.prepared()),
            inputs,
            outputs,
            output_sources,
            output_index_to_main: step.output_index_step_to_main().to_vec(),
            step_index: Some(step.index()),
        })
    }

    /// Builds an executor covering a whole model with the execution's own
    /// argument bindings (simple plans and full fallback).
    pub(crate) fn for_whole_model(
        device: Arc<dyn Device>,
        device_index: u32,
        model: Arc<Model>,
        prepared: Arc<dyn PreparedModel>,
        execution_inputs: &[Argument],
        execution_outputs: &[Argument],
    ) -> Self {
        let output_count = execution_outputs.len();
        Self {
            device,
            device_index,
            model,
            prepared,
            inputs: execution_inputs.to_vec(),
            outputs: execution_outputs.to_vec(),
            output_sources: vec![None; output_count],
            output_index_to_main: (0..output_count as u32).collect(),
            step_index: None,
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub(crate) fn step_index(&self) -> Option<u32> {
        self.step_index
    }

    fn build_request(&self) -> Result<Request, DeviceError> {
        let mut pools: Vec<Arc<Memory>> = Vec::new();
        let mut intern = |memory: &Arc<Memory>| -> u32 {
            if let Some(index) = pools.iter().position(|pool| Arc::ptr_eq(pool, memory)) {
                return index as u32;
            }
            pools.push(Arc::clone(memory));
            (pools.len() - 1) as u32
        };
        let mut convert = |argument: &Argument| -> Result<RequestArgument, DeviceError> {
            match &argument.state {
                ArgumentState::Unspecified => {
                    Err(DeviceError::BadData("argument was never bound".into()))
                },
                ArgumentState::NoValue => Ok(RequestArgument::NoValue),
                ArgumentState::Memory { memory, offset, length } => Ok(RequestArgument::Pool {
                    pool: intern(memory),
                    offset: *offset,
                    length: *length,
                    dimensions: argument.dimensions.clone(),
                }),
            }
        };
        let inputs =
            self.inputs.iter().map(&mut convert).collect::<Result<Vec<_>, _>>()?;
        let outputs =
            self.outputs.iter().map(&mut convert).collect::<Result<Vec<_>, _>>()?;
        Ok(Request { inputs, outputs, pools })
    }

    /// Dispatches the step synchronously.
    pub(crate) fn compute(
        &self,
        config: &ExecuteConfig,
        burst: Option<&dyn BurstSession>,
    ) -> Result<ExecuteOutcome, DeviceError> {
        let request = self.build_request()?;
        self.prepared.execute(&request, config, burst)
    }

    /// Dispatches the step with a sync fence, waiting on the previous step's
    /// fence inside the back-end.
    pub(crate) fn compute_fenced(
        &self,
        config: &ExecuteConfig,
        wait_for: &[SyncFence],
        timeout_after_fence: Option<Duration>,
    ) -> Result<FencedOutcome, DeviceError> {
        let request = self.build_request()?;
        self.prepared.execute_fenced(&request, config, wait_for, timeout_after_fence)
    }

    /// Re-compiles this executor's model on the fallback device and runs it
    /// there, staging any device-opaque memory through host-visible copies.
    pub(crate) fn compute_on_fallback(
        &mut self,
        fallback_device: &Arc<dyn Device>,
        fallback_device_index: u32,
        config: &ExecuteConfig,
    ) -> Result<ExecuteOutcome, DeviceError> {
        debug!(device = fallback_device.name(), "re-compiling step on fallback device");
        let options = PrepareOptions {
            preference: ExecutionPreference::FastSingleAnswer,
            priority: Priority::default(),
            ..Default::default()
        };
        self.prepared = fallback_device.prepare(&self.model, &options)?;
        self.device = Arc::clone(fallback_device);
        self.device_index = fallback_device_index;

        let mut request = self.build_request()?;

        // The fallback back-end cannot address device-opaque pools; move
        // their contents through host blobs and write back what the step
        // produces.
        let mut write_back: Vec<(usize, Arc<Memory>)> = Vec::new();
        let output_pools: Vec<u32> = request
            .outputs
            .iter()
            .filter_map(|argument| match argument {
                RequestArgument::Pool { pool, .. } => Some(*pool),
                RequestArgument::NoValue => None,
            })
            .collect();
        for (pool_index, pool) in request.pools.clone().iter().enumerate() {
            if let Some(buffer) = pool.device_buffer() {
                let host = Memory::from_bytes(buffer.read_to_vec()?);
                request.pools[pool_index] = Arc::clone(&host);
                if output_pools.contains(&(pool_index as u32)) {
                    write_back.push((pool_index, host));
                }
            }
        }

        let outcome = self.prepared.execute(&request, config, None)?;

        for (pool_index, host) in write_back {
            let Some(original) = self.find_pool(pool_index) else {
                continue;
            };
            let buffer = original.device_buffer().expect("pool was opaque");
            let bytes = host
                .read(0, host.size())
                .map_err(|err| DeviceError::OpFailed(err.to_string()))?;
            buffer.write_all(&bytes)?;
        }
        Ok(outcome)
    }

    /// The argument memories, in the same pool order `build_request` uses.
    fn find_pool(&self, pool_index: usize) -> Option<Arc<Memory>> {
        let request = self.build_request().ok()?;
        request.pools.get(pool_index).cloned()
    }

    /// Folds a step's reported output shapes into the execution's global
    /// output-shape vector. Only unspecified dimensions may be refined; a
    /// conflicting overwrite of a fully-specified dimension is fatal.
    pub(crate) fn update_output_shapes(
        &self,
        from: &[OutputShape],
        to: &mut [OutputShape],
    ) -> Result<(), ExecutionError> {
        if from.is_empty() {
            return Ok(());
        }
        for (position, &main_position) in self.output_index_to_main.iter().enumerate() {
            let Some(reported) = from.get(position) else {
                break;
            };
            let target = &mut to[main_position as usize];
            check_updatable(&target.dimensions, &reported.dimensions)?;
            *target = reported.clone();
        }
        Ok(())
    }

    /// Records every reported output shape against its source operand, so
    /// downstream steps dispatch with refined input shapes.
    pub(crate) fn record_refined_shapes(
        &self,
        controller: &mut Controller,
        shapes: &[OutputShape],
    ) {
        for (position, shape) in shapes.iter().enumerate() {
            if let Some(Some(source)) = self.output_sources.get(position)
                && !shape.dimensions.is_empty()
            {
                controller.refined_dimensions.insert(*source, shape.dimensions.clone());
            }
        }
    }

    /// Grows the dynamic temporaries behind insufficient outputs and rebinds
    /// them, returning false if any insufficient output is not a resizable
    /// temporary (the client must resize those).
    pub(crate) fn grow_insufficient_temporaries(
        &mut self,
        plan: &ExecutionPlan,
        controller: &mut Controller,
        shapes: &[OutputShape],
    ) -> Result<bool, ExecutionError> {
        for (position, shape) in shapes.iter().enumerate() {
            if shape.is_sufficient {
                continue;
            }
            let Some(Some(source)) = self.output_sources.get(position) else {
                return Ok(false);
            };
            if !controller.dynamic_temporaries.contains_key(source) {
                return Ok(false);
            }
            let operand = plan.source_graphs().operand(*source);
            let Some(length) = byte_size_of(operand.ty, &shape.dimensions) else {
                return Ok(false);
            };
            warn!(operand = %source, length, "growing dynamic temporary");
            let memory = Memory::allocate(length);
            controller.dynamic_temporaries.insert(*source, Arc::clone(&memory));
            controller.refined_dimensions.insert(*source, shape.dimensions.clone());
            self.outputs[position] = Argument {
                state: ArgumentState::Memory { memory, offset: 0, length },
                dimensions: shape.dimensions.clone(),
            };
        }
        Ok(true)
    }
}

fn check_updatable(current: &[u32], reported: &[u32]) -> Result<(), ExecutionError> {
    if current.is_empty() {
        return Ok(());
    }
    if current.len() != reported.len() {
        return Err(ExecutionError::OpFailed(format!(
            "back-end reported rank {} for an output of rank {}",
            reported.len(),
            current.len()
        )));
    }
    for (&current, &reported) in current.iter().zip(reported) {
        if current != 0 && current != reported {
            return Err(ExecutionError::OpFailed(format!(
                "back-end reported dimension {reported} for a fully-specified dimension {current}"
            )));
        }
    }
    Ok(())
}
