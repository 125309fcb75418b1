//! The graph partitioner: assigns every operation to its best-fit device and
//! lowers the nested graph structure into a flat execution plan.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use itertools::Itertools;
use tessera_core::{
    Device, Model, PrepareOptions, SourceOperandIndex,
    device::ExecutionPreference,
    operand::OperandLifetime,
    operation::{OperationType, if_op, while_op},
};
use tracing::debug;

use crate::{
    CompileError,
    compilation::{CompilationOptions, PartitioningMode},
    plan::{
        CompoundBody, ConstantCopyLocation, ConstantReferenceLocation, ExecutionPlan,
        MAIN_GRAPH_INDEX, PlanBody, SimpleBody, SourceGraphs,
    },
    step::{ExecutionStep, GotoStep, IfStep, LogicalStep, WhileStep},
    token::TokenHasher,
};

// OPERAND TRACKER
// ================================================================================================

/// Tracks which operands have known values as operations are dispatched, so
/// operations become schedulable exactly when all their inputs are known.
struct OperandTracker<'a> {
    model: &'a Model,
    /// For each operand, the operations consuming it as a not-yet-known
    /// input.
    consumers: BTreeMap<u32, Vec<u32>>,
    /// For each operation, how many of its inputs are still unknown.
    unknown_inputs: Vec<u32>,
}

impl<'a> OperandTracker<'a> {
    /// Builds the tracker and returns the operations that are ready
    /// immediately (every input is a model input or a constant).
    fn new(model: &'a Model) -> (Self, Vec<u32>) {
        let mut consumers: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        let mut unknown_inputs = vec![0u32; model.operation_count() as usize];
        let mut ready = Vec::new();
        for (operation_index, operation) in model.operations().iter().enumerate() {
            let mut count = 0;
            for &input in &operation.inputs {
                let lifetime = model.operand(input).lifetime;
                if matches!(lifetime, OperandLifetime::Temporary | OperandLifetime::GraphOutput) {
                    count += 1;
                    consumers.entry(input).or_default().push(operation_index as u32);
                }
            }
            unknown_inputs[operation_index] = count;
            if count == 0 {
                ready.push(operation_index as u32);
            }
        }
        (Self { model, consumers, unknown_inputs }, ready)
    }

    /// Marks an operation as dispatched; its outputs are now known. Returns
    /// the operations this newly enables.
    fn mark_processed(&mut self, operation_index: u32) -> Vec<u32> {
        let mut enabled = Vec::new();
        for &output in &self.model.operation(operation_index).outputs {
            let Some(consumers) = self.consumers.get(&output) else {
                continue;
            };
            for &consumer in consumers {
                let count = &mut self.unknown_inputs[consumer as usize];
                *count -= 1;
                if *count == 0 {
                    enabled.push(consumer);
                }
            }
        }
        enabled
    }
}

// DEVICE CHOICE
// ================================================================================================

/// Aggregate performance of running every operation of a graph on one device.
fn graph_performance(
    model: &Model,
    device: &Arc<dyn Device>,
    preference: ExecutionPreference,
) -> f32 {
    (0..model.operation_count())
        .map(|index| operation_performance(model, device, index, preference))
        .sum()
}

fn operation_performance(
    model: &Model,
    device: &Arc<dyn Device>,
    operation_index: u32,
    preference: ExecutionPreference,
) -> f32 {
    let operation = model.operation(operation_index);
    let capabilities = device.capabilities();
    match operation.ty {
        OperationType::If => {
            let then_model = referenced(model, operation_index, if_op::THEN_GRAPH_INPUT);
            let else_model = referenced(model, operation_index, if_op::ELSE_GRAPH_INPUT);
            capabilities.if_performance.apply_preference(preference)
                + 0.5
                    * (graph_performance(then_model, device, preference)
                        + graph_performance(else_model, device, preference))
        },
        OperationType::While => {
            let cond_model = referenced(model, operation_index, while_op::CONDITION_GRAPH_INPUT);
            let body_model = referenced(model, operation_index, while_op::BODY_GRAPH_INPUT);
            capabilities.while_performance.apply_preference(preference)
                + graph_performance(cond_model, device, preference)
                + graph_performance(body_model, device, preference)
        },
        _ => {
            // The primary element type is dictated by the first operand.
            let operand = model.operand(operation.inputs[0]);
            let info = match operand.ty {
                tessera_core::OperandType::Float32 if model.is_relaxed_float32_to_float16() => {
                    capabilities.relaxed_float32_to_float16_scalar
                },
                tessera_core::OperandType::TensorFloat32
                    if model.is_relaxed_float32_to_float16() =>
                {
                    capabilities.relaxed_float32_to_float16_tensor
                },
                ty => capabilities.performance(ty),
            };
            info.apply_preference(preference)
        },
    }
}

fn referenced<'a>(model: &'a Model, operation_index: u32, slot: usize) -> &'a Model {
    let operation = model.operation(operation_index);
    let operand = model.operand(operation.inputs[slot]);
    model
        .referenced_model(operand)
        .expect("finished model validated control-flow graph references")
}

/// Whether a control-flow operation touches any operand of unknown size,
/// either directly or through its referenced graphs' external operands.
fn control_flow_has_unknown_size(model: &Model, operation_index: u32) -> bool {
    let operation = model.operation(operation_index);
    let graph_slots: &[usize] = match operation.ty {
        OperationType::If => &[if_op::THEN_GRAPH_INPUT, if_op::ELSE_GRAPH_INPUT],
        OperationType::While => &[while_op::CONDITION_GRAPH_INPUT, while_op::BODY_GRAPH_INPUT],
        _ => return false,
    };
    let own = operation
        .inputs
        .iter()
        .chain(&operation.outputs)
        .any(|&index| {
            let operand = model.operand(index);
            operand.lifetime != OperandLifetime::Subgraph && operand.has_unknown_size()
        });
    own || graph_slots.iter().any(|&slot| {
        let graph = referenced(model, operation_index, slot);
        graph
            .input_indexes()
            .iter()
            .chain(graph.output_indexes())
            .any(|&index| graph.operand(index).has_unknown_size())
    })
}

/// Whether an operation can be handed to the plan interpreter instead of a
/// device.
fn supported_by_interpreter(model: &Model, operation_index: u32) -> bool {
    model.operation(operation_index).ty.is_control_flow()
        && !control_flow_has_unknown_size(model, operation_index)
}

/// For each operation of the graph, the index of the device it should run on,
/// or `devices.len()` for control flow handed to the plan interpreter.
fn find_best_device_for_each_operation(
    model: &Model,
    graph_index: u32,
    devices: &[Arc<dyn Device>],
    preference: ExecutionPreference,
) -> Result<Vec<u32>, CompileError> {
    let supported: Vec<Vec<bool>> =
        devices.iter().map(|device| device.supported_operations(model)).collect();
    let fallback_index = devices.len() - 1;
    let interpreter_index = devices.len() as u32;

    let mut best = Vec::with_capacity(model.operation_count() as usize);
    for operation_index in 0..model.operation_count() {
        let operation = model.operation(operation_index);
        let choice = if control_flow_has_unknown_size(model, operation_index) {
            // Dynamically-sized control flow cannot cross a partition
            // boundary; it must run whole on the fallback device.
            supported[fallback_index][operation_index as usize].then_some(fallback_index as u32)
        } else {
            let mut choice: Option<(u32, f32)> = None;
            for (device_index, device) in devices.iter().enumerate() {
                if !supported[device_index][operation_index as usize] {
                    debug!(
                        device = device.name(),
                        operation = %operation.ty,
                        "device cannot execute operation"
                    );
                    continue;
                }
                let perf = operation_performance(model, device, operation_index, preference);
                let better = match choice {
                    None => true,
                    Some((_, best_perf)) => {
                        perf < best_perf || (perf == best_perf && device_index == fallback_index)
                    },
                };
                if better {
                    choice = Some((device_index as u32, perf));
                }
            }
            choice.map(|(device_index, _)| device_index)
        };

        let Some(device_index) = choice else {
            return Err(CompileError::UnsupportedOperation {
                graph: graph_index,
                ty: operation.ty,
            });
        };
        if device_index as usize == fallback_index
            && supported_by_interpreter(model, operation_index)
        {
            // Run the control flow on the plan interpreter and give the
            // referenced graphs their own chance at better devices.
            best.push(interpreter_index);
        } else {
            best.push(device_index);
        }
        debug!(
            graph = graph_index,
            operation = %operation.ty,
            device = best.last().copied(),
            "operation assigned"
        );
    }
    Ok(best)
}

// PARTITIONING
// ================================================================================================

struct PlanState {
    steps: Vec<LogicalStep>,
    source_graphs: SourceGraphs,
    /// Source temporaries -> the execution step that defines them. Only
    /// temporaries defined by execution steps appear here.
    temp_definitions: BTreeMap<SourceOperandIndex, u32>,
}

/// Partitions a finished model across the device list and compiles every
/// resulting step, yielding the finalised plan.
pub(crate) fn partition(
    model: &Arc<Model>,
    devices: &[Arc<dyn Device>],
    options: &CompilationOptions,
) -> Result<ExecutionPlan, CompileError> {
    if devices.is_empty() {
        return Err(CompileError::NoDevices);
    }
    let mut source_graphs = SourceGraphs::default();
    let main_index = source_graphs.add_model(Arc::clone(model));
    debug_assert_eq!(main_index, MAIN_GRAPH_INDEX);

    if model.is_empty() {
        return Ok(ExecutionPlan::new(PlanBody::Empty, source_graphs, devices.to_vec()));
    }

    let best =
        find_best_device_for_each_operation(model, MAIN_GRAPH_INDEX, devices, options.preference)?;
    let interpreter_index = devices.len() as u32;

    // If a single device will run every operation there is nothing to split.
    // The shortcut does not apply to interpreted control flow, which always
    // needs a compound plan.
    if best.iter().all_equal() && best[0] != interpreter_index {
        let device_index = best[0];
        debug!(device = devices[device_index as usize].name(), "single best device; simple plan");
        return simple_plan(
            Arc::clone(model),
            Arc::clone(&devices[device_index as usize]),
            device_index,
            source_graphs,
            devices,
            options,
        );
    }

    let mut state = PlanState {
        steps: Vec::new(),
        source_graphs,
        temp_definitions: BTreeMap::new(),
    };
    partition_graph(&mut state, model, MAIN_GRAPH_INDEX, devices, options)?;
    finish_compound(state, model, devices, options)
}

/// Creates (and compiles) a simple plan running the whole model on one
/// device. Also used for full fallback and for disabled partitioning.
pub(crate) fn simple_plan(
    model: Arc<Model>,
    device: Arc<dyn Device>,
    device_index: u32,
    source_graphs: SourceGraphs,
    devices: &[Arc<dyn Device>],
    options: &CompilationOptions,
) -> Result<ExecutionPlan, CompileError> {
    let mut token = TokenHasher::new(options.cache_token.as_ref());
    token.update_str(device.name());
    token.update_str(device.version());
    token.update_u32(options.preference as u32);
    token.update_u32(options.priority as u32);
    let cache_token = token.finish();

    let prepare_options = PrepareOptions {
        preference: options.preference,
        priority: options.priority,
        deadline: options.deadline,
        cache_dir: options.cache_dir.clone(),
        cache_token: if device.is_caching_supported() { cache_token } else { None },
    };
    let prepared = device.prepare(&model, &prepare_options).map_err(|source| {
        CompileError::PrepareFailed { device: device.name().to_string(), source }
    })?;
    Ok(ExecutionPlan::new(
        PlanBody::Simple(SimpleBody { device, device_index, model, prepared, cache_token }),
        source_graphs,
        devices.to_vec(),
    ))
}

/// Lowers one graph into plan steps, recursing into graphs referenced by
/// interpreted control flow.
fn partition_graph(
    state: &mut PlanState,
    model: &Arc<Model>,
    graph_index: u32,
    devices: &[Arc<dyn Device>],
    options: &CompilationOptions,
) -> Result<(), CompileError> {
    let best = find_best_device_for_each_operation(model, graph_index, devices, options.preference)?;
    let interpreter_index = devices.len();

    // One FIFO queue of schedulable operations per device, plus one for
    // interpreted control flow.
    let mut queues: Vec<VecDeque<u32>> = vec![VecDeque::new(); devices.len() + 1];
    let (mut tracker, ready) = OperandTracker::new(model);
    for operation_index in ready {
        queues[best[operation_index as usize] as usize].push_back(operation_index);
    }

    loop {
        // Drain the non-empty queue of highest index next: the control-flow
        // queue first, then devices from the back of the list, so that
        // earlier-listed devices accumulate context for later ones.
        let Some(queue_index) = (0..queues.len()).rev().find(|&i| !queues[i].is_empty()) else {
            break;
        };

        if queue_index != interpreter_index {
            // Everything currently schedulable on this device becomes a
            // single new execution step, including operations enabled while
            // the step is being filled.
            let step_index = state.steps.len() as u32;
            let mut step = ExecutionStep::new(
                step_index,
                graph_index,
                Arc::clone(&devices[queue_index]),
                queue_index as u32,
                options.cache_token.as_ref(),
            );
            while let Some(operation_index) = queues[queue_index].pop_front() {
                step.add_operation(operation_index, model, &mut state.temp_definitions)?;
                for enabled in tracker.mark_processed(operation_index) {
                    queues[best[enabled as usize] as usize].push_back(enabled);
                }
            }
            state.steps.push(LogicalStep::Execution(step));
        } else {
            while let Some(operation_index) = queues[interpreter_index].pop_front() {
                lower_control_flow(state, model, graph_index, operation_index, devices, options)?;
                for enabled in tracker.mark_processed(operation_index) {
                    queues[best[enabled as usize] as usize].push_back(enabled);
                }
            }
        }
    }
    Ok(())
}

/// Emits the plan structure for one interpreted IF or WHILE operation and
/// recursively partitions the graphs it references.
fn lower_control_flow(
    state: &mut PlanState,
    model: &Arc<Model>,
    graph_index: u32,
    operation_index: u32,
    devices: &[Arc<dyn Device>],
    options: &CompilationOptions,
) -> Result<(), CompileError> {
    let operation = model.operation(operation_index).clone();
    match operation.ty {
        OperationType::If => {
            let then_model =
                Arc::clone(model.referenced_model(model.operand(operation.inputs[if_op::THEN_GRAPH_INPUT])).expect("validated"));
            let else_model =
                Arc::clone(model.referenced_model(model.operand(operation.inputs[if_op::ELSE_GRAPH_INPUT])).expect("validated"));
            let then_graph = state.source_graphs.add_model(Arc::clone(&then_model));
            let else_graph = state.source_graphs.add_model(Arc::clone(&else_model));

            let if_index = state.steps.len() as u32;
            state.steps.push(LogicalStep::If(IfStep::new(if_index)));

            let then_step_index = state.steps.len() as u32;
            partition_graph(state, &then_model, then_graph, devices, options)?;
            let goto_index = state.steps.len() as u32;
            state
                .steps
                .push(LogicalStep::Goto(GotoStep { index: goto_index, target_step_index: 0 }));
            let else_step_index = state.steps.len() as u32;
            partition_graph(state, &else_model, else_graph, devices, options)?;
            let after_if = state.steps.len() as u32;

            if let LogicalStep::Goto(goto) = &mut state.steps[goto_index as usize] {
                goto.target_step_index = after_if;
            }
            let LogicalStep::If(if_step) = &mut state.steps[if_index as usize] else {
                unreachable!("slot {if_index} holds the IfStep pushed above");
            };
            if_step.then_step_index = then_step_index;
            if_step.else_step_index = else_step_index;
            if_step.condition_operand =
                SourceOperandIndex::new(graph_index, operation.inputs[if_op::CONDITION_INPUT]);
            if_step.outer_inputs = operation.inputs[if_op::FIRST_OUTER_INPUT..]
                .iter()
                .map(|&operand| SourceOperandIndex::new(graph_index, operand))
                .collect();
            if_step.outer_outputs = operation
                .outputs
                .iter()
                .map(|&operand| SourceOperandIndex::new(graph_index, operand))
                .collect();
            if_step.then_branch_inputs = graph_io(&then_model, then_graph, true);
            if_step.then_branch_outputs = graph_io(&then_model, then_graph, false);
            if_step.else_branch_inputs = graph_io(&else_model, else_graph, true);
            if_step.else_branch_outputs = graph_io(&else_model, else_graph, false);
        },
        OperationType::While => {
            let cond_model = Arc::clone(
                model
                    .referenced_model(model.operand(operation.inputs[while_op::CONDITION_GRAPH_INPUT]))
                    .expect("validated"),
            );
            let body_model = Arc::clone(
                model
                    .referenced_model(model.operand(operation.inputs[while_op::BODY_GRAPH_INPUT]))
                    .expect("validated"),
            );
            let cond_graph = state.source_graphs.add_model(Arc::clone(&cond_model));
            let body_graph = state.source_graphs.add_model(Arc::clone(&body_model));

            let while_index = state.steps.len() as u32;
            state.steps.push(LogicalStep::While(WhileStep::new(while_index)));

            let cond_step_index = state.steps.len() as u32;
            partition_graph(state, &cond_model, cond_graph, devices, options)?;
            state.steps.push(LogicalStep::Goto(GotoStep {
                index: state.steps.len() as u32,
                target_step_index: while_index,
            }));
            let body_step_index = state.steps.len() as u32;
            partition_graph(state, &body_model, body_graph, devices, options)?;
            state.steps.push(LogicalStep::Goto(GotoStep {
                index: state.steps.len() as u32,
                target_step_index: while_index,
            }));
            let exit_step_index = state.steps.len() as u32;

            let LogicalStep::While(while_step) = &mut state.steps[while_index as usize] else {
                unreachable!("slot {while_index} holds the WhileStep pushed above");
            };
            while_step.cond_step_index = cond_step_index;
            while_step.body_step_index = body_step_index;
            while_step.exit_step_index = exit_step_index;
            while_step.outer_inputs = operation.inputs[while_op::FIRST_OUTER_INPUT..]
                .iter()
                .map(|&operand| SourceOperandIndex::new(graph_index, operand))
                .collect();
            while_step.outer_outputs = operation
                .outputs
                .iter()
                .map(|&operand| SourceOperandIndex::new(graph_index, operand))
                .collect();
            while_step.cond_inputs = graph_io(&cond_model, cond_graph, true);
            while_step.cond_output =
                SourceOperandIndex::new(cond_graph, cond_model.output_operand_index(0));
            while_step.body_inputs = graph_io(&body_model, body_graph, true);
            while_step.body_outputs = graph_io(&body_model, body_graph, false);
        },
        other => unreachable!("{other} is not a control-flow operation"),
    }
    Ok(())
}

fn graph_io(model: &Model, graph_index: u32, inputs: bool) -> Vec<SourceOperandIndex> {
    let indexes = if inputs { model.input_indexes() } else { model.output_indexes() };
    indexes
        .iter()
        .map(|&operand| SourceOperandIndex::new(graph_index, operand))
        .collect()
}

// FINISHING
// ================================================================================================

fn finish_compound(
    state: PlanState,
    main_model: &Arc<Model>,
    devices: &[Arc<dyn Device>],
    options: &CompilationOptions,
) -> Result<ExecutionPlan, CompileError> {
    let PlanState { mut steps, source_graphs, temp_definitions } = state;

    // A temporary consumed by any later partition (or read by interpreted
    // control flow) must become an output of the step that defines it.
    let mut temps_to_record: Vec<(u32, u32)> = Vec::new();
    {
        let mut record = |index: SourceOperandIndex| {
            if let Some(&step) = temp_definitions.get(&index) {
                temps_to_record.push((step, index.operand));
            }
        };
        for step in &steps {
            match step {
                LogicalStep::Execution(step) => {
                    for &(source_operand, _) in step.temps_as_step_inputs() {
                        record(SourceOperandIndex::new(step.source_graph(), source_operand));
                    }
                },
                LogicalStep::If(step) => {
                    record(step.condition_operand);
                    for &operand in &step.outer_inputs {
                        record(operand);
                    }
                },
                LogicalStep::While(step) => {
                    for &operand in &step.outer_inputs {
                        record(operand);
                    }
                },
                LogicalStep::Goto(_) => {},
            }
        }
    }
    for (step_index, source_operand) in temps_to_record {
        steps[step_index as usize]
            .as_execution_mut()
            .expect("temporaries are defined by execution steps")
            .record_temp_as_step_output(source_operand);
    }

    // Fix each step model's external orderings and compile it on its device.
    let prepare_options = PrepareOptions {
        preference: options.preference,
        priority: options.priority,
        deadline: options.deadline,
        cache_dir: options.cache_dir.clone(),
        cache_token: None,
    };
    let mut has_dynamic_step_outputs = false;
    for step in &mut steps {
        if let Some(step) = step.as_execution_mut() {
            has_dynamic_step_outputs |= step.finish(main_model, &prepare_options)?;
        }
    }
    if has_dynamic_step_outputs && options.partitioning == PartitioningMode::WithoutFallback {
        return Err(CompileError::DynamicOutputNotAllowed);
    }

    // Control-flow boundary operands are statically sized: the device chooser
    // forces dynamically-sized control flow onto the fallback device, where
    // it runs inside an execution step instead.
    #[cfg(debug_assertions)]
    for step in &steps {
        let boundaries: Vec<&SourceOperandIndex> = match step {
            LogicalStep::If(step) => step
                .outer_inputs
                .iter()
                .chain(&step.outer_outputs)
                .chain(&step.then_branch_inputs)
                .chain(&step.then_branch_outputs)
                .chain(&step.else_branch_inputs)
                .chain(&step.else_branch_outputs)
                .collect(),
            LogicalStep::While(step) => step
                .outer_inputs
                .iter()
                .chain(&step.outer_outputs)
                .chain(&step.cond_inputs)
                .chain(&step.body_inputs)
                .chain(&step.body_outputs)
                .collect(),
            _ => Vec::new(),
        };
        for operand in boundaries {
            debug_assert!(
                !source_graphs.operand(*operand).has_unknown_size(),
                "control-flow boundary operand {operand} has unknown size"
            );
        }
    }

    let mut input_positions = BTreeMap::new();
    for (position, &operand) in main_model.input_indexes().iter().enumerate() {
        input_positions
            .insert(SourceOperandIndex::new(MAIN_GRAPH_INDEX, operand), position as u32);
    }
    let mut output_positions = BTreeMap::new();
    for (position, &operand) in main_model.output_indexes().iter().enumerate() {
        output_positions
            .insert(SourceOperandIndex::new(MAIN_GRAPH_INDEX, operand), position as u32);
    }

    // Constants feeding control flow across a partition boundary need a
    // location an execution can bind: inline copies move through the arena,
    // by-reference constants are read in place.
    let mut boundary_constant_copies = BTreeMap::new();
    let mut boundary_constant_references = BTreeMap::new();
    {
        let mut handle = |index: SourceOperandIndex| {
            let model = source_graphs.model(index.graph);
            let operand = model.operand(index.operand);
            match operand.lifetime {
                OperandLifetime::ConstantCopy => {
                    let bytes = model
                        .operand_value(operand)
                        .expect("constant-copy operand has a pool window")
                        .to_vec();
                    boundary_constant_copies
                        .insert(index, ConstantCopyLocation { bytes });
                },
                OperandLifetime::ConstantReference => {
                    let (memory, offset, length) = model
                        .constant_reference(operand)
                        .expect("constant-reference operand has a region");
                    boundary_constant_references.insert(
                        index,
                        ConstantReferenceLocation { memory: Arc::clone(memory), offset, length },
                    );
                },
                _ => {},
            }
        };
        for step in &steps {
            match step {
                LogicalStep::If(step) => {
                    handle(step.condition_operand);
                    for &operand in &step.outer_inputs {
                        handle(operand);
                    }
                },
                LogicalStep::While(step) => {
                    for &operand in &step.outer_inputs {
                        handle(operand);
                    }
                },
                _ => {},
            }
        }
    }

    Ok(ExecutionPlan::new(
        PlanBody::Compound(CompoundBody {
            steps,
            input_positions,
            output_positions,
            boundary_constant_copies,
            boundary_constant_references,
            has_dynamic_step_outputs,
        }),
        source_graphs,
        devices.to_vec(),
    ))
}
