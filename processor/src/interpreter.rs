//! The plan interpreter: advances a controller through a plan one step at a
//! time, handling interpreted control flow between device dispatches.

use std::time::{Duration, Instant};

use tessera_core::{SourceOperandIndex, SyncFence};
use tessera_planner::{ExecutionPlan, IfStep, LogicalStep, PlanBody, WhileStep};
use tracing::{debug, trace, warn};

use crate::{
    ExecutionError,
    argument::Argument,
    controller::{BAD_STEP_INDEX, Controller, WhileStage, WhileState},
    step_executor::{StepExecutor, resolve_operand_location},
};

// INTERPRETER
// ================================================================================================

/// What a call to [`next`] produced.
pub(crate) enum NextOutcome {
    /// An executor for the next step; the caller dispatches it and calls
    /// [`next`] again, feeding back any sync fence the dispatch produced.
    Step(StepExecutor),
    /// The plan has been fully executed.
    Done,
}

/// Everything the interpreter needs besides the controller: the plan itself,
/// the execution's bound arguments, and the execution's time budgets.
pub(crate) struct InterpreterContext<'a> {
    pub plan: &'a ExecutionPlan,
    pub inputs: &'a [Argument],
    pub outputs: &'a [Argument],
    pub loop_timeout: Duration,
    pub deadline: Option<Instant>,
}

/// Advances the controller to the next execution step.
///
/// `fence_of_last_step` is the sync fence produced by the most recently
/// dispatched step (if any); the interpreter waits on it before reading any
/// boolean condition, so fenced dispatch chains stay correct.
pub(crate) fn next(
    ctx: &InterpreterContext<'_>,
    controller: &mut Controller,
    fence_of_last_step: Option<SyncFence>,
) -> Result<NextOutcome, ExecutionError> {
    controller.last_step_fence = fence_of_last_step;
    trace!(next_step = controller.next_step_index, "advancing plan");

    if controller.next_step_index == BAD_STEP_INDEX {
        return Err(ExecutionError::OpFailed("the execution cannot continue".into()));
    }
    if let Some(deadline) = ctx.deadline
        && deadline <= Instant::now()
    {
        warn!("execution deadline overrun during plan interpretation");
        return Err(ExecutionError::MissedDeadlineTransient);
    }

    match ctx.plan.body() {
        PlanBody::Empty => {
            controller.next_step_index = BAD_STEP_INDEX;
            Ok(NextOutcome::Done)
        },
        PlanBody::Simple(simple) => {
            if controller.next_step_index == 0 {
                let executor = StepExecutor::for_whole_model(
                    simple.device.clone(),
                    simple.device_index,
                    simple.model.clone(),
                    simple.prepared.clone(),
                    ctx.inputs,
                    ctx.outputs,
                );
                controller.fallback_next_step_index = 0;
                controller.next_step_index = 1;
                Ok(NextOutcome::Step(executor))
            } else {
                controller.next_step_index = BAD_STEP_INDEX;
                Ok(NextOutcome::Done)
            }
        },
        PlanBody::Compound(_) => next_compound(ctx, controller),
    }
}

fn next_compound(
    ctx: &InterpreterContext<'_>,
    controller: &mut Controller,
) -> Result<NextOutcome, ExecutionError> {
    let steps = ctx.plan.steps();
    loop {
        if controller.next_step_index == BAD_STEP_INDEX {
            return Err(ExecutionError::OpFailed("the execution cannot continue".into()));
        }
        if controller.next_step_index as usize == steps.len() {
            controller.next_step_index = BAD_STEP_INDEX;
            return Ok(NextOutcome::Done);
        }
        match &steps[controller.next_step_index as usize] {
            LogicalStep::Execution(step) => {
                debug!(step = step.index(), device = step.device().name(), "next: execute");
                let executor = StepExecutor::for_step(
                    step,
                    ctx.plan,
                    controller,
                    ctx.inputs,
                    ctx.outputs,
                )?;
                controller.fallback_next_step_index = controller.next_step_index;
                controller.next_step_index += 1;
                return Ok(NextOutcome::Step(executor));
            },
            LogicalStep::If(step) => advance_if(ctx, controller, step)?,
            LogicalStep::While(step) => advance_while(ctx, controller, step)?,
            LogicalStep::Goto(step) => {
                debug!("next: {step}");
                controller.next_step_index = step.target_step_index;
            },
        }
    }
}

// CONTROL FLOW ADVANCEMENT
// ================================================================================================

fn advance_if(
    ctx: &InterpreterContext<'_>,
    controller: &mut Controller,
    step: &IfStep,
) -> Result<(), ExecutionError> {
    debug!("next: {step}");
    // The previous step may still be producing the condition value.
    controller.wait_for_last_step_fence()?;
    let condition = read_condition_value(ctx, controller, step.condition_operand)?;
    debug!(condition, "if condition");

    controller.next_step_index =
        if condition { step.then_step_index } else { step.else_step_index };
    let branch_inputs = if condition { &step.then_branch_inputs } else { &step.else_branch_inputs };
    let branch_outputs =
        if condition { &step.then_branch_outputs } else { &step.else_branch_outputs };
    debug_assert_eq!(branch_inputs.len(), step.outer_inputs.len());
    debug_assert_eq!(branch_outputs.len(), step.outer_outputs.len());

    // Aliases are installed immediately before the branch runs, because an
    // enclosing WHILE may have re-located the outer operands since the last
    // visit (double-buffering).
    for (&outer, &inner) in step.outer_inputs.iter().zip(branch_inputs) {
        controller.set_input(outer, inner);
    }
    for (&outer, &inner) in step.outer_outputs.iter().zip(branch_outputs) {
        controller.set_output(outer, inner);
    }
    Ok(())
}

fn advance_while(
    ctx: &InterpreterContext<'_>,
    controller: &mut Controller,
    step: &WhileStep,
) -> Result<(), ExecutionError> {
    let state = controller.while_state.entry(step.index).or_default();

    match state.stage {
        WhileStage::EvaluateCondition => {
            state.iteration = if state.iteration == WhileState::OUTSIDE_LOOP {
                0
            } else {
                state.iteration + 1
            };
            if state.iteration == 0 {
                state.start_time = Instant::now();
            }
            let iteration = state.iteration;
            state.stage = WhileStage::EvaluateBody;
            debug!(iteration, "next: {step}: evaluating condition");
            controller.next_step_index = step.cond_step_index;

            // Iteration 0 reads the outer inputs; later iterations read the
            // previous body outputs, except for input-only operands beyond
            // the loop-carried prefix.
            let body_output_count = step.body_outputs.len();
            debug_assert_eq!(step.cond_inputs.len(), step.outer_inputs.len());
            for (position, &inner) in step.cond_inputs.iter().enumerate() {
                let input_only = position >= body_output_count;
                let outer = if iteration == 0 || input_only {
                    step.outer_inputs[position]
                } else {
                    step.body_outputs[position]
                };
                controller.set_input(outer, inner);
            }
            Ok(())
        },
        WhileStage::EvaluateBody => {
            let iteration = state.iteration;
            let elapsed = state.start_time.elapsed();
            if elapsed > ctx.loop_timeout {
                warn!(?elapsed, "loop timed out");
                return Err(ExecutionError::MissedDeadlineTransient);
            }
            state.stage = WhileStage::EvaluateCondition;

            controller.wait_for_last_step_fence()?;
            let condition = read_condition_value(ctx, controller, step.cond_output)?;
            if condition {
                debug!(iteration, "next: {step}: evaluating body");
                controller.next_step_index = step.body_step_index;

                debug_assert_eq!(step.body_inputs.len(), step.cond_inputs.len());
                for (&outer, &inner) in step.cond_inputs.iter().zip(&step.body_inputs) {
                    controller.set_input(outer, inner);
                }
                if iteration != 0 {
                    // The body must read last iteration's outputs while
                    // writing this iteration's: exchange the primary and
                    // secondary arena slots, never the bytes.
                    for output in &step.body_outputs {
                        swap_temporary_slots(controller, *output);
                    }
                }
            } else {
                debug!(iteration, "next: {step}: exiting loop");
                controller.next_step_index = step.exit_step_index;

                // The most recent condition inputs hold either the final
                // body outputs or, for a zero-iteration loop, the outer
                // inputs; either way they are the loop's results.
                debug_assert!(step.outer_outputs.len() <= step.cond_inputs.len());
                for (&outer, &inner) in step.outer_outputs.iter().zip(&step.cond_inputs) {
                    copy_operand_value(ctx, controller, inner, outer)?;
                }
                controller
                    .while_state
                    .get_mut(&step.index)
                    .expect("state inserted above")
                    .iteration = WhileState::OUTSIDE_LOOP;
            }
            Ok(())
        },
    }
}

fn swap_temporary_slots(controller: &mut Controller, operand: SourceOperandIndex) {
    debug_assert!(controller.operand_to_temporary.contains_key(&operand));
    debug_assert!(controller.operand_to_temporary2.contains_key(&operand));
    let primary = controller
        .operand_to_temporary
        .get_mut(&operand)
        .expect("loop outputs have a primary slot");
    let secondary = controller
        .operand_to_temporary2
        .get_mut(&operand)
        .expect("loop outputs have a secondary slot");
    std::mem::swap(primary, secondary);
}

// BOUNDARY OPERAND ACCESS
// ================================================================================================

/// Reads a boolean condition from a partition-boundary operand's resolved
/// location.
fn read_condition_value(
    ctx: &InterpreterContext<'_>,
    controller: &mut Controller,
    operand: SourceOperandIndex,
) -> Result<bool, ExecutionError> {
    let argument =
        resolve_operand_location(ctx.plan, controller, ctx.inputs, ctx.outputs, operand, false)?;
    let (memory, offset, _) = argument
        .memory()
        .ok_or_else(|| ExecutionError::BadData(format!("condition operand {operand} unbound")))?;
    let byte = memory
        .read(offset, 1)
        .map_err(|err| ExecutionError::OpFailed(err.to_string()))?[0];
    Ok(byte != 0)
}

/// Copies one boundary operand's bytes to another's location (loop exit).
fn copy_operand_value(
    ctx: &InterpreterContext<'_>,
    controller: &mut Controller,
    from: SourceOperandIndex,
    to: SourceOperandIndex,
) -> Result<(), ExecutionError> {
    let size = ctx
        .plan
        .source_graphs()
        .operand(to)
        .byte_size()
        .expect("control-flow boundary operands are statically sized");
    let source =
        resolve_operand_location(ctx.plan, controller, ctx.inputs, ctx.outputs, from, false)?;
    let target =
        resolve_operand_location(ctx.plan, controller, ctx.inputs, ctx.outputs, to, false)?;
    let (source_memory, source_offset, _) = source
        .memory()
        .ok_or_else(|| ExecutionError::BadData(format!("operand {from} unbound")))?;
    let (target_memory, target_offset, target_length) = target
        .memory()
        .ok_or_else(|| ExecutionError::BadData(format!("operand {to} unbound")))?;
    if target_length < size {
        return Err(ExecutionError::BadData(format!(
            "operand {to} is bound to {target_length} bytes but needs {size}"
        )));
    }
    let bytes = source_memory
        .read(source_offset, size)
        .map_err(|err| ExecutionError::OpFailed(err.to_string()))?;
    target_memory
        .write(target_offset, &bytes)
        .map_err(|err| ExecutionError::OpFailed(err.to_string()))?;
    Ok(())
}
