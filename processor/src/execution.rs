//! The client-facing execution front-end: argument binding, the partitioned
//! compute loop with partial and full fallback, and the asynchronous, fenced,
//! and burst entry points.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tessera_core::{
    DeviceError, ExecuteConfig, FenceStatus, Memory, Model, OutputShape, PrepareOptions,
    SyncFence, Timing,
    device::{BurstSession, ExecutionPreference, MAX_LOOP_TIMEOUT, DEFAULT_LOOP_TIMEOUT, Priority},
};
use tessera_planner::{Compilation, ExecutionPlan, PartitioningMode, PlanBody};
use tracing::{debug, warn};

use crate::{
    ExecutionError,
    argument::Argument,
    controller::Controller,
    interpreter::{self, InterpreterContext, NextOutcome},
    step_executor::StepExecutor,
};

// COMPLETION
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Success,
    OutputInsufficientSize,
    OtherError,
}

/// How many times a step is re-dispatched after growing its dynamic
/// temporaries before the failure is surfaced.
const MAX_TEMPORARY_GROWTH_RETRIES: u32 = 3;

// BURST SESSIONS
// ================================================================================================

/// Burst sessions opened against the plan's prepared artifacts, one per
/// execution step (where the device offers one).
struct BurstSessions {
    simple: Option<Arc<dyn BurstSession>>,
    per_step: Vec<Option<Arc<dyn BurstSession>>>,
}

impl BurstSessions {
    fn new(plan: &ExecutionPlan) -> Self {
        match plan.body() {
            PlanBody::Simple(simple) => Self {
                simple: simple.prepared.configure_burst(false),
                per_step: Vec::new(),
            },
            PlanBody::Compound(compound) => Self {
                simple: None,
                per_step: compound
                    .steps
                    .iter()
                    .map(|step| {
                        step.as_execution()
                            .and_then(|step| step.prepared().configure_burst(false))
                    })
                    .collect(),
            },
            PlanBody::Empty => Self { simple: None, per_step: Vec::new() },
        }
    }

    fn session_for(&self, step_index: Option<u32>) -> Option<&dyn BurstSession> {
        let session = match step_index {
            None => &self.simple,
            Some(index) => self.per_step.get(index as usize)?,
        };
        session.as_deref()
    }
}

// EXECUTION
// ================================================================================================

/// One execution of a compiled model.
///
/// Bind every input and output, then drive the plan exactly once through one
/// of [`Execution::compute`], [`Execution::compute_async`],
/// [`Execution::compute_fenced`], or [`Execution::compute_burst`]. Output
/// shapes are queryable once the execution has finished.
pub struct Execution {
    plan: Arc<ExecutionPlan>,
    main_model: Arc<Model>,
    allow_fallback: bool,
    inputs: Vec<Argument>,
    outputs: Vec<Argument>,
    measure_timing: bool,
    timeout: Option<Duration>,
    loop_timeout: Duration,
    started: bool,
    completion: Option<Completion>,
    output_shapes: Vec<OutputShape>,
    timing: Timing,
}

impl Execution {
    /// Creates an execution of a finished compilation.
    pub fn new(compilation: &Compilation) -> Result<Self, ExecutionError> {
        let plan = compilation
            .plan()
            .map_err(|_| ExecutionError::BadState("the compilation has not been finished".into()))?;
        let main_model = Arc::clone(compilation.model());
        let input_count = main_model.input_count() as usize;
        let output_count = main_model.output_count() as usize;
        Ok(Self {
            plan: Arc::clone(plan),
            main_model,
            allow_fallback: compilation.options().partitioning == PartitioningMode::WithFallback,
            inputs: vec![Argument::unspecified(); input_count],
            outputs: vec![Argument::unspecified(); output_count],
            measure_timing: false,
            timeout: None,
            loop_timeout: DEFAULT_LOOP_TIMEOUT,
            started: false,
            completion: None,
            output_shapes: Vec::new(),
            timing: Timing::default(),
        })
    }

    // ARGUMENT BINDING
    // --------------------------------------------------------------------------------------------

    /// Binds an input from a host slice; the bytes are staged through an
    /// execution-owned memory region.
    pub fn set_input(&mut self, index: u32, data: &[u8]) -> Result<(), ExecutionError> {
        self.set_input_with_dims(index, data, &[])
    }

    pub fn set_input_with_dims(
        &mut self,
        index: u32,
        data: &[u8],
        dimensions: &[u32],
    ) -> Result<(), ExecutionError> {
        self.check_not_started()?;
        self.check_input_index(index)?;
        let operand = self.main_model.input_operand(index).clone();
        let memory = Memory::from_bytes(data.to_vec());
        let argument =
            Argument::from_memory(&operand, memory, 0, data.len() as u32, dimensions)?;
        self.check_argument_size(&operand, &argument, index, "input")?;
        self.inputs[index as usize] = argument;
        Ok(())
    }

    pub fn set_input_from_memory(
        &mut self,
        index: u32,
        memory: Arc<Memory>,
        offset: u32,
        length: u32,
    ) -> Result<(), ExecutionError> {
        self.check_not_started()?;
        self.check_input_index(index)?;
        let operand = self.main_model.input_operand(index).clone();
        let argument = Argument::from_memory(&operand, memory, offset, length, &[])?;
        self.check_argument_size(&operand, &argument, index, "input")?;
        self.inputs[index as usize] = argument;
        Ok(())
    }

    /// Binds an output to a fresh execution-owned region of `length` bytes;
    /// read it back with [`Execution::output_bytes`] after completion.
    pub fn set_output(&mut self, index: u32, length: u32) -> Result<(), ExecutionError> {
        self.set_output_with_dims(index, length, &[])
    }

    pub fn set_output_with_dims(
        &mut self,
        index: u32,
        length: u32,
        dimensions: &[u32],
    ) -> Result<(), ExecutionError> {
        self.check_not_started()?;
        self.check_output_index(index)?;
        let operand = self.main_model.output_operand(index).clone();
        let memory = Memory::allocate(length);
        self.outputs[index as usize] =
            Argument::from_memory(&operand, memory, 0, length, dimensions)?;
        Ok(())
    }

    pub fn set_output_from_memory(
        &mut self,
        index: u32,
        memory: Arc<Memory>,
        offset: u32,
        length: u32,
    ) -> Result<(), ExecutionError> {
        self.check_not_started()?;
        self.check_output_index(index)?;
        let operand = self.main_model.output_operand(index).clone();
        self.outputs[index as usize] =
            Argument::from_memory(&operand, memory, offset, length, &[])?;
        Ok(())
    }

    // EXECUTION CONTROLS
    // --------------------------------------------------------------------------------------------

    pub fn set_measure_timing(&mut self, measure: bool) -> Result<(), ExecutionError> {
        self.check_not_started()?;
        self.measure_timing = measure;
        Ok(())
    }

    /// Deadline budget for the whole execution, anchored when compute starts.
    pub fn set_timeout(&mut self, duration: Option<Duration>) -> Result<(), ExecutionError> {
        self.check_not_started()?;
        self.timeout = duration;
        Ok(())
    }

    /// Timeout applied to each WHILE loop; values above the hard maximum are
    /// clamped.
    pub fn set_loop_timeout(&mut self, duration: Duration) -> Result<(), ExecutionError> {
        self.check_not_started()?;
        if duration > MAX_LOOP_TIMEOUT {
            warn!(?duration, maximum = ?MAX_LOOP_TIMEOUT, "loop timeout clamped");
            self.loop_timeout = MAX_LOOP_TIMEOUT;
        } else {
            self.loop_timeout = duration;
        }
        Ok(())
    }

    pub fn loop_timeout(&self) -> Duration {
        self.loop_timeout
    }

    // COMPUTE ENTRY POINTS
    // --------------------------------------------------------------------------------------------

    /// Runs the plan synchronously on the calling thread.
    pub fn compute(&mut self) -> Result<(), ExecutionError> {
        let (mut controller, config) = self.begin_compute()?;
        let result = self.compute_partitioned(&mut controller, &config, None);
        self.record_completion(&result);
        result
    }

    /// Runs the plan on a spawned worker thread.
    pub fn compute_async(mut self) -> ComputeHandle {
        ComputeHandle {
            handle: thread::spawn(move || {
                let result = self.compute();
                (self, result)
            }),
        }
    }

    /// Runs the plan with a burst session per step where devices offer one.
    pub fn compute_burst(&mut self) -> Result<(), ExecutionError> {
        let bursts = BurstSessions::new(&self.plan);
        let (mut controller, config) = self.begin_compute()?;
        let result = self.compute_partitioned(&mut controller, &config, Some(&bursts));
        self.record_completion(&result);
        result
    }

    /// Runs the plan with fenced dispatch: each step's sync fence becomes the
    /// next step's wait precondition, and the final step's fence is returned
    /// without blocking on it.
    pub fn compute_fenced(
        &mut self,
        wait_for: Vec<SyncFence>,
        timeout_after_fence: Option<Duration>,
    ) -> Result<SyncFence, ExecutionError> {
        let (mut controller, config) = self.begin_compute()?;
        let result =
            self.compute_fenced_loop(&mut controller, &config, wait_for, timeout_after_fence);
        match &result {
            Ok(_) => self.record_completion(&Ok(())),
            Err(err) => self.record_completion(&Err(err.clone())),
        }
        result
    }

    // RESULTS
    // --------------------------------------------------------------------------------------------

    /// The shape of output `index`. Valid once the execution has finished,
    /// including after an insufficient-buffer completion (the refined shapes
    /// tell the client how much to allocate).
    pub fn output_shape(&self, index: u32) -> Result<&[u32], ExecutionError> {
        self.check_results_available(index)?;
        Ok(&self.output_shapes[index as usize].dimensions)
    }

    pub fn output_rank(&self, index: u32) -> Result<usize, ExecutionError> {
        self.check_results_available(index)?;
        Ok(self.output_shapes[index as usize].dimensions.len())
    }

    /// Copies output `index` out of its bound region. Valid only after a
    /// successful completion.
    pub fn output_bytes(&self, index: u32) -> Result<Vec<u8>, ExecutionError> {
        self.check_results_available(index)?;
        if self.completion != Some(Completion::Success) {
            return Err(ExecutionError::BadState(
                "the execution did not complete successfully".into(),
            ));
        }
        let (memory, offset, length) = self.outputs[index as usize]
            .memory()
            .ok_or_else(|| ExecutionError::BadData(format!("output {index} was never bound")))?;
        memory
            .read(offset, length)
            .map_err(|err| ExecutionError::OpFailed(err.to_string()))
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_some()
    }

    // SETUP
    // --------------------------------------------------------------------------------------------

    fn begin_compute(&mut self) -> Result<(Controller, ExecuteConfig), ExecutionError> {
        if self.started {
            return Err(ExecutionError::BadState("the execution has already started".into()));
        }
        for (index, argument) in self.inputs.iter().enumerate() {
            if !argument.is_specified() {
                return Err(ExecutionError::BadData(format!("input {index} was never bound")));
            }
        }
        for (index, argument) in self.outputs.iter().enumerate() {
            if !argument.is_specified() {
                return Err(ExecutionError::BadData(format!("output {index} was never bound")));
            }
        }
        self.started = true;
        self.output_shapes = self
            .outputs
            .iter()
            .map(|argument| OutputShape {
                dimensions: argument.dimensions.clone(),
                is_sufficient: true,
            })
            .collect();
        let controller = Controller::new(&self.plan)?;
        let config = ExecuteConfig {
            measure_timing: self.measure_timing,
            deadline: self.timeout.map(|duration| Instant::now() + duration),
            loop_timeout: Some(self.loop_timeout),
        };
        Ok((controller, config))
    }

    fn record_completion(&mut self, result: &Result<(), ExecutionError>) {
        self.completion = Some(match result {
            Ok(()) => Completion::Success,
            Err(ExecutionError::OutputInsufficientSize) => Completion::OutputInsufficientSize,
            Err(_) => Completion::OtherError,
        });
    }

    // THE PARTITIONED COMPUTE LOOP
    // --------------------------------------------------------------------------------------------

    fn compute_partitioned(
        &mut self,
        controller: &mut Controller,
        config: &ExecuteConfig,
        bursts: Option<&BurstSessions>,
    ) -> Result<(), ExecutionError> {
        let plan = Arc::clone(&self.plan);
        // A plan already running wholly on the fallback device has nowhere
        // left to fall.
        let allow_fallback = self.allow_fallback && !plan.is_simple_on_fallback();

        loop {
            let outcome = {
                let ctx = InterpreterContext {
                    plan: &plan,
                    inputs: &self.inputs,
                    outputs: &self.outputs,
                    loop_timeout: self.loop_timeout,
                    deadline: config.deadline,
                };
                interpreter::next(&ctx, controller, None)
            };
            let mut executor = match outcome {
                Ok(NextOutcome::Done) => return Ok(()),
                Ok(NextOutcome::Step(executor)) => executor,
                // Errors during control-flow interpretation (loop timeouts,
                // condition reads) are never retried on the fallback device.
                Err(err) => return Err(err),
            };
            let executor_on_fallback = plan.is_fallback_device_index(executor.device_index());
            let burst = bursts.and_then(|bursts| bursts.session_for(executor.step_index()));

            let step_result =
                self.dispatch_with_growth(&mut executor, &plan, controller, config, burst)?;
            match step_result {
                Ok(outcome) => {
                    executor.update_output_shapes(&outcome.output_shapes, &mut self.output_shapes)?;
                    executor.record_refined_shapes(controller, &outcome.output_shapes);
                    self.timing = outcome.timing;
                    continue;
                },
                Err(err @ (DeviceError::MissedDeadlineTransient
                | DeviceError::MissedDeadlinePersistent)) => return Err(err.into()),
                Err(err) => {
                    debug!(error = %err, "step failed");
                    if !allow_fallback {
                        return Err(err.into());
                    }
                    if executor_on_fallback {
                        // The fallback device itself failed: retry the whole
                        // plan there only if there is a whole plan to retry.
                        if plan.is_simple() {
                            return Err(err.into());
                        }
                        break;
                    }
                    match self.partial_fallback(&plan, controller, config)? {
                        Ok(()) => continue,
                        // Partial fallback failed too; last resort below.
                        Err(_) if !plan.is_simple() => break,
                        Err(err) => return Err(err.into()),
                    }
                },
            }
        }

        self.full_fallback(config)
    }

    /// Dispatches one step, growing dynamic temporaries and retrying when the
    /// only insufficient outputs are runtime-managed. Returns the final
    /// device verdict; the outer `Result` carries non-recoverable processor
    /// errors.
    #[allow(clippy::type_complexity)]
    fn dispatch_with_growth(
        &mut self,
        executor: &mut StepExecutor,
        plan: &ExecutionPlan,
        controller: &mut Controller,
        config: &ExecuteConfig,
        burst: Option<&dyn BurstSession>,
    ) -> Result<Result<tessera_core::ExecuteOutcome, DeviceError>, ExecutionError> {
        let mut retries = 0;
        loop {
            match executor.compute(config, burst) {
                Err(DeviceError::OutputInsufficientSize(shapes)) => {
                    if retries < MAX_TEMPORARY_GROWTH_RETRIES
                        && executor.grow_insufficient_temporaries(plan, controller, &shapes)?
                    {
                        retries += 1;
                        continue;
                    }
                    // A client-bound output is too small: record the refined
                    // shapes and surface without any fallback attempt.
                    executor.update_output_shapes(&shapes, &mut self.output_shapes)?;
                    executor.record_refined_shapes(controller, &shapes);
                    return Err(ExecutionError::OutputInsufficientSize);
                },
                other => return Ok(other),
            }
        }
    }

    /// Re-runs the step that just failed on the fallback device.
    fn partial_fallback(
        &mut self,
        plan: &ExecutionPlan,
        controller: &mut Controller,
        config: &ExecuteConfig,
    ) -> Result<Result<(), DeviceError>, ExecutionError> {
        if controller.fallback_next_step_index == crate::controller::BAD_STEP_INDEX {
            return Ok(Err(DeviceError::OpFailed("no step to retry".into())));
        }
        warn!(step = controller.fallback_next_step_index, "partial fallback");
        controller.next_step_index = controller.fallback_next_step_index;
        let outcome = {
            let ctx = InterpreterContext {
                plan,
                inputs: &self.inputs,
                outputs: &self.outputs,
                loop_timeout: self.loop_timeout,
                deadline: config.deadline,
            };
            interpreter::next(&ctx, controller, None)?
        };
        let NextOutcome::Step(mut executor) = outcome else {
            return Ok(Err(DeviceError::OpFailed("no step to retry".into())));
        };
        let fallback_index = (plan.devices().len() - 1) as u32;
        match executor.compute_on_fallback(plan.fallback_device(), fallback_index, config) {
            Ok(outcome) => {
                executor.update_output_shapes(&outcome.output_shapes, &mut self.output_shapes)?;
                executor.record_refined_shapes(controller, &outcome.output_shapes);
                self.timing = outcome.timing;
                Ok(Ok(()))
            },
            Err(DeviceError::OutputInsufficientSize(shapes)) => {
                executor.update_output_shapes(&shapes, &mut self.output_shapes)?;
                Err(ExecutionError::OutputInsufficientSize)
            },
            Err(err) => Ok(Err(err)),
        }
    }

    /// Last resort: compile and run the entire main model on the fallback
    /// device.
    fn full_fallback(&mut self, config: &ExecuteConfig) -> Result<(), ExecutionError> {
        warn!("full fallback: running the whole model on the fallback device");
        let device = Arc::clone(self.plan.fallback_device());
        let device_index = (self.plan.devices().len() - 1) as u32;
        let options = PrepareOptions {
            preference: ExecutionPreference::FastSingleAnswer,
            priority: Priority::default(),
            ..Default::default()
        };
        let prepared = device.prepare(&self.main_model, &options).map_err(ExecutionError::from)?;
        let executor = StepExecutor::for_whole_model(
            device,
            device_index,
            Arc::clone(&self.main_model),
            prepared,
            &self.inputs,
            &self.outputs,
        );
        match executor.compute(config, None) {
            Ok(outcome) => {
                executor.update_output_shapes(&outcome.output_shapes, &mut self.output_shapes)?;
                self.timing = outcome.timing;
                Ok(())
            },
            Err(DeviceError::OutputInsufficientSize(shapes)) => {
                executor.update_output_shapes(&shapes, &mut self.output_shapes)?;
                Err(ExecutionError::OutputInsufficientSize)
            },
            Err(err) => Err(err.into()),
        }
    }

    // THE FENCED COMPUTE LOOP
    // --------------------------------------------------------------------------------------------

    fn compute_fenced_loop(
        &mut self,
        controller: &mut Controller,
        config: &ExecuteConfig,
        wait_for: Vec<SyncFence>,
        timeout_after_fence: Option<Duration>,
    ) -> Result<SyncFence, ExecutionError> {
        let plan = Arc::clone(&self.plan);
        let allow_fallback = self.allow_fallback && !plan.is_simple_on_fallback();
        let mut wait_fences = wait_for;
        let mut last_fence: Option<SyncFence> = None;

        loop {
            let outcome = {
                let ctx = InterpreterContext {
                    plan: &plan,
                    inputs: &self.inputs,
                    outputs: &self.outputs,
                    loop_timeout: self.loop_timeout,
                    deadline: config.deadline,
                };
                interpreter::next(&ctx, controller, last_fence.clone())
            };
            let mut executor = match outcome {
                Ok(NextOutcome::Done) => {
                    return Ok(last_fence
                        .unwrap_or_else(|| SyncFence::signalled(FenceStatus::Signalled)));
                },
                Ok(NextOutcome::Step(executor)) => executor,
                // Control-flow interpretation errors are never retried.
                Err(err) => return Err(err),
            };
            let executor_on_fallback = plan.is_fallback_device_index(executor.device_index());

            match executor.compute_fenced(config, &wait_fences, timeout_after_fence) {
                Ok(outcome) => {
                    wait_fences = vec![outcome.fence.clone()];
                    last_fence = Some(outcome.fence);
                    if let Some(callback) = outcome.timing_callback
                        && self.measure_timing
                    {
                        self.timing = callback();
                    }
                },
                Err(err) => {
                    debug!(error = %err, "fenced step failed");
                    if !allow_fallback {
                        return Err(err.into());
                    }
                    // The chain is broken; settle any outstanding fences and
                    // recover synchronously.
                    for fence in wait_fences.drain(..) {
                        fence.wait();
                    }
                    if executor_on_fallback {
                        if plan.is_simple() {
                            return Err(err.into());
                        }
                        self.full_fallback(config)?;
                        return Ok(SyncFence::signalled(FenceStatus::Signalled));
                    }
                    match self.partial_fallback(&plan, controller, config)? {
                        Ok(()) => {
                            last_fence = None;
                            continue;
                        },
                        Err(_) if !plan.is_simple() => {
                            self.full_fallback(config)?;
                            return Ok(SyncFence::signalled(FenceStatus::Signalled));
                        },
                        Err(err) => return Err(err.into()),
                    }
                },
            }
        }
    }

    // VALIDATION HELPERS
    // --------------------------------------------------------------------------------------------

    fn check_not_started(&self) -> Result<(), ExecutionError> {
        if self.started {
            return Err(ExecutionError::BadState(
                "arguments cannot change after the execution has started".into(),
            ));
        }
        Ok(())
    }

    fn check_input_index(&self, index: u32) -> Result<(), ExecutionError> {
        if index as usize >= self.inputs.len() {
            return Err(ExecutionError::BadData(format!(
                "input index {index} out of range ({} inputs)",
                self.inputs.len()
            )));
        }
        Ok(())
    }

    fn check_output_index(&self, index: u32) -> Result<(), ExecutionError> {
        if index as usize >= self.outputs.len() {
            return Err(ExecutionError::BadData(format!(
                "output index {index} out of range ({} outputs)",
                self.outputs.len()
            )));
        }
        Ok(())
    }

    fn check_argument_size(
        &self,
        operand: &tessera_core::Operand,
        argument: &Argument,
        index: u32,
        kind: &str,
    ) -> Result<(), ExecutionError> {
        let Some(expected) = tessera_core::operand::byte_size_of(operand.ty, &argument.dimensions)
        else {
            return Err(ExecutionError::BadData(format!(
                "{kind} {index} has an underspecified shape"
            )));
        };
        let (_, _, length) = argument.memory().expect("argument was just bound to memory");
        if expected != length {
            return Err(ExecutionError::BadData(format!(
                "{kind} {index} is {length} bytes but its shape requires {expected}"
            )));
        }
        Ok(())
    }

    fn check_results_available(&self, index: u32) -> Result<(), ExecutionError> {
        match self.completion {
            None => Err(ExecutionError::BadState("the execution has not finished".into())),
            Some(Completion::OtherError) => Err(ExecutionError::BadState(
                "the execution finished with an error".into(),
            )),
            Some(_) => self.check_output_index(index),
        }
    }
}

// COMPUTE HANDLE
// ================================================================================================

/// Join handle for an asynchronous computation.
pub struct ComputeHandle {
    handle: thread::JoinHandle<(Execution, Result<(), ExecutionError>)>,
}

impl ComputeHandle {
    /// Blocks until the computation finishes and returns the execution (for
    /// result queries) along with its completion status.
    pub fn wait(self) -> (Execution, Result<(), ExecutionError>) {
        self.handle.join().expect("execution worker thread panicked")
    }
}
