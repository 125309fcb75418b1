use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    CacheToken,
    error::DeviceError,
    fence::{FenceStatus, SyncFence},
    memory::Memory,
    model::Model,
    operand::OperandType,
};

// CONSTANTS
// ================================================================================================

/// Loop timeout applied to WHILE operations when the client does not set one.
pub const DEFAULT_LOOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Hard maximum for the WHILE loop timeout; requests above it are clamped.
pub const MAX_LOOP_TIMEOUT: Duration = Duration::from_secs(15);

// COMPILATION OPTIONS
// ================================================================================================

/// What the client wants the planner to optimise for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPreference {
    LowPower,
    #[default]
    FastSingleAnswer,
    SustainedSpeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// An absolute point in time by which an operation must complete.
pub type Deadline = Instant;

/// Options passed to [`Device::prepare`].
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub preference: ExecutionPreference,
    pub priority: Priority,
    pub deadline: Option<Deadline>,
    pub cache_dir: Option<PathBuf>,
    pub cache_token: Option<CacheToken>,
}

// CAPABILITIES
// ================================================================================================

/// Performance of a back-end for one class of work. Lower is better for both
/// figures; which one matters is selected by the execution preference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceInfo {
    pub exec_time: f32,
    pub power_usage: f32,
}

impl PerformanceInfo {
    pub const fn new(exec_time: f32, power_usage: f32) -> Self {
        Self { exec_time, power_usage }
    }

    pub fn apply_preference(&self, preference: ExecutionPreference) -> f32 {
        match preference {
            ExecutionPreference::LowPower => self.power_usage,
            _ => self.exec_time,
        }
    }
}

const WORST_PERFORMANCE: PerformanceInfo = PerformanceInfo::new(f32::MAX, f32::MAX);

/// Per-back-end performance vector keyed by operand element type, with
/// dedicated entries for control flow and relaxed-precision computation.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub relaxed_float32_to_float16_scalar: PerformanceInfo,
    pub relaxed_float32_to_float16_tensor: PerformanceInfo,
    pub if_performance: PerformanceInfo,
    pub while_performance: PerformanceInfo,
    operand_performance: BTreeMap<OperandType, PerformanceInfo>,
}

impl Capabilities {
    /// Builds a capability vector reporting `perf` for every known operand
    /// type and for control flow.
    pub fn uniform(perf: PerformanceInfo) -> Self {
        let operand_performance = [
            OperandType::Float32,
            OperandType::Float16,
            OperandType::Int32,
            OperandType::UInt32,
            OperandType::Bool,
            OperandType::TensorFloat32,
            OperandType::TensorFloat16,
            OperandType::TensorInt32,
            OperandType::TensorQuant8Asymm,
            OperandType::TensorQuant8Symm,
            OperandType::TensorQuant8SymmPerChannel,
            OperandType::TensorBool8,
        ]
        .into_iter()
        .map(|ty| (ty, perf))
        .collect();
        Self {
            relaxed_float32_to_float16_scalar: perf,
            relaxed_float32_to_float16_tensor: perf,
            if_performance: perf,
            while_performance: perf,
            operand_performance,
        }
    }

    /// Overrides the performance entry for one operand type.
    pub fn with_operand_performance(mut self, ty: OperandType, perf: PerformanceInfo) -> Self {
        self.operand_performance.insert(ty, perf);
        self
    }

    /// Performance for the given operand type; unlisted types report the
    /// worst possible figures so they are never preferred.
    pub fn performance(&self, ty: OperandType) -> PerformanceInfo {
        self.operand_performance.get(&ty).copied().unwrap_or(WORST_PERFORMANCE)
    }
}

// REQUESTS
// ================================================================================================

/// One input or output argument of a request, resolved to a window of one of
/// the request's memory pools. `dimensions` optionally refines the shape
/// declared by the model; an empty vector means "as declared".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestArgument {
    NoValue,
    Pool { pool: u32, offset: u32, length: u32, dimensions: Vec<u32> },
}

/// A fully-bound unit of work handed to a prepared model for dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    pub inputs: Vec<RequestArgument>,
    pub outputs: Vec<RequestArgument>,
    pub pools: Vec<Arc<Memory>>,
}

/// Per-dispatch execution controls.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteConfig {
    pub measure_timing: bool,
    pub deadline: Option<Deadline>,
    pub loop_timeout: Option<Duration>,
}

// OUTCOMES
// ================================================================================================

/// Shape of one output as reported by a back-end after dispatch.
/// `is_sufficient` is false when the bound buffer was too small to hold the
/// value of this shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputShape {
    pub dimensions: Vec<u32>,
    pub is_sufficient: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timing {
    pub on_device: Option<Duration>,
    pub in_driver: Option<Duration>,
}

/// Result of a successful synchronous dispatch.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub output_shapes: Vec<OutputShape>,
    pub timing: Timing,
}

pub type TimingCallback = Box<dyn Fn() -> Timing + Send + Sync>;

/// Result of a successful fenced dispatch: the fence signals when the outputs
/// are materialised, and the callback (when present) reports timing once the
/// fence has signalled.
pub struct FencedOutcome {
    pub fence: SyncFence,
    pub timing_callback: Option<TimingCallback>,
}

impl fmt::Debug for FencedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FencedOutcome")
            .field("fence", &self.fence)
            .field("timing_callback", &self.timing_callback.is_some())
            .finish()
    }
}

// BURST SESSION
// ================================================================================================

/// A back-end-side session shared by a stream of closely-spaced dispatches to
/// reduce per-dispatch latency. The runtime treats the session as opaque and
/// passes it back on each dispatch.
pub trait BurstSession: Send + Sync {}

// DEVICE
// ================================================================================================

/// The capability contract every execution back-end presents to the runtime.
///
/// The last device of every compilation's device list is the fallback device,
/// which implements this same contract in-process with a software executor.
pub trait Device: Send + Sync + fmt::Debug {
    /// Stable name of the back-end; together with [`Device::version`] it
    /// identifies the device inside compilation cache tokens.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    fn is_caching_supported(&self) -> bool {
        false
    }

    /// Answers, for each operation of the model's main graph, whether this
    /// back-end can execute it. For control-flow operations the answer must
    /// account for every operation of every referenced graph.
    fn supported_operations(&self, model: &Model) -> Vec<bool>;

    /// Compiles the model into a back-end-owned artifact ready for dispatch.
    fn prepare(
        &self,
        model: &Arc<Model>,
        options: &PrepareOptions,
    ) -> Result<Arc<dyn PreparedModel>, DeviceError>;

    /// Allocates a device-preferred memory region of the given size. The
    /// default implementation hands out host-visible memory.
    fn allocate(&self, byte_size: u32) -> Result<Arc<Memory>, DeviceError> {
        Ok(Memory::allocate(byte_size))
    }
}

/// An opaque compiled artifact, owned by the plan and dispatched concurrently
/// by any number of executions.
pub trait PreparedModel: Send + Sync {
    /// Dispatches one fully-bound request and blocks until it completes.
    fn execute(
        &self,
        request: &Request,
        config: &ExecuteConfig,
        burst: Option<&dyn BurstSession>,
    ) -> Result<ExecuteOutcome, DeviceError>;

    /// Dispatches one request without blocking on completion; the returned
    /// fence signals once the outputs are valid. Back-ends without native
    /// fence support inherit this default, which waits on the preconditions,
    /// executes synchronously, and returns a pre-signalled fence.
    fn execute_fenced(
        &self,
        request: &Request,
        config: &ExecuteConfig,
        wait_for: &[SyncFence],
        _timeout_after_fence: Option<Duration>,
    ) -> Result<FencedOutcome, DeviceError> {
        for fence in wait_for {
            if fence.wait() == FenceStatus::Error {
                return Err(DeviceError::OpFailed("wait fence signalled an error".into()));
            }
        }
        let outcome = self.execute(request, config, None)?;
        let timing = outcome.timing;
        Ok(FencedOutcome {
            fence: SyncFence::signalled(FenceStatus::Signalled),
            timing_callback: Some(Box::new(move || timing)),
        })
    }

    /// Opens a burst session, if the back-end supports bursts.
    fn configure_burst(&self, _prefer_power_over_latency: bool) -> Option<Arc<dyn BurstSession>> {
        None
    }
}
