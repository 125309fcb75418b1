//! The guaranteed software back-end of the tessera runtime.
//!
//! [`SoftwareDevice`] implements the full device contract in-process with a
//! reference interpreter. It is the last entry of every compilation's device
//! list and the target of partial and full fallback.

use std::sync::Arc;

use tessera_core::{
    Capabilities, Device, DeviceError, ExecuteConfig, ExecuteOutcome, Model, PerformanceInfo,
    PrepareOptions, PreparedModel, Request, Timing,
    device::BurstSession,
    operation::OperationType,
};
use tracing::debug;

mod eval;
mod kernels;

use eval::Evaluator;

// SOFTWARE DEVICE
// ================================================================================================

/// Stable identity of the software back-end, included in cache tokens.
pub const DEVICE_NAME: &str = "tessera-software";
pub const DEVICE_VERSION: &str = "1.2.0";

/// Reference performance figure reported for all work; real accelerators are
/// expected to beat it, which keeps the partitioner off this device unless it
/// is the only one that can run an operation.
const REFERENCE_PERFORMANCE: PerformanceInfo = PerformanceInfo::new(1.0, 1.0);

/// The in-process software back-end.
#[derive(Debug)]
pub struct SoftwareDevice {
    capabilities: Capabilities,
}

impl SoftwareDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            capabilities: Capabilities::uniform(REFERENCE_PERFORMANCE),
        })
    }

    /// Whether the reference interpreter has a kernel for this operation
    /// type. Structured 2-D operations exist in the type system for
    /// partitioning but have no software kernel.
    pub fn has_kernel(ty: OperationType) -> bool {
        matches!(
            ty,
            OperationType::Add
                | OperationType::Sub
                | OperationType::Mul
                | OperationType::Div
                | OperationType::Equal
                | OperationType::NotEqual
                | OperationType::Greater
                | OperationType::GreaterEqual
                | OperationType::Less
                | OperationType::LessEqual
                | OperationType::LogicalAnd
                | OperationType::LogicalOr
                | OperationType::LogicalNot
                | OperationType::Relu
                | OperationType::Cast
                | OperationType::Softmax
                | OperationType::If
                | OperationType::While
        )
    }

    fn supports_operation(model: &Model, operation_index: u32) -> bool {
        let operation = model.operation(operation_index);
        if !Self::has_kernel(operation.ty) {
            return false;
        }
        if operation.ty.is_control_flow() {
            // A control-flow operation is only supported if every operation
            // of every referenced graph is.
            let graph_slots: &[usize] = match operation.ty {
                OperationType::If => &[1, 2],
                OperationType::While => &[0, 1],
                _ => unreachable!(),
            };
            for &slot in graph_slots {
                let operand = model.operand(operation.inputs[slot]);
                let Some(referenced) = model.referenced_model(operand) else {
                    return false;
                };
                for inner in 0..referenced.operation_count() {
                    if !Self::supports_operation(referenced, inner) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl Device for SoftwareDevice {
    fn name(&self) -> &str {
        DEVICE_NAME
    }

    fn version(&self) -> &str {
        DEVICE_VERSION
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn supported_operations(&self, model: &Model) -> Vec<bool> {
        (0..model.operation_count())
            .map(|index| Self::supports_operation(model, index))
            .collect()
    }

    fn prepare(
        &self,
        model: &Arc<Model>,
        options: &PrepareOptions,
    ) -> Result<Arc<dyn PreparedModel>, DeviceError> {
        if let Some(deadline) = options.deadline
            && deadline <= std::time::Instant::now()
        {
            return Err(DeviceError::MissedDeadlineTransient);
        }
        for index in 0..model.operation_count() {
            if !Self::supports_operation(model, index) {
                return Err(DeviceError::OpFailed(format!(
                    "no software kernel for operation {}",
                    model.operation(index).ty
                )));
            }
        }
        debug!(operations = model.operation_count(), "prepared model on software back-end");
        Ok(Arc::new(SoftwarePreparedModel { model: Arc::clone(model) }))
    }
}

// SOFTWARE PREPARED MODEL
// ================================================================================================

struct SoftwarePreparedModel {
    model: Arc<Model>,
}

impl PreparedModel for SoftwarePreparedModel {
    fn execute(
        &self,
        request: &Request,
        config: &ExecuteConfig,
        _burst: Option<&dyn BurstSession>,
    ) -> Result<ExecuteOutcome, DeviceError> {
        let started = std::time::Instant::now();
        if let Some(deadline) = config.deadline
            && deadline <= started
        {
            return Err(DeviceError::MissedDeadlineTransient);
        }
        let output_shapes = Evaluator::run(&self.model, request, config)?;
        let timing = if config.measure_timing {
            let elapsed = started.elapsed();
            Timing { on_device: Some(elapsed), in_driver: Some(elapsed) }
        } else {
            Timing::default()
        };
        Ok(ExecuteOutcome { output_shapes, timing })
    }

    fn configure_burst(&self, _prefer_power_over_latency: bool) -> Option<Arc<dyn BurstSession>> {
        // A burst session buys nothing in-process, but offering one keeps the
        // burst path uniform across devices.
        Some(Arc::new(SoftwareBurstSession))
    }
}

struct SoftwareBurstSession;

impl BurstSession for SoftwareBurstSession {}
