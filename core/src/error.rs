use crate::device::OutputShape;

// MODEL ERROR
// ================================================================================================

/// Errors raised while constructing or validating a model.
///
/// These correspond to malformed client input (bad indices, size mismatches,
/// wrong arity) or API misuse (mutating a finished model); neither kind is
/// recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("operand index {index} is out of range for a graph with {count} operands")]
    OperandIndexOutOfRange { index: u32, count: u32 },
    #[error("operation index {index} is out of range for a graph with {count} operations")]
    OperationIndexOutOfRange { index: u32, count: u32 },
    #[error("operand {index} value is {actual} bytes but its type and shape require {expected}")]
    OperandValueLengthMismatch { index: u32, expected: u32, actual: u32 },
    #[error("operand {0} cannot be given a value (it already has lifetime {1:?})")]
    OperandAlreadyHasValue(u32, crate::OperandLifetime),
    #[error("operand {0} of subgraph type must reference a graph")]
    SubgraphOperandWithoutGraph(u32),
    #[error("operand {0} is written by more than one operation")]
    OperandWrittenTwice(u32),
    #[error("operand {0} is declared as a graph output but no operation writes it")]
    GraphOutputNeverWritten(u32),
    #[error("operation {0} has wrong arity: expected {1}, got {2}")]
    WrongOperationArity(u32, usize, usize),
    #[error("control-flow operation {0} input {1} must reference a subgraph operand")]
    ControlFlowInputNotSubgraph(u32, usize),
    #[error("the graph contains a cycle")]
    GraphContainsCycle,
    #[error("the model has already been finished")]
    ModelAlreadyFinished,
    #[error("graph inputs and outputs have not been identified")]
    InputsOutputsNotIdentified,
    #[error("memory region window ({offset} + {length}) exceeds region of {size} bytes")]
    MemoryWindowOutOfRange { offset: u32, length: u32, size: u32 },
}

// DEVICE ERROR
// ================================================================================================

/// Errors surfaced by a back-end from `prepare`, `execute`, or `allocate`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    /// The back-end rejected or failed the request. Recoverable by fallback
    /// when the plan permits it.
    #[error("back-end operation failed: {0}")]
    OpFailed(String),
    /// One or more output buffers were too small. Never retried on the
    /// fallback device; the refined shapes let the caller resize and retry.
    #[error("one or more output buffers were too small")]
    OutputInsufficientSize(Vec<OutputShape>),
    #[error("missed deadline (transient)")]
    MissedDeadlineTransient,
    #[error("missed deadline (persistent)")]
    MissedDeadlinePersistent,
    #[error("malformed request: {0}")]
    BadData(String),
}

impl DeviceError {
    /// Whether a step that failed with this error may be retried on the
    /// fallback device.
    pub fn permits_fallback(&self) -> bool {
        matches!(self, Self::OpFailed(_) | Self::BadData(_))
    }
}
