use tessera_core::DeviceError;

// EXECUTION ERROR
// ================================================================================================

/// Errors surfaced by an execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("malformed execution argument: {0}")]
    BadData(String),
    #[error("execution API misuse: {0}")]
    BadState(String),
    #[error("execution failed: {0}")]
    OpFailed(String),
    /// One or more output buffers were too small. The refined shapes are
    /// retained by the execution so the client can resize and retry.
    #[error("one or more output buffers were too small")]
    OutputInsufficientSize,
    #[error("missed deadline (transient)")]
    MissedDeadlineTransient,
    #[error("missed deadline (persistent)")]
    MissedDeadlinePersistent,
    #[error("failed to allocate the temporaries arena")]
    OutOfMemory,
}

impl From<DeviceError> for ExecutionError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OpFailed(reason) => Self::OpFailed(reason),
            DeviceError::OutputInsufficientSize(_) => Self::OutputInsufficientSize,
            DeviceError::MissedDeadlineTransient => Self::MissedDeadlineTransient,
            DeviceError::MissedDeadlinePersistent => Self::MissedDeadlinePersistent,
            DeviceError::BadData(reason) => Self::BadData(reason),
        }
    }
}

impl ExecutionError {
    pub fn is_missed_deadline(&self) -> bool {
        matches!(self, Self::MissedDeadlineTransient | Self::MissedDeadlinePersistent)
    }
}
