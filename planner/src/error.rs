use tessera_core::{DeviceError, ModelError, OperationType};

// COMPILE ERROR
// ================================================================================================

/// Errors raised while partitioning a model and preparing its execution plan.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("a compilation requires at least one device (the fallback)")]
    NoDevices,
    #[error("the compilation has already been finished")]
    AlreadyFinished,
    #[error("the compilation has not been finished")]
    NotFinished,
    #[error("no device, including the fallback, can execute operation {ty} of graph {graph}")]
    UnsupportedOperation { graph: u32, ty: OperationType },
    #[error(
        "a step model has an output of unknown size, which without-fallback partitioning forbids"
    )]
    DynamicOutputNotAllowed,
    #[error("back-end '{device}' failed to prepare a step model")]
    PrepareFailed {
        device: String,
        #[source]
        source: DeviceError,
    },
    #[error("failed to synthesise a step model")]
    StepModel(#[from] ModelError),
}

impl CompileError {
    /// Whether a full-fallback simple plan may be attempted after this error.
    pub fn permits_fallback(&self) -> bool {
        match self {
            Self::PrepareFailed { source, .. } => source.permits_fallback(),
            Self::StepModel(_) | Self::DynamicOutputNotAllowed => false,
            Self::NoDevices
            | Self::AlreadyFinished
            | Self::NotFinished
            | Self::UnsupportedOperation { .. } => false,
        }
    }
}
