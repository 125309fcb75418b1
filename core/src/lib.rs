//! Core components of the tessera runtime: the graph representation consumed
//! by the planner, the device capability contract implemented by back-ends,
//! and the shared memory / synchronisation primitives both sides exchange.

pub mod device;
pub mod error;
pub mod fence;
pub mod memory;
pub mod model;
pub mod operand;
pub mod operation;

pub use device::{
    BurstSession, Capabilities, Device, ExecuteConfig, ExecuteOutcome, ExecutionPreference,
    FencedOutcome, OutputShape, PerformanceInfo, PrepareOptions, PreparedModel, Priority, Request,
    RequestArgument, Timing,
};
pub use error::{DeviceError, ModelError};
pub use fence::{FenceStatus, SyncFence};
pub use memory::{DeviceBuffer, Memory, MemoryAccessError};
pub use model::{Model, ModelBuilder};
pub use operand::{
    ChannelQuant, Operand, OperandLifetime, OperandLocation, OperandType, SourceOperandIndex,
};
pub use operation::{Operation, OperationType};

// CONSTANTS
// ================================================================================================

/// Size of a compilation cache token in bytes.
pub const CACHE_TOKEN_LEN: usize = 32;

/// An opaque 256-bit compilation cache token.
///
/// Computed by the planner from the step-model contents, the target device
/// identity, and the compilation options; treated as opaque by clients and
/// back-ends alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheToken(pub [u8; CACHE_TOKEN_LEN]);

impl AsRef<[u8]> for CacheToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
