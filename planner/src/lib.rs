//! The tessera compilation planner.
//!
//! Consumes a finished [`tessera_core::Model`] and an ordered device list
//! (fallback last), chooses a best-fit device per operation, excises
//! per-device step models, and emits a flat [`ExecutionPlan`] of execution
//! steps threaded with interpreted control flow. The plan is immutable after
//! `finish` and shared by every execution.

mod compilation;
mod error;
mod partitioner;
mod plan;
mod step;
mod strip;
mod token;

pub use compilation::{Compilation, CompilationOptions, PartitioningMode};
pub use error::CompileError;
pub use plan::{
    CompoundBody, ConstantCopyLocation, ConstantReferenceLocation, ExecutionPlan,
    MAIN_GRAPH_INDEX, PlanBody, SimpleBody, SourceGraphs,
};
pub use step::{ExecutionStep, GotoStep, IfStep, LogicalStep, OperandRemap, WhileStep};
pub use token::TokenHasher;
