use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use tessera_core::{
    CacheToken, Device, Model,
    device::{Deadline, ExecutionPreference, Priority},
};
use tracing::{debug, warn};

use crate::{CompileError, partitioner, plan::ExecutionPlan, plan::SourceGraphs};

// OPTIONS
// ================================================================================================

/// How the planner may split the model across devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitioningMode {
    /// No partitioning; the whole model runs on the fallback device.
    Disabled,
    /// Partition, and recover from device failures on the fallback device.
    #[default]
    WithFallback,
    /// Partition, and surface device failures verbatim.
    WithoutFallback,
}

/// The full set of compilation options consumed by the partitioner.
#[derive(Debug, Clone, Default)]
pub struct CompilationOptions {
    pub preference: ExecutionPreference,
    pub priority: Priority,
    pub partitioning: PartitioningMode,
    pub deadline: Option<Deadline>,
    pub cache_dir: Option<PathBuf>,
    pub cache_token: Option<CacheToken>,
}

// COMPILATION
// ================================================================================================

/// Client-facing compilation front-end.
///
/// Holds the finished model, the candidate device list (the last entry must
/// be the fallback device), and the compilation options; `finish` runs the
/// partitioner exactly once and freezes the resulting plan.
pub struct Compilation {
    model: Arc<Model>,
    devices: Vec<Arc<dyn Device>>,
    options: CompilationOptions,
    plan: Option<Arc<ExecutionPlan>>,
}

impl Compilation {
    /// Creates a compilation of `model` against `devices`. The device list
    /// must end with the fallback device.
    pub fn new(model: Arc<Model>, devices: Vec<Arc<dyn Device>>) -> Result<Self, CompileError> {
        if devices.is_empty() {
            return Err(CompileError::NoDevices);
        }
        Ok(Self {
            model,
            devices,
            options: CompilationOptions::default(),
            plan: None,
        })
    }

    pub fn set_preference(&mut self, preference: ExecutionPreference) -> Result<(), CompileError> {
        self.check_not_finished()?;
        self.options.preference = preference;
        Ok(())
    }

    pub fn set_priority(&mut self, priority: Priority) -> Result<(), CompileError> {
        self.check_not_finished()?;
        self.options.priority = priority;
        Ok(())
    }

    pub fn set_partitioning(&mut self, mode: PartitioningMode) -> Result<(), CompileError> {
        self.check_not_finished()?;
        self.options.partitioning = mode;
        Ok(())
    }

    /// Sets the compilation timeout; the deadline is anchored when `finish`
    /// is called.
    pub fn set_timeout(&mut self, duration: Option<Duration>) -> Result<(), CompileError> {
        self.check_not_finished()?;
        self.options.deadline = duration.map(|d| Instant::now() + d);
        Ok(())
    }

    pub fn set_caching(
        &mut self,
        cache_dir: PathBuf,
        token: CacheToken,
    ) -> Result<(), CompileError> {
        self.check_not_finished()?;
        self.options.cache_dir = Some(cache_dir);
        self.options.cache_token = Some(token);
        Ok(())
    }

    /// Runs the partitioner and compiles every step. A second call is
    /// rejected.
    pub fn finish(&mut self) -> Result<(), CompileError> {
        self.check_not_finished()?;

        let plan = match self.options.partitioning {
            PartitioningMode::Disabled => self.full_fallback_plan()?,
            PartitioningMode::WithFallback => {
                match partitioner::partition(&self.model, &self.devices, &self.options) {
                    Ok(plan) => plan,
                    Err(err) if err.permits_fallback() => {
                        warn!(
                            error = %err,
                            "partitioned compilation failed; compiling whole model on fallback \
                             device"
                        );
                        self.full_fallback_plan()?
                    },
                    Err(err) => return Err(err),
                }
            },
            PartitioningMode::WithoutFallback => {
                partitioner::partition(&self.model, &self.devices, &self.options)?
            },
        };
        debug!(plan = ?plan, "compilation finished");
        self.plan = Some(Arc::new(plan));
        Ok(())
    }

    /// The finalised plan. Errors until `finish` has succeeded.
    pub fn plan(&self) -> Result<&Arc<ExecutionPlan>, CompileError> {
        self.plan.as_ref().ok_or(CompileError::NotFinished)
    }

    pub fn is_finished(&self) -> bool {
        self.plan.is_some()
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn options(&self) -> &CompilationOptions {
        &self.options
    }

    fn check_not_finished(&self) -> Result<(), CompileError> {
        if self.plan.is_some() {
            return Err(CompileError::AlreadyFinished);
        }
        Ok(())
    }

    /// A simple plan that runs the entire model on the fallback device.
    fn full_fallback_plan(&self) -> Result<ExecutionPlan, CompileError> {
        let device_index = (self.devices.len() - 1) as u32;
        let device = Arc::clone(self.devices.last().expect("checked in new"));
        let mut source_graphs = SourceGraphs::default();
        source_graphs.add_model(Arc::clone(&self.model));
        if self.model.is_empty() {
            return Ok(ExecutionPlan::new(
                crate::plan::PlanBody::Empty,
                source_graphs,
                self.devices.clone(),
            ));
        }
        partitioner::simple_plan(
            Arc::clone(&self.model),
            device,
            device_index,
            source_graphs,
            &self.devices,
            &self.options,
        )
    }
}
