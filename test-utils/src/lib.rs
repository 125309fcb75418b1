//! Shared test helpers: a scriptable mock device whose dispatches really
//! compute (by delegating to the software interpreter), with configurable
//! operation support, performance figures, failure injection, and
//! device-opaque memory.

use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tessera_core::{
    Capabilities, Device, DeviceError, ExecuteConfig, ExecuteOutcome, Memory, Model,
    PerformanceInfo, PrepareOptions, PreparedModel, Request, RequestArgument,
    device::BurstSession,
    memory::DeviceBuffer,
    operation::OperationType,
};
use tessera_fallback::SoftwareDevice;

// MOCK DEVICE
// ================================================================================================

/// Builds a [`MockDevice`].
pub struct MockDeviceBuilder {
    name: String,
    version: String,
    performance: PerformanceInfo,
    supported: Option<BTreeSet<OperationType>>,
    fail_prepare: Option<DeviceError>,
    fail_execute: Option<DeviceError>,
    caching_supported: bool,
    opaque_memory: bool,
}

impl MockDeviceBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0".to_string(),
            performance: PerformanceInfo::new(0.5, 0.5),
            supported: None,
            fail_prepare: None,
            fail_execute: None,
            caching_supported: false,
            opaque_memory: false,
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Uniform performance figure; lower than the software device's 1.0 by
    /// default so the mock wins ties against the fallback.
    pub fn performance(mut self, exec_time: f32, power_usage: f32) -> Self {
        self.performance = PerformanceInfo::new(exec_time, power_usage);
        self
    }

    /// Restricts the device to the given operation types. Without this the
    /// device supports everything the software interpreter supports.
    pub fn supporting(mut self, operations: impl IntoIterator<Item = OperationType>) -> Self {
        self.supported = Some(operations.into_iter().collect());
        self
    }

    pub fn failing_prepare(mut self, error: DeviceError) -> Self {
        self.fail_prepare = Some(error);
        self
    }

    pub fn failing_execute(mut self, error: DeviceError) -> Self {
        self.fail_execute = Some(error);
        self
    }

    pub fn with_caching(mut self) -> Self {
        self.caching_supported = true;
        self
    }

    /// Makes `allocate` hand out device-opaque buffers instead of
    /// host-visible memory.
    pub fn with_opaque_memory(mut self) -> Self {
        self.opaque_memory = true;
        self
    }

    pub fn build(self) -> Arc<MockDevice> {
        Arc::new(MockDevice {
            name: self.name,
            version: self.version,
            capabilities: Capabilities::uniform(self.performance),
            supported: self.supported,
            fail_prepare: self.fail_prepare,
            fail_execute: self.fail_execute,
            caching_supported: self.caching_supported,
            opaque_memory: self.opaque_memory,
            software: SoftwareDevice::new(),
            prepare_count: AtomicUsize::new(0),
            execute_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// A device whose dispatches delegate to the software interpreter, so tests
/// that run mock "accelerators" still observe real results.
pub struct MockDevice {
    name: String,
    version: String,
    capabilities: Capabilities,
    supported: Option<BTreeSet<OperationType>>,
    fail_prepare: Option<DeviceError>,
    fail_execute: Option<DeviceError>,
    caching_supported: bool,
    opaque_memory: bool,
    software: Arc<SoftwareDevice>,
    prepare_count: AtomicUsize,
    execute_count: Arc<AtomicUsize>,
}

impl MockDevice {
    /// How many step models this device has been asked to compile.
    pub fn prepare_count(&self) -> usize {
        self.prepare_count.load(Ordering::SeqCst)
    }

    /// How many dispatches have reached this device.
    pub fn execute_count(&self) -> usize {
        self.execute_count.load(Ordering::SeqCst)
    }

    fn supports(&self, model: &Model, operation_index: u32) -> bool {
        let operation = model.operation(operation_index);
        let listed = match &self.supported {
            Some(set) => set.contains(&operation.ty),
            None => true,
        };
        if !listed {
            return false;
        }
        if operation.ty.is_control_flow() {
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
                    if !self.supports(referenced, inner) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockDevice({})", self.name)
    }
}

impl Device for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn is_caching_supported(&self) -> bool {
        self.caching_supported
    }

    fn supported_operations(&self, model: &Model) -> Vec<bool> {
        (0..model.operation_count())
            .map(|index| self.supports(model, index))
            .collect()
    }

    fn prepare(
        &self,
        model: &Arc<Model>,
        options: &PrepareOptions,
    ) -> Result<Arc<dyn PreparedModel>, DeviceError> {
        self.prepare_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.fail_prepare {
            return Err(error.clone());
        }
        // Step models built from operations the software interpreter cannot
        // run still "compile" here; they only fail if dispatched.
        let delegate = self.software.prepare(model, options).ok();
        Ok(Arc::new(MockPreparedModel {
            delegate,
            fail_execute: self.fail_execute.clone(),
            execute_count: Arc::clone(&self.execute_count),
        }))
    }

    fn allocate(&self, byte_size: u32) -> Result<Arc<Memory>, DeviceError> {
        if self.opaque_memory {
            Ok(Memory::opaque(Arc::new(MockDeviceBuffer {
                data: Mutex::new(vec![0; byte_size as usize]),
            })))
        } else {
            Ok(Memory::allocate(byte_size))
        }
    }
}

// MOCK PREPARED MODEL
// ================================================================================================

struct MockPreparedModel {
    delegate: Option<Arc<dyn PreparedModel>>,
    fail_execute: Option<DeviceError>,
    execute_count: Arc<AtomicUsize>,
}

impl PreparedModel for MockPreparedModel {
    fn execute(
        &self,
        request: &Request,
        config: &ExecuteConfig,
        burst: Option<&dyn BurstSession>,
    ) -> Result<ExecuteOutcome, DeviceError> {
        self.execute_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.fail_execute {
            return Err(error.clone());
        }
        let Some(delegate) = &self.delegate else {
            return Err(DeviceError::OpFailed("mock device cannot run this step model".into()));
        };

        // The software interpreter cannot address opaque pools; stage them
        // through host copies and write the touched windows back.
        let mut staged = request.clone();
        let mut write_back: Vec<(usize, Arc<Memory>)> = Vec::new();
        for (pool_index, pool) in request.pools.iter().enumerate() {
            if let Some(buffer) = pool.device_buffer() {
                let host = Memory::from_bytes(buffer.read_to_vec()?);
                staged.pools[pool_index] = Arc::clone(&host);
                write_back.push((pool_index, host));
            }
        }
        let outcome = delegate.execute(&staged, config, burst)?;
        for (pool_index, host) in write_back {
            let buffer = request.pools[pool_index].device_buffer().expect("was opaque");
            let bytes = host
                .read(0, host.size())
                .map_err(|err| DeviceError::OpFailed(err.to_string()))?;
            buffer.write_all(&bytes)?;
        }
        Ok(outcome)
    }
}

// MOCK DEVICE BUFFER
// ================================================================================================

struct MockDeviceBuffer {
    data: Mutex<Vec<u8>>,
}

impl DeviceBuffer for MockDeviceBuffer {
    fn size(&self) -> u32 {
        self.data.lock().expect("buffer lock poisoned").len() as u32
    }

    fn read_to_vec(&self) -> Result<Vec<u8>, DeviceError> {
        Ok(self.data.lock().expect("buffer lock poisoned").clone())
    }

    fn write_all(&self, data: &[u8]) -> Result<(), DeviceError> {
        let mut guard = self.data.lock().expect("buffer lock poisoned");
        if data.len() != guard.len() {
            return Err(DeviceError::BadData(format!(
                "buffer is {} bytes, write is {}",
                guard.len(),
                data.len()
            )));
        }
        guard.copy_from_slice(data);
        Ok(())
    }
}

// REQUEST HELPERS
// ================================================================================================

/// A pool-window request argument with no dimension override.
pub fn pool_arg(pool: u32, offset: u32, length: u32) -> RequestArgument {
    RequestArgument::Pool { pool, offset, length, dimensions: vec![] }
}

/// Writes a float slice into a host memory region.
pub fn write_f32s(memory: &Memory, offset: u32, data: &[f32]) {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    memory.write(offset, &bytes).expect("write within bounds");
}

/// Reads a float slice out of a host memory region.
pub fn read_f32s(memory: &Memory, offset: u32, count: usize) -> Vec<f32> {
    memory
        .read(offset, (count * 4) as u32)
        .expect("read within bounds")
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunk of 4")))
        .collect()
}
