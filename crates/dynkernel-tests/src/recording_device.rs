use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use dynkernel::binder::ArgumentTable;
use dynkernel::{
    ComputeCapability, Device, DevicePtr, DriverError, DriverResult, FunctionHandle,
    LaunchGeometry, ModuleHandle, StreamHandle,
};

const ALLOC_BASE: DevicePtr = 0x7f00_0000_0000;
const ALLOC_ALIGN: DevicePtr = 256;

/// One accepted launch as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub function: FunctionHandle,
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
    pub stream: StreamHandle,
    /// Addresses read back through the kernel parameter pointer array.
    pub args: Vec<DevicePtr>,
}

#[derive(Default)]
struct Failures {
    capability: Option<i32>,
    module_load: Option<i32>,
    symbol: Option<i32>,
    alloc: Option<i32>,
    launch: Option<i32>,
}

#[derive(Default)]
struct State {
    next_handle: usize,
    next_ptr: DevicePtr,
    capability_queries: usize,
    loaded_images: Vec<Vec<u8>>,
    resolved_symbols: Vec<String>,
    live_modules: HashSet<ModuleHandle>,
    unload_calls: usize,
    allocations: Vec<(DevicePtr, usize)>,
    live_allocations: HashSet<DevicePtr>,
    launches: Vec<LaunchRecord>,
}

/// Test-only device that records every driver call and can be told to fail any of them.
pub struct RecordingDevice {
    capability: ComputeCapability,
    state: Mutex<State>,
    failures: Mutex<Failures>,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new(ComputeCapability::new(8, 0))
    }
}

impl RecordingDevice {
    pub fn new(capability: ComputeCapability) -> Self {
        Self {
            capability,
            state: Mutex::new(State {
                next_handle: 1,
                next_ptr: ALLOC_BASE,
                ..State::default()
            }),
            failures: Mutex::new(Failures::default()),
        }
    }

    pub fn shared(capability: ComputeCapability) -> (Arc<Self>, Arc<dyn Device>) {
        let recording = Arc::new(Self::new(capability));
        let device: Arc<dyn Device> = recording.clone();
        (recording, device)
    }

    pub fn fail_capability_query(&self, code: i32) {
        self.failures().capability = Some(code);
    }

    pub fn fail_module_load(&self, code: i32) {
        self.failures().module_load = Some(code);
    }

    pub fn fail_symbol_lookup(&self, code: i32) {
        self.failures().symbol = Some(code);
    }

    pub fn fail_alloc(&self, code: Option<i32>) {
        self.failures().alloc = code;
    }

    pub fn fail_launch(&self, code: Option<i32>) {
        self.failures().launch = code;
    }

    pub fn capability_queries(&self) -> usize {
        self.state().capability_queries
    }

    pub fn loaded_images(&self) -> Vec<Vec<u8>> {
        self.state().loaded_images.clone()
    }

    pub fn resolved_symbols(&self) -> Vec<String> {
        self.state().resolved_symbols.clone()
    }

    pub fn live_modules(&self) -> usize {
        self.state().live_modules.len()
    }

    pub fn unload_calls(&self) -> usize {
        self.state().unload_calls
    }

    pub fn allocations(&self) -> Vec<(DevicePtr, usize)> {
        self.state().allocations.clone()
    }

    pub fn live_allocations(&self) -> usize {
        self.state().live_allocations.len()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state().launches.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("recording device state poisoned")
    }

    fn failures(&self) -> MutexGuard<'_, Failures> {
        self.failures
            .lock()
            .expect("recording device failures poisoned")
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &str {
        "recording"
    }

    fn compute_capability(&self) -> DriverResult<ComputeCapability> {
        self.state().capability_queries += 1;
        if let Some(code) = self.failures().capability {
            return Err(DriverError::new("cuDeviceGetAttribute", code));
        }
        Ok(self.capability)
    }

    fn load_module(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        if let Some(code) = self.failures().module_load {
            return Err(DriverError::with_message(
                "cuModuleLoadData",
                code,
                "invalid image",
            ));
        }
        let mut state = self.state();
        let handle = ModuleHandle(state.next_handle);
        state.next_handle += 1;
        state.loaded_images.push(image.to_vec());
        state.live_modules.insert(handle);
        Ok(handle)
    }

    fn get_function(&self, module: ModuleHandle, symbol: &str) -> DriverResult<FunctionHandle> {
        if let Some(code) = self.failures().symbol {
            return Err(DriverError::new("cuModuleGetFunction", code));
        }
        let mut state = self.state();
        if !state.live_modules.contains(&module) {
            return Err(DriverError::with_message(
                "cuModuleGetFunction",
                400,
                "invalid module handle",
            ));
        }
        state.resolved_symbols.push(symbol.to_string());
        let handle = FunctionHandle(state.next_handle);
        state.next_handle += 1;
        Ok(handle)
    }

    fn unload_module(&self, module: ModuleHandle) -> DriverResult<()> {
        let mut state = self.state();
        state.unload_calls += 1;
        if state.live_modules.remove(&module) {
            Ok(())
        } else {
            Err(DriverError::with_message(
                "cuModuleUnload",
                400,
                "module unloaded twice",
            ))
        }
    }

    fn alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        if let Some(code) = self.failures().alloc {
            return Err(DriverError::new("cuMemAlloc_v2", code));
        }
        let mut state = self.state();
        let ptr = state.next_ptr;
        let span = (bytes as DevicePtr).max(1).div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        state.next_ptr += span;
        state.allocations.push((ptr, bytes));
        state.live_allocations.insert(ptr);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) {
        self.state().live_allocations.remove(&ptr);
    }

    fn launch(
        &self,
        function: FunctionHandle,
        geometry: &LaunchGeometry,
        shared_mem_bytes: u32,
        stream: StreamHandle,
        args: &mut ArgumentTable,
    ) -> DriverResult<()> {
        if let Some(code) = self.failures().launch {
            return Err(DriverError::new("cuLaunchKernel", code));
        }
        let params = args.kernel_params();
        let args = params
            .iter()
            // SAFETY: every parameter points at a live slot of the argument table.
            .map(|param| unsafe { *param.cast::<DevicePtr>() })
            .collect();
        self.state().launches.push(LaunchRecord {
            function,
            grid: geometry.grid_dims(),
            block: geometry.block_dims(),
            shared_mem_bytes,
            stream,
            args,
        });
        Ok(())
    }
}
