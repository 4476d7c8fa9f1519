use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::binder::ArgumentTable;
use crate::error::DriverResult;
use crate::metadata::LaunchGeometry;
use crate::shape::{DType, OutputShape};

/// Raw device address as handed to the driver.
pub type DevicePtr = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub usize);

/// Caller-owned ordered execution stream. `StreamHandle::DEFAULT` is the legacy null stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    pub const DEFAULT: StreamHandle = StreamHandle(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Architecture tag without separator, e.g. `86` for 8.6.
    pub fn arch_tag(&self) -> String {
        format!("{}{}", self.major, self.minor)
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Narrow view of the device/driver subsystem used by dynamic kernels.
///
/// Implementations own whatever context the driver needs; callers never assume a
/// process-wide current device.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn compute_capability(&self) -> DriverResult<ComputeCapability>;

    fn load_module(&self, image: &[u8]) -> DriverResult<ModuleHandle>;

    fn get_function(&self, module: ModuleHandle, symbol: &str) -> DriverResult<FunctionHandle>;

    fn unload_module(&self, module: ModuleHandle) -> DriverResult<()>;

    fn alloc(&self, bytes: usize) -> DriverResult<DevicePtr>;

    fn free(&self, ptr: DevicePtr);

    /// Submits a launch to `stream` and returns once the driver accepted it.
    fn launch(
        &self,
        function: FunctionHandle,
        geometry: &LaunchGeometry,
        shared_mem_bytes: u32,
        stream: StreamHandle,
        args: &mut ArgumentTable,
    ) -> DriverResult<()>;
}

/// Device allocation released through its device on drop.
pub struct DeviceBuffer {
    device: Arc<dyn Device>,
    ptr: DevicePtr,
    bytes: usize,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device.name())
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn alloc(device: &Arc<dyn Device>, bytes: usize) -> DriverResult<Self> {
        let ptr = device.alloc(bytes)?;
        Ok(Self {
            device: Arc::clone(device),
            ptr,
            bytes,
        })
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.device.free(self.ptr);
    }
}

/// Device-resident tensor passed into or produced by a kernel invocation.
#[derive(Clone, Debug)]
pub struct KernelTensor {
    pub shape: OutputShape,
    pub buffer: Arc<DeviceBuffer>,
}

impl KernelTensor {
    pub fn new(shape: OutputShape, buffer: Arc<DeviceBuffer>) -> Self {
        Self { shape, buffer }
    }

    pub fn dims(&self) -> &[usize] {
        &self.shape.dims
    }

    pub fn dtype(&self) -> DType {
        self.shape.dtype
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.buffer.device_ptr()
    }
}
