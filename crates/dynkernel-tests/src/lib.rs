//! Test-only collaborators: a device that records every driver call and a scripted compiler.

mod recording_device;
mod toolchain;

pub use recording_device::{LaunchRecord, RecordingDevice};
pub use toolchain::{FakeToolchain, FAKE_IMAGE_MAGIC};

use std::sync::Arc;

use dynkernel::{Device, DeviceBuffer, KernelTensor, OutputShape};

/// Allocates a float32 input tensor of `dims` on `device`.
pub fn input_tensor(device: &Arc<dyn Device>, dims: &[usize]) -> KernelTensor {
    let shape = OutputShape::new(dims.to_vec(), Default::default());
    let bytes = shape.byte_len().expect("input shape fits in memory");
    let buffer = DeviceBuffer::alloc(device, bytes).expect("input allocation");
    KernelTensor::new(shape, Arc::new(buffer))
}
