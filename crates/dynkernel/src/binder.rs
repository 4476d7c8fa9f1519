use std::ffi::c_void;

use crate::device::{DevicePtr, KernelTensor};
use crate::metadata::{ParamBinding, ParamRole};

/// Per-invocation table of buffer addresses, one slot per formal parameter.
///
/// Slot `i` holds the address for the `i`th parameter of the kernel signature, regardless of
/// the order in which tensors were handed to the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentTable {
    slots: Vec<DevicePtr>,
}

impl ArgumentTable {
    /// Places input and output addresses by the ordinals recovered from the signature.
    ///
    /// # Panics
    ///
    /// Panics if an ordinal has no matching address; callers check arity first.
    pub fn bind(bindings: &[ParamBinding], inputs: &[DevicePtr], outputs: &[DevicePtr]) -> Self {
        let slots = bindings
            .iter()
            .map(|binding| {
                let addresses = match binding.role {
                    ParamRole::Input => inputs,
                    ParamRole::Output => outputs,
                };
                match addresses.get(binding.ordinal) {
                    Some(&ptr) => ptr,
                    None => panic!(
                        "no address for parameter {binding}: only {} {} tensors supplied",
                        addresses.len(),
                        binding.role
                    ),
                }
            })
            .collect();
        Self { slots }
    }

    pub fn bind_tensors(
        bindings: &[ParamBinding],
        inputs: &[KernelTensor],
        outputs: &[KernelTensor],
    ) -> Self {
        let inputs = inputs.iter().map(KernelTensor::device_ptr).collect::<Vec<_>>();
        let outputs = outputs
            .iter()
            .map(KernelTensor::device_ptr)
            .collect::<Vec<_>>();
        Self::bind(bindings, &inputs, &outputs)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[DevicePtr] {
        &self.slots
    }

    /// Driver-facing parameter array: each entry points at the matching slot of `self`.
    ///
    /// The returned pointers borrow `self`, which must stay alive and unmoved until the
    /// launch call returns.
    pub fn kernel_params(&mut self) -> Vec<*mut c_void> {
        self.slots
            .iter_mut()
            .map(|slot| (slot as *mut DevicePtr).cast::<c_void>())
            .collect()
    }
}
