//! CUDA driver implementation of [`dynkernel::Device`].
//!
//! The driver library is opened at runtime, so binaries link on hosts without CUDA and
//! [`is_available`] reports whether a device can actually be used.

mod driver;

pub use driver::{driver, is_available, CudaDevice};
