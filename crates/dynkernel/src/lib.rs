//! Dynamic GPU kernel execution.
//!
//! A [`DynamicKernel`] takes kernel source text whose comments and parameter names describe its
//! launch geometry and calling convention, compiles it with an external toolchain, loads the
//! resulting module through a [`Device`], and launches it once per invocation with tensors
//! bound by the ordinals recovered from the source.

pub mod binder;
pub mod compiler;
pub mod config;
pub mod device;
pub mod env;
pub mod error;
pub mod kernel;
pub mod launch;
pub mod metadata;
pub mod module;
pub mod shape;
pub mod spec;

pub use binder::ArgumentTable;
pub use compiler::{CompiledArtifact, CompilerConfig, KernelCompiler};
pub use config::{ArtifactPaths, KernelConfig};
pub use device::{
    ComputeCapability, Device, DeviceBuffer, DevicePtr, FunctionHandle, KernelTensor,
    ModuleHandle, StreamHandle,
};
pub use env::execution_parallelism;
pub use error::{DriverError, DriverResult, KernelError, KernelResult};
pub use kernel::DynamicKernel;
pub use launch::LaunchExecutor;
pub use metadata::{KernelMetadata, KernelSignature, LaunchGeometry, ParamBinding, ParamRole};
pub use module::LoadedModule;
pub use shape::{DType, OutputShape};
pub use spec::KernelSpec;
