use std::sync::atomic::{AtomicU64, Ordering};

use crate::binder::ArgumentTable;
use crate::device::StreamHandle;
use crate::error::{KernelError, KernelResult};
use crate::metadata::LaunchGeometry;
use crate::module::LoadedModule;

/// Generated kernels declare their shared memory statically.
const DYNAMIC_SHARED_MEM_BYTES: u32 = 0;

/// Submits launches of one loaded kernel and counts the ones the driver accepted.
#[derive(Debug, Default)]
pub struct LaunchExecutor {
    accepted: AtomicU64,
}

impl LaunchExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted_launches(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Issues a non-blocking launch on `stream`.
    ///
    /// `done` runs exactly once: with `Ok` as soon as the driver accepted the launch (the
    /// kernel may still be executing), or with `LaunchFailed`.
    pub fn submit<F>(
        &self,
        module: &LoadedModule,
        geometry: &LaunchGeometry,
        args: &mut ArgumentTable,
        stream: StreamHandle,
        done: F,
    ) where
        F: FnOnce(KernelResult<()>),
    {
        done(self.launch(module, geometry, args, stream));
    }

    pub fn launch(
        &self,
        module: &LoadedModule,
        geometry: &LaunchGeometry,
        args: &mut ArgumentTable,
        stream: StreamHandle,
    ) -> KernelResult<()> {
        let function = module.function()?;
        tracing::trace!(
            target: "dynkernel",
            symbol = module.symbol(),
            grid = ?geometry.grid,
            block = ?geometry.block,
            args = args.len(),
            stream = stream.0,
            "launching kernel"
        );
        module
            .device()
            .launch(function, geometry, DYNAMIC_SHARED_MEM_BYTES, stream, args)
            .map_err(|err| {
                KernelError::LaunchFailed(format!("'{}': {err}", module.symbol()))
            })?;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
