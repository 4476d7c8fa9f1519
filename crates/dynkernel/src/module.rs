use std::fmt;
use std::sync::Arc;

use crate::device::{Device, FunctionHandle, ModuleHandle};
use crate::error::{KernelError, KernelResult};

/// Device module owning the resolved entry point of one kernel instance.
pub struct LoadedModule {
    device: Arc<dyn Device>,
    module: Option<ModuleHandle>,
    function: Option<FunctionHandle>,
    symbol: String,
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("device", &self.device.name())
            .field("module", &self.module)
            .field("function", &self.function)
            .field("symbol", &self.symbol)
            .finish()
    }
}

impl LoadedModule {
    pub fn load(device: Arc<dyn Device>, image: &[u8], symbol: &str) -> KernelResult<Self> {
        let module = device
            .load_module(image)
            .map_err(KernelError::ModuleLoadFailed)?;
        // Own the handle before resolving so a failed lookup still unloads it.
        let mut loaded = Self {
            device,
            module: Some(module),
            function: None,
            symbol: symbol.to_string(),
        };
        let function = loaded
            .device
            .get_function(module, symbol)
            .map_err(|source| KernelError::SymbolResolutionFailed {
                symbol: symbol.to_string(),
                source,
            })?;
        loaded.function = Some(function);
        tracing::debug!(
            target: "dynkernel",
            device = loaded.device.name(),
            symbol,
            image_bytes = image.len(),
            "kernel module loaded"
        );
        Ok(loaded)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn is_loaded(&self) -> bool {
        self.module.is_some()
    }

    pub fn function(&self) -> KernelResult<FunctionHandle> {
        self.function.ok_or_else(|| {
            KernelError::LaunchFailed(format!("module for '{}' was already released", self.symbol))
        })
    }

    /// Unloads the module once; later calls do nothing.
    pub fn release(&mut self) {
        self.function = None;
        let Some(module) = self.module.take() else {
            return;
        };
        match self.device.unload_module(module) {
            Ok(()) => tracing::debug!(
                target: "dynkernel",
                symbol = %self.symbol,
                "kernel module unloaded"
            ),
            Err(err) => tracing::warn!(
                target: "dynkernel",
                symbol = %self.symbol,
                error = %err,
                "kernel module unload failed"
            ),
        }
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        self.release();
    }
}
