use std::sync::Arc;
use std::time::Instant;

use crate::binder::ArgumentTable;
use crate::compiler::KernelCompiler;
use crate::config::{ArtifactPaths, KernelConfig};
use crate::device::{Device, DeviceBuffer, KernelTensor, StreamHandle};
use crate::error::{KernelError, KernelResult};
use crate::launch::LaunchExecutor;
use crate::module::LoadedModule;
use crate::spec::KernelSpec;

/// One operator instance: a compiled, loaded kernel that is launched once per invocation.
///
/// Construction is blocking and fatal on any failure. Invocations build their own argument
/// table and output buffers, so the instance can be shared across threads.
#[derive(Debug)]
pub struct DynamicKernel {
    spec: KernelSpec,
    ir_descriptor: String,
    module: LoadedModule,
    executor: LaunchExecutor,
}

impl DynamicKernel {
    /// Builds an instance with the toolchain configured from the environment.
    pub fn new(config: &KernelConfig, device: Arc<dyn Device>) -> KernelResult<Self> {
        Self::with_compiler(config, device, &KernelCompiler::from_env())
    }

    pub fn with_compiler(
        config: &KernelConfig,
        device: Arc<dyn Device>,
        compiler: &KernelCompiler,
    ) -> KernelResult<Self> {
        let started = Instant::now();
        let spec = KernelSpec::from_config(config)?;
        tracing::info!(
            target: "dynkernel",
            ir = %config.ir_descriptor,
            symbol = %spec.entry_symbol,
            grid = ?spec.geometry.grid,
            block = ?spec.geometry.block,
            params = spec.param_count(),
            "constructing dynamic kernel"
        );

        let paths = ArtifactPaths {
            source: spec.staging_path.clone(),
            binary: spec.artifact_path.clone(),
        };
        let artifact =
            compiler.compile(&spec.source, config.blend.as_deref(), device.as_ref(), &paths)?;
        let module = LoadedModule::load(device, &artifact.image, &spec.entry_symbol)?;

        tracing::info!(
            target: "dynkernel",
            ir = %config.ir_descriptor,
            symbol = %spec.entry_symbol,
            arch = %artifact.capability,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dynamic kernel ready"
        );
        Ok(Self {
            spec,
            ir_descriptor: config.ir_descriptor.clone(),
            module,
            executor: LaunchExecutor::new(),
        })
    }

    pub fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn ir_descriptor(&self) -> &str {
        &self.ir_descriptor
    }

    pub fn is_loaded(&self) -> bool {
        self.module.is_loaded()
    }

    pub fn launch_count(&self) -> u64 {
        self.executor.accepted_launches()
    }

    /// Allocates outputs, binds arguments and submits one launch on `stream`.
    ///
    /// Returns once the launch was accepted; the outputs are valid for work ordered after it
    /// on the same stream.
    pub fn compute(
        &self,
        inputs: &[KernelTensor],
        stream: StreamHandle,
    ) -> KernelResult<Vec<KernelTensor>> {
        self.check_arity(inputs)?;
        let outputs = self.allocate_outputs()?;
        let mut args = ArgumentTable::bind_tensors(&self.spec.bindings, inputs, &outputs);
        self.executor
            .launch(&self.module, &self.spec.geometry, &mut args, stream)?;
        Ok(outputs)
    }

    /// Callback flavour of [`DynamicKernel::compute`] for hosts with an async operator API.
    pub fn compute_async<F>(&self, inputs: &[KernelTensor], stream: StreamHandle, done: F)
    where
        F: FnOnce(KernelResult<Vec<KernelTensor>>),
    {
        let outputs = match self
            .check_arity(inputs)
            .and_then(|()| self.allocate_outputs())
        {
            Ok(outputs) => outputs,
            Err(err) => {
                done(Err(err));
                return;
            }
        };
        let mut args = ArgumentTable::bind_tensors(&self.spec.bindings, inputs, &outputs);
        self.executor.submit(
            &self.module,
            &self.spec.geometry,
            &mut args,
            stream,
            |accepted| done(accepted.map(|()| outputs)),
        );
    }

    /// Unloads the module. Safe to call more than once; later invocations fail.
    pub fn release(&mut self) {
        self.module.release();
    }

    fn check_arity(&self, inputs: &[KernelTensor]) -> KernelResult<()> {
        if inputs.len() == self.spec.input_count {
            return Ok(());
        }
        Err(KernelError::configuration(format!(
            "kernel '{}' expects {} inputs, got {}",
            self.spec.entry_symbol,
            self.spec.input_count,
            inputs.len()
        )))
    }

    fn allocate_outputs(&self) -> KernelResult<Vec<KernelTensor>> {
        let device = self.module.device();
        self.spec
            .output_shapes
            .iter()
            .enumerate()
            .map(|(index, shape)| {
                let bytes = shape.byte_len().ok_or_else(|| {
                    KernelError::configuration(format!(
                        "output {index} shape {:?} overflows the addressable size",
                        shape.dims
                    ))
                })?;
                let buffer = DeviceBuffer::alloc(device, bytes).map_err(|source| {
                    KernelError::AllocationFailed {
                        index,
                        bytes,
                        source,
                    }
                })?;
                Ok(KernelTensor::new(shape.clone(), Arc::new(buffer)))
            })
            .collect()
    }
}
