use std::process::Command;
use std::sync::Arc;

use anyhow::Result;
use dynkernel::{
    CompilerConfig, Device, DeviceBuffer, DynamicKernel, KernelCompiler, KernelConfig,
    KernelTensor, OutputShape, StreamHandle,
};
use dynkernel_cuda::CudaDevice;

const SCALE_KERNEL: &str = r#"extern "C" __global__ void scale_kernel(float* __restrict__ output0, float* __restrict__ input0) {
  // [thread_extent] blockIdx.x = 4
  // [thread_extent] threadIdx.x = 64
  int idx = ((int)blockIdx.x) * 64 + ((int)threadIdx.x);
  output0[idx] = input0[idx] * 2.0f;
}
"#;

fn device_or_skip() -> Option<Arc<CudaDevice>> {
    if !dynkernel_cuda::is_available() {
        eprintln!("skipping CUDA kernel test: CUDA driver unavailable");
        return None;
    }
    let nvcc = &CompilerConfig::from_env().nvcc;
    if Command::new(nvcc).arg("--version").output().is_err() {
        eprintln!("skipping CUDA kernel test: {} not runnable", nvcc.display());
        return None;
    }
    dynkernel_cuda::driver().ok()
}

fn upload_f32(cuda: &CudaDevice, device: &Arc<dyn Device>, values: &[f32]) -> Result<KernelTensor> {
    let bytes = values
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect::<Vec<_>>();
    let buffer = DeviceBuffer::alloc(device, bytes.len())?;
    cuda.upload(buffer.device_ptr(), &bytes)?;
    Ok(KernelTensor::new(
        OutputShape::new(vec![values.len()], Default::default()),
        Arc::new(buffer),
    ))
}

#[test]
fn scale_kernel_runs_on_device() -> Result<()> {
    let Some(cuda) = device_or_skip() else {
        return Ok(());
    };
    let device: Arc<dyn Device> = cuda.clone();
    let module_path = std::env::temp_dir().join(format!("dynkernel-cuda-{}", std::process::id()));
    let config = KernelConfig::new(SCALE_KERNEL, &module_path)
        .with_inputs(["256-"])
        .with_outputs(["256-/float32"]);
    let kernel =
        DynamicKernel::with_compiler(&config, Arc::clone(&device), &KernelCompiler::from_env())?;

    let values = (0..256).map(|i| i as f32).collect::<Vec<_>>();
    let input = upload_f32(&cuda, &device, &values)?;
    let outputs = kernel.compute(&[input], StreamHandle::DEFAULT)?;
    cuda.synchronize()?;

    let raw = cuda.download(outputs[0].device_ptr(), outputs[0].buffer.bytes())?;
    let got = raw
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<_>>();
    let expected = values.iter().map(|value| value * 2.0).collect::<Vec<_>>();
    assert_eq!(got, expected);

    let paths = config.artifact_paths();
    let _ = std::fs::remove_file(paths.source);
    let _ = std::fs::remove_file(paths.binary);
    Ok(())
}
