use std::sync::Mutex;

use anyhow::Result;
use dynkernel::{
    ComputeCapability, DType, DynamicKernel, KernelConfig, KernelError, StreamHandle,
};
use dynkernel_tests::{input_tensor, FakeToolchain, RecordingDevice, FAKE_IMAGE_MAGIC};

const COPY_KERNEL: &str = r#"extern "C" __global__ void template_op_kernel0(float* __restrict__ input0, float* __restrict__ output0) {
  // [thread_extent] blockIdx.x = 2
  // [thread_extent] threadIdx.x = 32
  output0[((int)blockIdx.x) * 32 + ((int)threadIdx.x)] = input0[((int)blockIdx.x) * 32 + ((int)threadIdx.x)];
}
"#;

const PERMUTED_KERNEL: &str = r#"extern "C" __global__ void permuted_kernel(float* __restrict__ output0, float* __restrict__ input1, float* __restrict__ input0) {
  // [thread_extent] blockIdx.y = 4
  // [thread_extent] threadIdx.x = 8
  // [thread_extent] threadIdx.y = 8
  output0[threadIdx.x] = input0[threadIdx.x] - input1[threadIdx.y];
}
"#;

fn copy_config(toolchain: &FakeToolchain) -> KernelConfig {
    KernelConfig::new(COPY_KERNEL, toolchain.module_path("copy"))
        .with_ir_descriptor("output0[N] = input0[N] where N in 64")
        .with_inputs(["64-/float32"])
        .with_outputs(["64-/float32"])
}

#[test]
fn construct_and_launch_binds_geometry_and_addresses() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("round-trip")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 6));
    let config = copy_config(&toolchain);
    let kernel = DynamicKernel::with_compiler(&config, device.clone(), &toolchain.compiler())?;

    let input = input_tensor(&device, &[64]);
    let outputs = kernel.compute(std::slice::from_ref(&input), StreamHandle::DEFAULT)?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].dims(), &[64]);
    assert_eq!(outputs[0].dtype(), DType::Float32);
    assert_eq!(outputs[0].buffer.bytes(), 256);

    let launches = recording.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].grid, (2, 1, 1));
    assert_eq!(launches[0].block, (32, 1, 1));
    assert_eq!(launches[0].shared_mem_bytes, 0);
    assert_eq!(launches[0].stream, StreamHandle::DEFAULT);
    assert_eq!(
        launches[0].args,
        vec![input.device_ptr(), outputs[0].device_ptr()]
    );
    assert_eq!(kernel.launch_count(), 1);
    assert_eq!(recording.resolved_symbols(), vec!["template_op_kernel0"]);
    Ok(())
}

#[test]
fn compiler_receives_staged_source_and_target_architecture() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("invocation")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 6));
    let config = copy_config(&toolchain).with_blend("#define BLEND_MARKER 1");
    let _kernel = DynamicKernel::with_compiler(&config, device, &toolchain.compiler())?;

    let paths = config.artifact_paths();
    assert!(paths.source.to_string_lossy().ends_with("copy.kernel.src"));
    assert!(paths.binary.to_string_lossy().ends_with("copy.kernel.out"));
    assert_eq!(
        toolchain.recorded_args()?,
        vec![
            "-x".to_string(),
            "cu".to_string(),
            paths.source.display().to_string(),
            "--fatbin".to_string(),
            "-O2".to_string(),
            "-gencode".to_string(),
            "arch=compute_86,code=sm_86".to_string(),
            "-o".to_string(),
            paths.binary.display().to_string(),
        ]
    );

    let staged = std::fs::read_to_string(&paths.source)?;
    assert!(staged.starts_with("#include <cuda_runtime.h>\n#include <cuda_fp16.h>\n"));
    assert!(staged.contains("#define BLEND_MARKER 1\n"));
    assert!(staged.ends_with(COPY_KERNEL));

    let images = recording.loaded_images();
    assert_eq!(images.len(), 1);
    assert!(images[0].starts_with(FAKE_IMAGE_MAGIC));
    assert_eq!(&images[0][FAKE_IMAGE_MAGIC.len()..], staged.as_bytes());
    assert_eq!(recording.capability_queries(), 1);
    Ok(())
}

#[test]
fn arguments_follow_parameter_names_not_declaration_order() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("permuted")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(7, 5));
    let config = KernelConfig::new(PERMUTED_KERNEL, toolchain.module_path("permuted"))
        .with_inputs(["8-", "8-"])
        .with_outputs(["8-"]);
    let kernel = DynamicKernel::with_compiler(&config, device.clone(), &toolchain.compiler())?;
    assert_eq!(kernel.spec().geometry.grid, [1, 4, 1]);
    assert_eq!(kernel.spec().geometry.block, [8, 8, 1]);

    let a = input_tensor(&device, &[8]);
    let b = input_tensor(&device, &[8]);
    let outputs = kernel.compute(&[a.clone(), b.clone()], StreamHandle(7))?;

    let launch = &recording.launches()[0];
    assert_eq!(launch.stream, StreamHandle(7));
    assert_eq!(
        launch.args,
        vec![outputs[0].device_ptr(), b.device_ptr(), a.device_ptr()]
    );
    Ok(())
}

#[test]
fn sequential_invocations_get_fresh_outputs() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("sequential")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    let kernel =
        DynamicKernel::with_compiler(&copy_config(&toolchain), device.clone(), &toolchain.compiler())?;

    let first_input = input_tensor(&device, &[64]);
    let second_input = input_tensor(&device, &[64]);
    let first = kernel.compute(&[first_input.clone()], StreamHandle::DEFAULT)?;
    let second = kernel.compute(&[second_input.clone()], StreamHandle::DEFAULT)?;

    let launches = recording.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].grid, launches[1].grid);
    assert_eq!(launches[0].function, launches[1].function);
    assert_eq!(launches[0].args[0], first_input.device_ptr());
    assert_eq!(launches[1].args[0], second_input.device_ptr());
    assert_ne!(first[0].device_ptr(), second[0].device_ptr());
    assert_eq!(kernel.launch_count(), 2);
    assert_eq!(recording.loaded_images().len(), 1);
    Ok(())
}

#[test]
fn output_descriptors_shape_the_allocations() -> Result<()> {
    const TWO_OUTPUTS: &str = r#"__global__ void split(float* input0, float* output0, long* output1) {
  // [thread_extent] threadIdx.x = 4
}"#;
    let toolchain = FakeToolchain::succeeding("shapes")?;
    let (_recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    let config = KernelConfig::new(TWO_OUTPUTS, toolchain.module_path("split"))
        .with_inputs(["4-8-"])
        .with_outputs(["4-8-/float32/output0", "-/int64"]);
    let kernel = DynamicKernel::with_compiler(&config, device.clone(), &toolchain.compiler())?;

    let outputs = kernel.compute(&[input_tensor(&device, &[4, 8])], StreamHandle::DEFAULT)?;
    assert_eq!(outputs[0].dims(), &[4, 8]);
    assert_eq!(outputs[0].buffer.bytes(), 128);
    assert!(outputs[1].dims().is_empty());
    assert_eq!(outputs[1].dtype(), DType::Int64);
    assert_eq!(outputs[1].buffer.bytes(), 8);
    Ok(())
}

#[test]
fn failed_compilation_never_loads_a_module() -> Result<()> {
    let toolchain = FakeToolchain::failing("compile-error", 2)?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    let err = DynamicKernel::with_compiler(&copy_config(&toolchain), device, &toolchain.compiler())
        .expect_err("compilation must fail");

    match err {
        KernelError::CompilationFailed { stderr, .. } => {
            assert!(stderr.contains("undefined_symbol"), "stderr: {stderr}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(toolchain.was_invoked());
    assert!(recording.loaded_images().is_empty());
    Ok(())
}

#[test]
fn malformed_source_fails_before_the_toolchain_runs() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("malformed")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));

    let bad_marker = COPY_KERNEL.replace("threadIdx.x = 32", "threadIdx.x = warp");
    let config = KernelConfig::new(bad_marker, toolchain.module_path("bad-marker"))
        .with_inputs(["64-"])
        .with_outputs(["64-"]);
    let err = DynamicKernel::with_compiler(&config, device.clone(), &toolchain.compiler())
        .expect_err("marker must be rejected");
    assert!(matches!(
        err,
        KernelError::MalformedMetadata {
            axis: "threadIdx.x",
            ..
        }
    ));

    let bad_param = COPY_KERNEL.replace("input0,", "scratch,");
    let config = KernelConfig::new(bad_param, toolchain.module_path("bad-param"))
        .with_inputs(["64-"])
        .with_outputs(["64-"]);
    let err = DynamicKernel::with_compiler(&config, device.clone(), &toolchain.compiler())
        .expect_err("parameter must be rejected");
    assert!(matches!(err, KernelError::MalformedSignature(_)));

    let config = copy_config(&toolchain).with_outputs(["64-", "64-"]);
    let err = DynamicKernel::with_compiler(&config, device, &toolchain.compiler())
        .expect_err("descriptor count must match");
    assert!(matches!(err, KernelError::Configuration(_)));

    assert!(!toolchain.was_invoked());
    assert_eq!(recording.capability_queries(), 0);
    Ok(())
}

#[test]
fn driver_failures_map_to_their_stage() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("driver-failures")?;

    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    recording.fail_capability_query(100);
    let err = DynamicKernel::with_compiler(&copy_config(&toolchain), device, &toolchain.compiler())
        .expect_err("capability query must fail");
    assert!(matches!(err, KernelError::CompilationFailed { .. }));

    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    recording.fail_module_load(218);
    let err = DynamicKernel::with_compiler(&copy_config(&toolchain), device, &toolchain.compiler())
        .expect_err("module load must fail");
    match err {
        KernelError::ModuleLoadFailed(source) => assert_eq!(source.code, 218),
        other => panic!("unexpected error: {other}"),
    }

    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    recording.fail_symbol_lookup(500);
    let config = copy_config(&toolchain).with_entry_symbol("renamed_kernel");
    let err = DynamicKernel::with_compiler(&config, device, &toolchain.compiler())
        .expect_err("symbol lookup must fail");
    match err {
        KernelError::SymbolResolutionFailed { symbol, source } => {
            assert_eq!(symbol, "renamed_kernel");
            assert_eq!(source.code, 500);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(recording.live_modules(), 0, "module must be unloaded");
    Ok(())
}

#[test]
fn invocation_errors_leave_the_kernel_usable() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("invocation-errors")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    let kernel =
        DynamicKernel::with_compiler(&copy_config(&toolchain), device.clone(), &toolchain.compiler())?;
    let input = input_tensor(&device, &[64]);
    let allocations_before = recording.allocations().len();

    let err = kernel
        .compute(&[], StreamHandle::DEFAULT)
        .expect_err("arity must be checked");
    assert!(matches!(err, KernelError::Configuration(_)));
    assert_eq!(recording.allocations().len(), allocations_before);

    recording.fail_alloc(Some(2));
    let err = kernel
        .compute(&[input.clone()], StreamHandle::DEFAULT)
        .expect_err("allocation must fail");
    assert!(matches!(
        err,
        KernelError::AllocationFailed {
            index: 0,
            bytes: 256,
            ..
        }
    ));
    recording.fail_alloc(None);

    recording.fail_launch(Some(719));
    let err = kernel
        .compute(&[input.clone()], StreamHandle::DEFAULT)
        .expect_err("launch must fail");
    assert!(matches!(err, KernelError::LaunchFailed(_)));
    recording.fail_launch(None);

    assert!(recording.launches().is_empty());
    assert_eq!(kernel.launch_count(), 0);
    let live_before = recording.live_allocations();
    kernel.compute(&[input], StreamHandle::DEFAULT)?;
    assert_eq!(recording.launches().len(), 1);
    assert_eq!(kernel.launch_count(), 1);
    assert_eq!(recording.live_allocations(), live_before, "outputs were dropped");
    Ok(())
}

#[test]
fn async_invocation_reports_through_callback() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("async")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    let kernel =
        DynamicKernel::with_compiler(&copy_config(&toolchain), device.clone(), &toolchain.compiler())?;
    let input = input_tensor(&device, &[64]);

    let received = Mutex::new(None);
    kernel.compute_async(&[input.clone()], StreamHandle(3), |result| {
        *received.lock().expect("lock") = Some(result);
    });
    let outputs = received
        .into_inner()
        .expect("lock")
        .expect("callback ran")?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(
        recording.launches()[0].args,
        vec![input.device_ptr(), outputs[0].device_ptr()]
    );

    let failed = Mutex::new(None);
    kernel.compute_async(&[], StreamHandle(3), |result| {
        *failed.lock().expect("lock") = Some(result.is_err());
    });
    assert_eq!(failed.into_inner().expect("lock"), Some(true));
    assert_eq!(recording.launches().len(), 1);
    Ok(())
}

#[test]
fn release_is_idempotent_and_blocks_later_launches() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("release")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    let mut kernel =
        DynamicKernel::with_compiler(&copy_config(&toolchain), device.clone(), &toolchain.compiler())?;
    assert!(kernel.is_loaded());
    assert_eq!(
        kernel.ir_descriptor(),
        "output0[N] = input0[N] where N in 64"
    );

    kernel.release();
    kernel.release();
    assert!(!kernel.is_loaded());
    assert_eq!(recording.unload_calls(), 1);
    assert_eq!(recording.live_modules(), 0);

    let input = input_tensor(&device, &[64]);
    let err = kernel
        .compute(&[input], StreamHandle::DEFAULT)
        .expect_err("released kernel must not launch");
    assert!(matches!(err, KernelError::LaunchFailed(_)));

    drop(kernel);
    assert_eq!(recording.unload_calls(), 1);
    Ok(())
}

#[test]
fn dropping_a_kernel_unloads_its_module() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("drop")?;
    let (recording, device) = RecordingDevice::shared(ComputeCapability::new(8, 0));
    let kernel =
        DynamicKernel::with_compiler(&copy_config(&toolchain), device, &toolchain.compiler())?;
    assert_eq!(recording.live_modules(), 1);
    drop(kernel);
    assert_eq!(recording.live_modules(), 0);
    assert_eq!(recording.unload_calls(), 1);
    Ok(())
}

#[test]
fn explicit_architecture_compiles_without_a_device() -> Result<()> {
    let toolchain = FakeToolchain::succeeding("compile-for")?;
    let paths = copy_config(&toolchain).artifact_paths();
    let artifact = toolchain.compiler().compile_for(
        COPY_KERNEL,
        None,
        ComputeCapability::new(7, 5),
        &paths,
    )?;

    assert_eq!(artifact.capability, ComputeCapability::new(7, 5));
    assert_eq!(artifact.path, paths.binary);
    assert!(artifact.image.starts_with(FAKE_IMAGE_MAGIC));
    let args = toolchain.recorded_args()?;
    assert!(
        args.iter().any(|arg| arg == "arch=compute_75,code=sm_75"),
        "args: {args:?}"
    );
    assert_eq!(args.last(), Some(&paths.binary.display().to_string()));
    Ok(())
}
