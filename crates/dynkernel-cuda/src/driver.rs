use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::{Arc, OnceLock};

use dynkernel::{
    ArgumentTable, ComputeCapability, Device, DevicePtr, DriverError, DriverResult,
    FunctionHandle, LaunchGeometry, ModuleHandle, StreamHandle,
};
use libloading::Library;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: i32 = 76;
const DEVICE_NAME_LEN: usize = 256;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetNameFn =
    unsafe extern "C" fn(name: *mut c_char, len: i32, dev: CUdevice) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attrib: i32, dev: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSynchronizeFn = unsafe extern "C" fn() -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuModuleLoadDataFn =
    unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_get_name: CuDeviceGetNameFn,
    cu_device_get_attribute: CuDeviceGetAttributeFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_ctx_synchronize: CuCtxSynchronizeFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_module_load_data: CuModuleLoadDataFn,
    cu_module_unload: CuModuleUnloadFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
}

/// Device 0 of the CUDA driver, with a context owned by this instance.
pub struct CudaDevice {
    _lib: Library,
    fns: DriverFns,
    device: CUdevice,
    name: String,
    // Stored as usize so the device can be shared across threads.
    ctx: usize,
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: Context is owned by this device and destroyed once on drop.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

static CUDA_DEVICE: OnceLock<Result<Arc<CudaDevice>, DriverError>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide device, initialised on first use.
pub fn driver() -> DriverResult<Arc<CudaDevice>> {
    let init = CUDA_DEVICE.get_or_init(|| {
        CudaDevice::new().map(Arc::new).map_err(|err| {
            tracing::debug!(target: "dynkernel", error = %err, "CUDA driver unavailable");
            err
        })
    });
    init.clone()
}

impl CudaDevice {
    fn new() -> DriverResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_name: load_symbol(&lib, b"cuDeviceGetName\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_ctx_synchronize: load_symbol(&lib, b"cuCtxSynchronize\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_module_load_data: load_symbol(&lib, b"cuModuleLoadData\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
        };

        // SAFETY: Calls are made with valid pointers and follow CUDA driver API contract.
        unsafe {
            check_cuda((fns.cu_init)(0), "cuInit")?;
            let mut dev: CUdevice = 0;
            check_cuda(
                (fns.cu_device_get)(&mut dev as *mut CUdevice, 0),
                "cuDeviceGet",
            )?;
            let mut raw_name = [0 as c_char; DEVICE_NAME_LEN];
            check_cuda(
                (fns.cu_device_get_name)(raw_name.as_mut_ptr(), DEVICE_NAME_LEN as i32, dev),
                "cuDeviceGetName",
            )?;
            let name = CStr::from_ptr(raw_name.as_ptr())
                .to_string_lossy()
                .into_owned();
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda(
                (fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            check_cuda((fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;
            tracing::info!(target: "dynkernel", device = %name, "CUDA context created");
            Ok(Self {
                _lib: lib,
                fns,
                device: dev,
                name,
                ctx: ctx as usize,
            })
        }
    }

    pub fn upload(&self, dst: DevicePtr, bytes: &[u8]) -> DriverResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: Destination is a device allocation of at least `bytes.len()` bytes.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_hto_d_v2)(dst, bytes.as_ptr() as *const c_void, bytes.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    pub fn download(&self, src: DevicePtr, bytes: usize) -> DriverResult<Vec<u8>> {
        self.ensure_current()?;
        let mut out = vec![0u8; bytes];
        if bytes != 0 {
            // SAFETY: Source device pointer is valid for `bytes`; destination host buffer is writable.
            unsafe {
                check_cuda(
                    (self.fns.cu_memcpy_dto_h_v2)(out.as_mut_ptr() as *mut c_void, src, bytes),
                    "cuMemcpyDtoH_v2",
                )?;
            }
        }
        Ok(out)
    }

    /// Blocks until all work submitted to this context has finished.
    pub fn synchronize(&self) -> DriverResult<()> {
        self.ensure_current()?;
        // SAFETY: Context is current on this thread.
        unsafe { check_cuda((self.fns.cu_ctx_synchronize)(), "cuCtxSynchronize") }
    }

    fn attribute(&self, attrib: i32) -> DriverResult<i32> {
        let mut value = 0i32;
        // SAFETY: `value` is a valid out pointer and the device ordinal came from cuDeviceGet.
        unsafe {
            check_cuda(
                (self.fns.cu_device_get_attribute)(&mut value as *mut i32, attrib, self.device),
                "cuDeviceGetAttribute",
            )?;
        }
        Ok(value)
    }

    fn ensure_current(&self) -> DriverResult<()> {
        // SAFETY: Context was created by this device and remains valid until drop.
        unsafe {
            check_cuda(
                (self.fns.cu_ctx_set_current)(self.ctx_ptr()),
                "cuCtxSetCurrent",
            )
        }
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }
}

impl Device for CudaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute_capability(&self) -> DriverResult<ComputeCapability> {
        let major = self.attribute(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = self.attribute(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        Ok(ComputeCapability::new(major as u32, minor as u32))
    }

    fn load_module(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        if image.is_empty() {
            return Err(DriverError::with_message(
                "cuModuleLoadData",
                CUDA_ERROR_INVALID_VALUE,
                "empty module image",
            ));
        }
        self.ensure_current()?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: `image` outlives the call and the driver copies what it keeps.
        unsafe {
            check_cuda(
                (self.fns.cu_module_load_data)(
                    &mut module as *mut CUmodule,
                    image.as_ptr() as *const c_void,
                ),
                "cuModuleLoadData",
            )?;
        }
        Ok(ModuleHandle(module as usize))
    }

    fn get_function(&self, module: ModuleHandle, symbol: &str) -> DriverResult<FunctionHandle> {
        let c_symbol = CString::new(symbol).map_err(|_| {
            DriverError::with_message(
                "cuModuleGetFunction",
                CUDA_ERROR_INVALID_VALUE,
                "kernel symbol contains NUL byte",
            )
        })?;
        self.ensure_current()?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: Module handle came from load_module and the out pointer is valid.
        unsafe {
            check_cuda(
                (self.fns.cu_module_get_function)(
                    &mut function as *mut CUfunction,
                    module.0 as CUmodule,
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }
        Ok(FunctionHandle(function as usize))
    }

    fn unload_module(&self, module: ModuleHandle) -> DriverResult<()> {
        self.ensure_current()?;
        // SAFETY: Module belongs to this context and is unloaded once by its owner.
        unsafe {
            check_cuda(
                (self.fns.cu_module_unload)(module.0 as CUmodule),
                "cuModuleUnload",
            )
        }
    }

    fn alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        if bytes == 0 {
            return Ok(0);
        }
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) {
        if ptr == 0 {
            return;
        }
        // SAFETY: Pointer was allocated by this device and is released once by its owner.
        let code = unsafe { (self.fns.cu_mem_free_v2)(ptr) };
        if let Err(err) = check_cuda(code, "cuMemFree_v2") {
            tracing::warn!(target: "dynkernel", ptr, error = %err, "device free failed");
        }
    }

    fn launch(
        &self,
        function: FunctionHandle,
        geometry: &LaunchGeometry,
        shared_mem_bytes: u32,
        stream: StreamHandle,
        args: &mut ArgumentTable,
    ) -> DriverResult<()> {
        self.ensure_current()?;
        let (gx, gy, gz) = geometry.grid_dims();
        let (bx, by, bz) = geometry.block_dims();
        let mut params = args.kernel_params();
        // SAFETY: Function handle is live and every parameter points at a slot of `args`,
        // which outlives this call.
        unsafe {
            check_cuda(
                (self.fns.cu_launch_kernel)(
                    function.0 as CUfunction,
                    gx,
                    gy,
                    gz,
                    bx,
                    by,
                    bz,
                    shared_mem_bytes,
                    stream.0 as CUstream,
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }
}

fn load_cuda_library() -> DriverResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Only checks that the library loads; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(DriverError::with_message(
        "dlopen",
        CUDA_ERROR_NOT_INITIALIZED,
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> DriverResult<T> {
    // SAFETY: Caller provides expected symbol type from CUDA driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        DriverError::with_message(
            "dlsym",
            CUDA_ERROR_NOT_INITIALIZED,
            format!(
                "failed to resolve CUDA symbol {}: {err}",
                String::from_utf8_lossy(name)
            ),
        )
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, op: &'static str) -> DriverResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::new(op, code))
    }
}
