use std::env;
use std::fs;
use std::path::Path;

pub const NVCC_VAR: &str = "DYNKERNEL_NVCC";
pub const NVCC_LAUNCHER_VAR: &str = "DYNKERNEL_NVCC_LAUNCHER";
pub const NVCC_OPT_LEVEL_VAR: &str = "DYNKERNEL_NVCC_OPT_LEVEL";
pub const NVCC_FLAGS_VAR: &str = "DYNKERNEL_NVCC_FLAGS";

pub(crate) fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Number of `/dev/nvidia<N>` device nodes, i.e. how many GPUs can run kernels in parallel.
pub fn execution_parallelism() -> usize {
    count_device_nodes(Path::new("/dev"))
}

pub(crate) fn count_device_nodes(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("nvidia"))
                .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
        })
        .count()
}
