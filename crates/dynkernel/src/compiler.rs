use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Instant;

use crate::config::ArtifactPaths;
use crate::device::{ComputeCapability, Device};
use crate::env::{non_empty_var, NVCC_FLAGS_VAR, NVCC_LAUNCHER_VAR, NVCC_OPT_LEVEL_VAR, NVCC_VAR};
use crate::error::{KernelError, KernelResult};

const DEFAULT_NVCC: &str = "/usr/local/cuda/bin/nvcc";
const DEFAULT_OPT_LEVEL: u8 = 2;
const STANDARD_HEADERS: &str = "#include <cuda_runtime.h>\n#include <cuda_fp16.h>\n\n";

/// How the external ahead-of-time compiler is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    pub nvcc: PathBuf,
    /// Wrapper the compiler runs under, e.g. `ccache`.
    pub launcher: Option<PathBuf>,
    pub opt_level: u8,
    pub extra_flags: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            nvcc: default_nvcc(),
            launcher: None,
            opt_level: DEFAULT_OPT_LEVEL,
            extra_flags: Vec::new(),
        }
    }
}

static ENV_COMPILER_CONFIG: OnceLock<CompilerConfig> = OnceLock::new();

impl CompilerConfig {
    /// Process-wide configuration read from `DYNKERNEL_NVCC*` variables on first use.
    pub fn from_env() -> &'static CompilerConfig {
        ENV_COMPILER_CONFIG.get_or_init(|| {
            let defaults = CompilerConfig::default();
            let opt_level = match non_empty_var(NVCC_OPT_LEVEL_VAR) {
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    tracing::warn!(
                        target: "dynkernel",
                        var = NVCC_OPT_LEVEL_VAR,
                        value = %raw,
                        "ignoring non-integer optimisation level"
                    );
                    DEFAULT_OPT_LEVEL
                }),
                None => DEFAULT_OPT_LEVEL,
            };
            CompilerConfig {
                nvcc: non_empty_var(NVCC_VAR)
                    .map(PathBuf::from)
                    .unwrap_or(defaults.nvcc),
                launcher: non_empty_var(NVCC_LAUNCHER_VAR).map(PathBuf::from),
                opt_level,
                extra_flags: non_empty_var(NVCC_FLAGS_VAR)
                    .map(|flags| flags.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            }
        })
    }

    pub fn with_nvcc(mut self, nvcc: impl Into<PathBuf>) -> Self {
        self.nvcc = nvcc.into();
        self
    }

    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    pub fn with_opt_level(mut self, opt_level: u8) -> Self {
        self.opt_level = opt_level;
        self
    }

    pub fn with_extra_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_flags = flags.into_iter().map(Into::into).collect();
        self
    }
}

fn default_nvcc() -> PathBuf {
    let installed = Path::new(DEFAULT_NVCC);
    if installed.exists() {
        installed.to_path_buf()
    } else {
        PathBuf::from("nvcc")
    }
}

/// Loadable binary produced by one compiler run.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub path: PathBuf,
    pub image: Vec<u8>,
    pub capability: ComputeCapability,
}

/// Stages kernel source and turns it into a device binary with the external toolchain.
#[derive(Debug, Clone, Default)]
pub struct KernelCompiler {
    config: CompilerConfig,
}

impl KernelCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(CompilerConfig::from_env().clone())
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compiles for the compute capability reported by `device`.
    pub fn compile(
        &self,
        source: &str,
        blend: Option<&str>,
        device: &dyn Device,
        paths: &ArtifactPaths,
    ) -> KernelResult<CompiledArtifact> {
        stage_source(source, blend, &paths.source)?;
        let capability = device.compute_capability().map_err(|err| {
            KernelError::compilation(None, format!("cannot query compute capability: {err}"))
        })?;
        self.run(capability, paths)
    }

    /// Compiles for an explicit architecture without touching a device.
    pub fn compile_for(
        &self,
        source: &str,
        blend: Option<&str>,
        capability: ComputeCapability,
        paths: &ArtifactPaths,
    ) -> KernelResult<CompiledArtifact> {
        stage_source(source, blend, &paths.source)?;
        self.run(capability, paths)
    }

    pub fn command(&self, capability: ComputeCapability, paths: &ArtifactPaths) -> Command {
        let mut cmd = match &self.config.launcher {
            Some(launcher) => {
                let mut cmd = Command::new(launcher);
                cmd.arg(&self.config.nvcc);
                cmd
            }
            None => Command::new(&self.config.nvcc),
        };
        let arch = capability.arch_tag();
        cmd.arg("-x")
            .arg("cu")
            .arg(&paths.source)
            .arg("--fatbin")
            .arg(format!("-O{}", self.config.opt_level))
            .arg("-gencode")
            .arg(format!("arch=compute_{arch},code=sm_{arch}"))
            .args(&self.config.extra_flags)
            .arg("-o")
            .arg(&paths.binary);
        cmd
    }

    fn run(
        &self,
        capability: ComputeCapability,
        paths: &ArtifactPaths,
    ) -> KernelResult<CompiledArtifact> {
        let started = Instant::now();
        tracing::info!(
            target: "dynkernel",
            source = %paths.source.display(),
            binary = %paths.binary.display(),
            arch = %capability,
            "compiling kernel"
        );

        let output = self.command(capability, paths).output().map_err(|err| {
            KernelError::compilation(
                None,
                format!("failed to run {}: {err}", self.config.nvcc.display()),
            )
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            tracing::error!(
                target: "dynkernel",
                status = %output.status,
                stdout = %stdout.trim(),
                "kernel compilation failed"
            );
            return Err(KernelError::compilation(
                Some(output.status),
                stderr.trim().to_string(),
            ));
        }

        let image =
            fs::read(&paths.binary).map_err(|err| KernelError::io(&paths.binary, err))?;
        tracing::info!(
            target: "dynkernel",
            binary = %paths.binary.display(),
            bytes = image.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "kernel compiled"
        );
        Ok(CompiledArtifact {
            path: paths.binary.clone(),
            image,
            capability,
        })
    }
}

/// Source text as handed to the toolchain: standard headers, optional blend, kernel.
pub fn translate_source(source: &str, blend: Option<&str>) -> String {
    let blend = blend.unwrap_or_default();
    let mut out = String::with_capacity(STANDARD_HEADERS.len() + blend.len() + source.len() + 1);
    out.push_str(STANDARD_HEADERS);
    out.push_str(blend);
    out.push('\n');
    out.push_str(source);
    out
}

fn stage_source(source: &str, blend: Option<&str>, path: &Path) -> KernelResult<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| KernelError::io(parent, err))?;
    }
    fs::write(path, translate_source(source, blend)).map_err(|err| KernelError::io(path, err))
}
