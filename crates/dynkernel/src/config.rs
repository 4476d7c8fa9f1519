use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Construction attributes supplied by the host for one kernel instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    pub source: String,
    pub module_path: PathBuf,
    /// Carried for traceability only.
    #[serde(default)]
    pub ir_descriptor: String,
    #[serde(default)]
    pub input_descriptors: Vec<String>,
    #[serde(default)]
    pub output_descriptors: Vec<String>,
    /// Extra preamble placed between the standard headers and the kernel source.
    #[serde(default)]
    pub blend: Option<String>,
    /// Overrides the entry point name parsed from the signature.
    #[serde(default)]
    pub entry_symbol: Option<String>,
}

impl KernelConfig {
    pub fn new(source: impl Into<String>, module_path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            module_path: module_path.into(),
            ir_descriptor: String::new(),
            input_descriptors: Vec::new(),
            output_descriptors: Vec::new(),
            blend: None,
            entry_symbol: None,
        }
    }

    pub fn with_ir_descriptor(mut self, ir_descriptor: impl Into<String>) -> Self {
        self.ir_descriptor = ir_descriptor.into();
        self
    }

    pub fn with_inputs<I, S>(mut self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_descriptors = descriptors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_descriptors = descriptors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blend(mut self, blend: impl Into<String>) -> Self {
        self.blend = Some(blend.into());
        self
    }

    pub fn with_entry_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.entry_symbol = Some(symbol.into());
        self
    }

    pub fn from_json_str(src: &str) -> KernelResult<Self> {
        let config: KernelConfig = serde_json::from_str(src)
            .map_err(|err| KernelError::configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.source.trim().is_empty() {
            return Err(KernelError::configuration("attribute 'source' is empty"));
        }
        if self.module_path.as_os_str().is_empty() {
            return Err(KernelError::configuration("attribute 'module_path' is empty"));
        }
        if let Some(symbol) = &self.entry_symbol {
            if symbol.trim().is_empty() {
                return Err(KernelError::configuration("attribute 'entry_symbol' is empty"));
            }
        }
        Ok(())
    }

    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::for_module_path(&self.module_path)
    }
}

/// Transient build products derived from `module_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub source: PathBuf,
    pub binary: PathBuf,
}

impl ArtifactPaths {
    pub fn for_module_path(base: &Path) -> Self {
        Self {
            source: with_suffix(base, ".kernel.src"),
            binary: with_suffix(base, ".kernel.out"),
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut raw = base.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}
