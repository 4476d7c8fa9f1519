use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::metadata::{parse_metadata, LaunchGeometry, ParamBinding};
use crate::shape::{derive_output_shapes, OutputShape};

/// Immutable description of a kernel instance, validated before any toolchain runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub source: String,
    pub staging_path: PathBuf,
    pub artifact_path: PathBuf,
    pub entry_symbol: String,
    pub geometry: LaunchGeometry,
    pub bindings: Vec<ParamBinding>,
    pub output_shapes: Vec<OutputShape>,
    pub input_count: usize,
}

impl KernelSpec {
    pub fn from_config(config: &KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        let metadata = parse_metadata(&config.source)?;
        let signature = metadata.signature;

        let declared_inputs = config.input_descriptors.len();
        let declared_outputs = config.output_descriptors.len();
        if signature.input_count() != declared_inputs {
            return Err(KernelError::configuration(format!(
                "kernel '{}' takes {} inputs but {declared_inputs} input descriptors were supplied",
                signature.symbol,
                signature.input_count()
            )));
        }
        if signature.output_count() != declared_outputs {
            return Err(KernelError::configuration(format!(
                "kernel '{}' produces {} outputs but {declared_outputs} output descriptors were supplied",
                signature.symbol,
                signature.output_count()
            )));
        }

        let paths = config.artifact_paths();
        Ok(Self {
            source: config.source.clone(),
            staging_path: paths.source,
            artifact_path: paths.binary,
            entry_symbol: config
                .entry_symbol
                .clone()
                .unwrap_or(signature.symbol),
            geometry: metadata.geometry,
            bindings: signature.bindings,
            output_shapes: derive_output_shapes(&config.output_descriptors),
            input_count: declared_inputs,
        })
    }

    pub fn param_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn output_count(&self) -> usize {
        self.output_shapes.len()
    }
}
