use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

pub const DIM_DELIMITER: char = '-';
pub const DTYPE_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    Float32,
    Float16,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Bool,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Float64 | DType::Int64 => 8,
            DType::Float32 | DType::Int32 => 4,
            DType::Float16 | DType::Int16 => 2,
            DType::Int8 | DType::Uint8 | DType::Bool => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float16 => "float16",
            DType::Float64 => "float64",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Uint8 => "uint8",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(DType::Float32),
            "float16" | "f16" | "half" => Ok(DType::Float16),
            "float64" | "f64" => Ok(DType::Float64),
            "int8" | "i8" => Ok(DType::Int8),
            "int16" | "i16" => Ok(DType::Int16),
            "int32" | "i32" => Ok(DType::Int32),
            "int64" | "i64" => Ok(DType::Int64),
            "uint8" | "u8" => Ok(DType::Uint8),
            "bool" => Ok(DType::Bool),
            other => Err(KernelError::configuration(format!(
                "unknown element type '{other}'"
            ))),
        }
    }
}

/// Concrete shape and element type used to allocate one output per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OutputShape {
    pub dims: Vec<usize>,
    pub dtype: DType,
}

impl OutputShape {
    pub fn new(dims: Vec<usize>, dtype: DType) -> Self {
        Self { dims, dtype }
    }

    /// Rank-0 shapes hold a single element.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_in_bytes())
    }
}

/// Parses `"<d0>-<d1>-...-[/<dtype>[/...]]"` into an [`OutputShape`].
///
/// Only the text before the first `/` describes dims; only the segment after it names the
/// element type, and anything past a second `/` is ignored. Malformed dims give an empty
/// (rank-0) shape and an unknown element type gives float32, both with a warning.
pub fn derive_output_shape(descriptor: &str) -> OutputShape {
    let mut parts = descriptor.split(DTYPE_SEPARATOR);
    let dims_text = parts.next().unwrap_or_default();
    let dtype = parts.next().map_or(DType::default(), |name| parse_dtype(descriptor, name));
    OutputShape::new(parse_dims(dims_text), dtype)
}

pub fn derive_output_shapes<S: AsRef<str>>(descriptors: &[S]) -> Vec<OutputShape> {
    descriptors
        .iter()
        .map(|descriptor| derive_output_shape(descriptor.as_ref()))
        .collect()
}

fn parse_dtype(descriptor: &str, name: &str) -> DType {
    if name.trim().is_empty() {
        return DType::default();
    }
    name.parse::<DType>().unwrap_or_else(|_| {
        tracing::warn!(
            target: "dynkernel",
            descriptor,
            dtype = name,
            "unknown output element type; falling back to float32"
        );
        DType::default()
    })
}

fn parse_dims(text: &str) -> Vec<usize> {
    let mut dims = Vec::new();
    let mut tokens = text.trim().split(DIM_DELIMITER).peekable();
    while let Some(token) = tokens.next() {
        let token = token.trim();
        if token.is_empty() {
            // The trailing delimiter leaves one empty token at the end.
            if tokens.peek().is_none() {
                break;
            }
            continue;
        }
        match token.parse::<usize>() {
            Ok(dim) => dims.push(dim),
            Err(_) => {
                tracing::warn!(
                    target: "dynkernel",
                    descriptor = text,
                    token,
                    "malformed output shape descriptor; falling back to an empty shape"
                );
                return Vec::new();
            }
        }
    }
    dims
}
