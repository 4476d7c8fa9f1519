//! Recovers launch geometry and the positional calling convention from kernel source text.
//!
//! Generated kernels describe themselves through comments and parameter names:
//!
//! ```text
//! extern "C" __global__ void template_op_kernel0(float* __restrict__ input0, float* __restrict__ output0) {
//!   // [thread_extent] blockIdx.x = 2
//!   // [thread_extent] threadIdx.x = 32
//!   ...
//! }
//! ```
//!
//! Every axis without a marker defaults to an extent of 1. Parameter `inputN` binds the `N`th
//! input tensor and `outputN` the `N`th output tensor, wherever they sit in the signature.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

pub const EXTENT_MARKER: &str = "// [thread_extent]";
pub const INPUT_PREFIX: &str = "input";
pub const OUTPUT_PREFIX: &str = "output";

const GRID_AXES: [&str; 3] = ["blockIdx.x", "blockIdx.y", "blockIdx.z"];
const BLOCK_AXES: [&str; 3] = ["threadIdx.x", "threadIdx.y", "threadIdx.z"];

/// Grid and block extents used for every launch of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchGeometry {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

impl LaunchGeometry {
    pub fn new(grid: [u32; 3], block: [u32; 3]) -> Self {
        Self { grid, block }
    }

    pub fn grid_dims(&self) -> (u32, u32, u32) {
        (self.grid[0], self.grid[1], self.grid[2])
    }

    pub fn block_dims(&self) -> (u32, u32, u32) {
        (self.block[0], self.block[1], self.block[2])
    }

    pub fn threads_per_block(&self) -> u64 {
        self.block.iter().map(|&extent| u64::from(extent)).product()
    }
}

impl Default for LaunchGeometry {
    fn default() -> Self {
        Self::new([1; 3], [1; 3])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamRole {
    Input,
    Output,
}

impl fmt::Display for ParamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamRole::Input => f.write_str(INPUT_PREFIX),
            ParamRole::Output => f.write_str(OUTPUT_PREFIX),
        }
    }
}

/// Role and ordinal of one formal parameter, in signature order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamBinding {
    pub role: ParamRole,
    pub ordinal: usize,
}

impl ParamBinding {
    pub fn input(ordinal: usize) -> Self {
        Self {
            role: ParamRole::Input,
            ordinal,
        }
    }

    pub fn output(ordinal: usize) -> Self {
        Self {
            role: ParamRole::Output,
            ordinal,
        }
    }
}

impl fmt::Display for ParamBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.role, self.ordinal)
    }
}

/// Entry symbol plus the validated parameter bindings of a kernel signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSignature {
    pub symbol: String,
    pub bindings: Vec<ParamBinding>,
}

impl KernelSignature {
    pub fn input_count(&self) -> usize {
        self.count(ParamRole::Input)
    }

    pub fn output_count(&self) -> usize {
        self.count(ParamRole::Output)
    }

    fn count(&self, role: ParamRole) -> usize {
        self.bindings
            .iter()
            .filter(|binding| binding.role == role)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMetadata {
    pub geometry: LaunchGeometry,
    pub signature: KernelSignature,
}

pub fn parse_metadata(source: &str) -> KernelResult<KernelMetadata> {
    Ok(KernelMetadata {
        geometry: parse_launch_geometry(source)?,
        signature: parse_signature(source)?,
    })
}

pub fn parse_launch_geometry(source: &str) -> KernelResult<LaunchGeometry> {
    let mut geometry = LaunchGeometry::default();
    for (idx, axis) in GRID_AXES.iter().enumerate() {
        geometry.grid[idx] = parse_extent(source, axis)?;
    }
    for (idx, axis) in BLOCK_AXES.iter().enumerate() {
        geometry.block[idx] = parse_extent(source, axis)?;
    }
    Ok(geometry)
}

/// Reads the extent of `axis` from its first marker comment, or 1 when no marker exists.
fn parse_extent(source: &str, axis: &'static str) -> KernelResult<u32> {
    let Some(rest) = source.lines().find_map(|line| marker_tail(line, axis)) else {
        return Ok(1);
    };
    let Some((_, value)) = rest.split_once('=') else {
        return Err(KernelError::metadata(axis, "marker has no '=' on its line"));
    };
    let value = value.trim_start();
    let digits_end = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let digits = &value[..digits_end];
    if digits.is_empty() {
        return Err(KernelError::metadata(
            axis,
            format!("expected an integer after '=', found '{}'", value.trim_end()),
        ));
    }
    let extent: u32 = digits
        .parse()
        .map_err(|err| KernelError::metadata(axis, format!("extent '{digits}': {err}")))?;
    if extent == 0 {
        return Err(KernelError::metadata(axis, "extent must be positive"));
    }
    Ok(extent)
}

/// Returns the text following `axis` when `line` is an extent marker for that axis.
fn marker_tail<'a>(line: &'a str, axis: &str) -> Option<&'a str> {
    let start = line.find(EXTENT_MARKER)?;
    let rest = line[start + EXTENT_MARKER.len()..].trim_start();
    let tail = rest.strip_prefix(axis)?;
    match tail.chars().next() {
        None => Some(tail),
        Some(ch) if ch.is_whitespace() || ch == '=' => Some(tail),
        Some(_) => None,
    }
}

pub fn parse_signature(source: &str) -> KernelResult<KernelSignature> {
    let search_from = source.find("__global__").unwrap_or(0);
    let close = find_body_paren(source, search_from)
        .ok_or_else(|| KernelError::signature("no parameter list followed by '{' found"))?;
    let open = matching_open_paren(source, close)
        .ok_or_else(|| KernelError::signature("unbalanced parentheses in kernel signature"))?;

    let symbol = trailing_identifier(&source[..open]);
    if symbol.is_empty() {
        return Err(KernelError::signature(
            "kernel entry point has no name before its parameter list",
        ));
    }

    let mut bindings = Vec::new();
    for (position, param) in source[open + 1..close].split(',').enumerate() {
        let name = trailing_identifier(param);
        if name.is_empty() {
            return Err(KernelError::signature(format!(
                "parameter {position} of '{symbol}' has no identifier: '{}'",
                param.trim()
            )));
        }
        bindings.push(classify_param(name)?);
    }

    let signature = KernelSignature {
        symbol: symbol.to_string(),
        bindings,
    };
    validate_ordinals(&signature)?;
    Ok(signature)
}

/// Finds the `)` closing the parameter list that is directly followed by the body's `{`.
fn find_body_paren(source: &str, from: usize) -> Option<usize> {
    source[from..]
        .match_indices(')')
        .map(|(offset, _)| from + offset)
        .find(|&idx| source[idx + 1..].trim_start().starts_with('{'))
}

fn matching_open_paren(source: &str, close: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in source[..close].char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' if depth == 0 => return Some(idx),
            '(' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn trailing_identifier(text: &str) -> &str {
    let text = text.trim_end();
    let start = text
        .char_indices()
        .rev()
        .take_while(|(_, ch)| ch.is_ascii_alphanumeric() || *ch == '_')
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    &text[start..]
}

fn classify_param(name: &str) -> KernelResult<ParamBinding> {
    let (role, suffix) = if let Some(suffix) = name.strip_prefix(INPUT_PREFIX) {
        (ParamRole::Input, suffix)
    } else if let Some(suffix) = name.strip_prefix(OUTPUT_PREFIX) {
        (ParamRole::Output, suffix)
    } else {
        return Err(KernelError::signature(format!(
            "parameter '{name}' is neither an {INPUT_PREFIX}N nor an {OUTPUT_PREFIX}N binding"
        )));
    };
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(KernelError::signature(format!(
            "parameter '{name}' has no decimal ordinal after '{role}'"
        )));
    }
    let ordinal = suffix
        .parse()
        .map_err(|err| KernelError::signature(format!("parameter '{name}': {err}")))?;
    Ok(ParamBinding { role, ordinal })
}

/// Ordinals of each role must be exactly `0..count` with no repeats.
fn validate_ordinals(signature: &KernelSignature) -> KernelResult<()> {
    for role in [ParamRole::Input, ParamRole::Output] {
        let mut ordinals = signature
            .bindings
            .iter()
            .filter(|binding| binding.role == role)
            .map(|binding| binding.ordinal)
            .collect::<Vec<_>>();
        ordinals.sort_unstable();
        for (expected, &found) in ordinals.iter().enumerate() {
            if found != expected {
                return Err(KernelError::signature(format!(
                    "{role} ordinals of '{}' are not contiguous from 0: {ordinals:?}",
                    signature.symbol
                )));
            }
        }
    }
    Ok(())
}
