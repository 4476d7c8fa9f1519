use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Failure reported by the device/driver collaborator.
///
/// Components translate this into the [`KernelError`] variant that matches the step that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub op: &'static str,
    pub code: i32,
    pub message: Option<String>,
}

impl DriverError {
    pub fn new(op: &'static str, code: i32) -> Self {
        Self {
            op,
            code,
            message: None,
        }
    }

    pub fn with_message(op: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            op,
            code,
            message: Some(message.into()),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver call {} failed with code {}", self.op, self.code)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DriverError {}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid kernel configuration: {0}")]
    Configuration(String),
    #[error("malformed launch metadata for {axis}: {reason}")]
    MalformedMetadata { axis: &'static str, reason: String },
    #[error("malformed kernel signature: {0}")]
    MalformedSignature(String),
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("kernel compilation failed ({status}): {stderr}")]
    CompilationFailed { status: String, stderr: String },
    #[error("failed to load kernel module: {0}")]
    ModuleLoadFailed(#[source] DriverError),
    #[error("failed to resolve kernel entry point '{symbol}': {source}")]
    SymbolResolutionFailed {
        symbol: String,
        #[source]
        source: DriverError,
    },
    #[error("failed to allocate {bytes} bytes for output {index}: {source}")]
    AllocationFailed {
        index: usize,
        bytes: usize,
        #[source]
        source: DriverError,
    },
    #[error("kernel launch failed: {0}")]
    LaunchFailed(String),
}

impl KernelError {
    pub fn configuration(message: impl Into<String>) -> Self {
        KernelError::Configuration(message.into())
    }

    pub fn signature(message: impl Into<String>) -> Self {
        KernelError::MalformedSignature(message.into())
    }

    pub fn metadata(axis: &'static str, reason: impl Into<String>) -> Self {
        KernelError::MalformedMetadata {
            axis,
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        KernelError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn compilation(status: Option<ExitStatus>, stderr: impl Into<String>) -> Self {
        KernelError::CompilationFailed {
            status: status
                .map(|status| status.to_string())
                .unwrap_or_else(|| "not started".to_string()),
            stderr: stderr.into(),
        }
    }
}

/// Convenience alias for results returned by kernel construction and invocation.
pub type KernelResult<T> = Result<T, KernelError>;
