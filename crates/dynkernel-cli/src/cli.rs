use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use dynkernel::ComputeCapability;

use crate::logging::{LogFormat, LogLevel};

#[derive(Debug, Parser)]
#[command(name = "dynkernel")]
#[command(version, about = "Inspect and compile self-describing GPU kernel sources", long_about = None)]
pub struct Cli {
    /// Default verbosity when RUST_LOG is unset
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the launch geometry, entry symbol and parameter bindings of a kernel source
    Inspect {
        #[arg(value_name = "KERNEL")]
        kernel: PathBuf,

        #[arg(long)]
        json: bool,
    },
    /// Stage a kernel source and compile it with the configured toolchain
    Compile(CompileArgs),
    /// Report visible GPU device nodes and whether the CUDA driver loads
    Devices,
}

#[derive(Debug, Args)]
pub struct CompileArgs {
    #[arg(value_name = "KERNEL")]
    pub kernel: PathBuf,

    /// Base path; artifacts land at <base>.kernel.src and <base>.kernel.out
    #[arg(long)]
    pub module_path: PathBuf,

    /// Target architecture such as 86 or 8.6; queried from the driver when omitted
    #[arg(long, value_parser = parse_arch)]
    pub arch: Option<ComputeCapability>,

    /// File whose contents are placed between the standard headers and the kernel
    #[arg(long)]
    pub blend: Option<PathBuf>,
}

/// Accepts `8.6` or the concatenated `86` form; the last digit is the minor version.
pub fn parse_arch(raw: &str) -> Result<ComputeCapability, String> {
    let raw = raw.trim().trim_start_matches("sm_");
    let (major, minor) = match raw.split_once('.') {
        Some(parts) => parts,
        None if raw.len() >= 2 && raw.is_ascii() => raw.split_at(raw.len() - 1),
        None => return Err(format!("architecture '{raw}' needs a major and minor version")),
    };
    let major = major
        .parse()
        .map_err(|_| format!("invalid major version in architecture '{raw}'"))?;
    let minor = minor
        .parse()
        .map_err(|_| format!("invalid minor version in architecture '{raw}'"))?;
    Ok(ComputeCapability::new(major, minor))
}
