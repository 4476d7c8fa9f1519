use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use dynkernel::metadata::parse_metadata;
use dynkernel::{execution_parallelism, ArtifactPaths, Device, KernelCompiler, LaunchGeometry};

use crate::cli::CompileArgs;

pub fn inspect(kernel: &Path, json: bool, out: &mut impl Write) -> Result<()> {
    let source = read_source(kernel)?;
    let metadata = parse_metadata(&source)
        .with_context(|| format!("failed to parse {}", kernel.display()))?;

    if json {
        serde_json::to_writer_pretty(&mut *out, &metadata)?;
        writeln!(out)?;
        return Ok(());
    }

    let signature = &metadata.signature;
    writeln!(out, "entry symbol: {}", signature.symbol)?;
    writeln!(out, "grid:  {}", format_extent(&metadata.geometry, true))?;
    writeln!(out, "block: {}", format_extent(&metadata.geometry, false))?;
    writeln!(
        out,
        "inputs: {}  outputs: {}",
        signature.input_count(),
        signature.output_count()
    )?;
    for (position, binding) in signature.bindings.iter().enumerate() {
        writeln!(out, "  param {position}: {binding}")?;
    }
    Ok(())
}

pub fn compile(args: &CompileArgs, compiler: &KernelCompiler, out: &mut impl Write) -> Result<()> {
    let source = read_source(&args.kernel)?;
    let blend = args.blend.as_deref().map(read_source).transpose()?;
    let paths = ArtifactPaths::for_module_path(&args.module_path);

    let artifact = match args.arch {
        Some(capability) => compiler.compile_for(&source, blend.as_deref(), capability, &paths)?,
        None => {
            let device = dynkernel_cuda::driver()
                .context("no --arch given and the CUDA driver could not be loaded")?;
            compiler.compile(&source, blend.as_deref(), device.as_ref(), &paths)?
        }
    };

    writeln!(
        out,
        "compiled {} for sm_{} -> {} ({} bytes)",
        args.kernel.display(),
        artifact.capability.arch_tag(),
        artifact.path.display(),
        artifact.image.len()
    )?;
    Ok(())
}

pub fn devices(out: &mut impl Write) -> Result<()> {
    writeln!(out, "execution parallelism: {}", execution_parallelism())?;
    match dynkernel_cuda::driver() {
        Ok(device) => {
            let capability = device.compute_capability()?;
            writeln!(
                out,
                "cuda driver: available ({}, compute capability {capability})",
                device.name()
            )?;
        }
        Err(err) => writeln!(out, "cuda driver: unavailable ({err})")?,
    }
    Ok(())
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn format_extent(geometry: &LaunchGeometry, grid: bool) -> String {
    let dims = if grid { geometry.grid } else { geometry.block };
    format!("{}x{}x{}", dims[0], dims[1], dims[2])
}
