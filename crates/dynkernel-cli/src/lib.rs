//! Library half of the `dynkernel` binary, split out so argument parsing and command output can
//! be tested without spawning a process.

pub mod cli;
pub mod commands;
pub mod logging;

use anyhow::Result;
use dynkernel::KernelCompiler;

use crate::cli::{Cli, Command};

pub fn run(cli: Cli) -> Result<()> {
    logging::init_logging(cli.log_level, cli.log_format);
    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Command::Inspect { kernel, json } => commands::inspect(&kernel, json, &mut stdout),
        Command::Compile(args) => {
            commands::compile(&args, &KernelCompiler::from_env(), &mut stdout)
        }
        Command::Devices => commands::devices(&mut stdout),
    }
}
