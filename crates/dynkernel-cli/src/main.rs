use clap::Parser;
use dynkernel_cli::cli::Cli;

fn main() -> anyhow::Result<()> {
    dynkernel_cli::run(Cli::parse())
}
