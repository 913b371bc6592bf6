use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = reminder_kernel_cli::Cli::parse();
    reminder_kernel_cli::init_tracing()?;
    reminder_kernel_cli::run_cli(cli)
}
