use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    pkgcheck_cli::init_tracing()?;
    let cli = pkgcheck_cli::Cli::parse();
    pkgcheck_cli::run_cli(cli)
}
