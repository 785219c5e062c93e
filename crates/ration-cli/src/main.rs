use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = ration_cli::Cli::parse();
    ration_cli::run_cli(cli)
}
