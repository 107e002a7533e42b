use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = caselink_cli::Cli::parse();
    caselink_cli::init_tracing(&cli.log_level);
    caselink_cli::run_cli(cli)
}
