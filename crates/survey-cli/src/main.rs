use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = survey_cli::Cli::parse();
    survey_cli::run_cli(cli)
}
