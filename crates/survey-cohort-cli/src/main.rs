use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();
    let cli = survey_cohort_cli::Cli::parse();
    survey_cohort_cli::run_cli(cli)
}
