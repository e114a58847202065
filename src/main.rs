use anyhow::Result;
use clap::Parser;

use sndfiler::cli;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cli::Cli::parse();
    cli::run(args)
}
