mod bootstrap_helpers;
mod cli_args;
mod commands;

use anyhow::Result;
use clap::Parser;

use crate::{bootstrap_helpers::init_tracing, cli_args::Cli, commands::run_cli};

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    run_cli(cli, &mut stdout)
}
