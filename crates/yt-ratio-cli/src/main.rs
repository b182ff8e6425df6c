use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = yt_ratio_cli::Cli::parse();
    yt_ratio_cli::init_tracing(cli.verbosity());
    yt_ratio_cli::run_cli(cli)
}
