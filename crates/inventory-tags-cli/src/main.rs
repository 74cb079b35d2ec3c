use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = inventory_tags_cli::Cli::parse();
    inventory_tags_cli::init_tracing(cli.log_level());
    inventory_tags_cli::run_cli(cli)
}
