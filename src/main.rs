use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

fn main() -> Result<()> {
    let mut cli = cli::Cli::parse();
    let root = cli::resolve_root(&cli);
    // Load config and apply CLI flags on top
    let config = cli::apply_cli_overrides(&mut cli, annex_batch::Config::load(&root));

    // Log to stderr to keep stdout clean for JSON output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run_with(cli, root, config)
}
