use clap::Parser;
mod cli;
#[cfg(debug_assertions)]
const MAX_LEVEL: tracing::Level = tracing::Level::DEBUG;
#[cfg(not(debug_assertions))]
const MAX_LEVEL: tracing::Level = tracing::Level::WARN;

fn main() {
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

    // stdout carries command output, so logs go to stderr
    let filter = EnvFilter::builder()
        .with_default_directive(MAX_LEVEL.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = cli::Cli::parse();
    if let Err(e) = cli.run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
