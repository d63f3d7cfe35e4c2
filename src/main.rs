//! bananas CLI entry point.
//!
//! Sets up logging on stderr, leaving stdout to command output, then hands
//! over to the CLI module.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = bananas::cli::parse_cli();

    // RUST_LOG replaces the whole filter; --log-level only tunes this crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(bananas::cli::default_log_filter(&cli.log_level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    bananas::cli::run_with_cli(cli).await
}
