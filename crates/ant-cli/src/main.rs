//! Ant CLI
//!
//! Fleet agent for marabunta: enrolls once, then keeps an mTLS control
//! stream open.

use clap::Parser;

use ant_cli::telemetry::init_logging;
use ant_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global.log_level, cli.global.log_format)?;
    ant_agent::install_crypto_provider();

    cli.run().await
}
