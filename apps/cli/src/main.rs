//! Errata CLI — recursive error-taxonomy construction over model evaluations.
//!
//! Loads scored evaluation records, has a judgment oracle analyze each
//! failure, and clusters the failures into a hierarchical taxonomy.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
