use anyhow::Result;
use clap::Parser;

use pennycdn::{cli::Cli, logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logger(cli.log)?;
    let settings = Settings::load(&cli)?;
    run(settings).await
}
