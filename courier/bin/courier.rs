#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::process::ExitCode;

use clap::Parser;
use courier::cli::{self, Cli};
use courier_common::logging;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init();

    cli::execute(cli).await
}
