mod cli;
mod logging;
mod model;
mod orchestrator;
mod reporter;
mod service;
mod text_summary;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    logging::init_logging(args.verbose);

    match cli::run(args).await {
        Ok(()) => {
            // Exit explicitly so a pending stdin prompt cannot hold the process open
            std::process::exit(0);
        }
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
