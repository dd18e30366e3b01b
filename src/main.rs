//! SNOWBALL CLI - chained alkanes mint orchestration
//!
//! Creates, resumes and inspects mint orders. Exits 0 when the order completed,
//! 2 when it exhausted its recovery attempts and 1 otherwise.

use anyhow::Result;
use clap::Parser;
use log::error;

use snowball::cli::{Args, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let code = match Cli::new(args) {
        Ok(cli) => match cli.run().await {
            Ok(code) => code,
            Err(e) => {
                error!("{:#}", e);
                1
            }
        },
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}
