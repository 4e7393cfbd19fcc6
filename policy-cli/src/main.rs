//! Policy CLI Binary Entry Point

use clap::Parser;
use policy_cli::logging::{init_logging, LoggingConfig};
use policy_cli::{run, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = init_logging(&LoggingConfig::from_args(&args))?;

    match run(args).await {
        Ok(report) => {
            println!("{}", report);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
