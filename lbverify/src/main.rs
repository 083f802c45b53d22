//! lbverify Entry Point

use clap::Parser;
use lbverify::cli::{Cli, Commands};
use lbverify::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run(args) => match lbverify::cli::run::execute(&args).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {}", e);
                2
            }
        },
        Commands::Stop(args) => {
            let _ = logging::init(None);
            match lbverify::cli::stop::execute(&args).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    1
                }
            }
        }
        Commands::Scan(args) => match lbverify::cli::scan::execute(&args) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {}", e);
                2
            }
        },
    };
    std::process::exit(code);
}
