//! lbverify の CLI モジュール
//!
//! 検証ハーネスのコマンドラインインターフェースを提供します。

pub mod run;
pub mod scan;
pub mod stop;

use clap::{Parser, Subcommand};

/// lbverify - Black-box load-balancing verification harness
#[derive(Parser, Debug)]
#[command(name = "lbverify")]
#[command(version, about, long_about = None)]
#[command(after_help = r#"ENVIRONMENT VARIABLES:
    LBVERIFY_LOG_LEVEL      Log level (default: info, falls back to RUST_LOG)
    GATEWAY_BASE_URL        Gateway base URL (default: http://localhost:<port>)
    EMAIL / PASSWORD        Admin login of the gateway
    GATEWAY_BOOTSTRAP_CODE  One-time bootstrap code for /auth/register
    UPSTREAM_API_KEY_1      First upstream key (borrowed from an existing provider if unset)
    UPSTREAM_API_KEY_2      Second upstream key (enables key-level checks)
    UPSTREAM_BASE_URL       Upstream base URL
    PROVIDER_API_TYPE       Upstream API type (default: openai)
    BIZ_TEST_MODEL          Preferred dispatch model

    Values are also read from <root>/.env.example and <root>/.env (process env wins).

EXIT STATUS:
    0  every phase passed
    1  at least one phase failed
    2  setup, isolation, readiness or secret-leak failure
"#)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full verification against the gateway
    Run(run::RunArgs),
    /// Stop every process listening on a port
    Stop(stop::StopArgs),
    /// Scan artifacts for leaked secrets
    Scan(scan::ScanArgs),
}
