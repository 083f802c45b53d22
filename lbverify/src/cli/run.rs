//! run サブコマンド
//!
//! 検証を1回実行し、レポートを書き出して終了コードを返します。

use crate::client::ServiceClient;
use crate::common::error::HarnessError;
use crate::config::{ConfigOverrides, HarnessConfig};
use crate::lock::RunLock;
use crate::logging;
use crate::orchestrator::{RunIds, RunOrchestrator};
use crate::process::ProcessController;
use crate::redact::redact_text;
use crate::report::{self, git_short_sha, Artifacts};
use chrono::Utc;
use clap::Args;
use std::path::PathBuf;

/// run サブコマンドの引数
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Project root (.env files, default config and service paths)
    #[arg(long, env = "LBVERIFY_ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Gateway base URL
    #[arg(long, env = "LBVERIFY_BASE_URL")]
    pub base_url: Option<String>,

    /// Strategy config file (default: <root>/custom-config.toml)
    #[arg(long, env = "LBVERIFY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Service command line (default: <root>/target/debug/gateway)
    #[arg(long, env = "LBVERIFY_SERVICE_CMD")]
    pub service_cmd: Option<String>,

    /// Build command run once before the first restart
    #[arg(long, env = "LBVERIFY_BUILD_CMD")]
    pub build_cmd: Option<String>,

    /// Listening port of the service (default: 8080)
    #[arg(short, long, env = "LBVERIFY_PORT")]
    pub port: Option<u16>,

    /// Health endpoint path; 200 and 401 count as ready (default: /auth/me)
    #[arg(long, env = "LBVERIFY_HEALTH_PATH")]
    pub health_path: Option<String>,

    /// Readiness timeout in seconds (default: 180)
    #[arg(long, env = "LBVERIFY_READY_TIMEOUT")]
    pub ready_timeout: Option<u64>,

    /// Output directory for the report and run log (default: <root>/target/lbverify)
    #[arg(long, env = "LBVERIFY_OUT_DIR")]
    pub out_dir: Option<PathBuf>,

    /// Phases as strategy:count pairs (default: round_robin:8,random:20,first_available:5)
    #[arg(long, env = "LBVERIFY_PHASES")]
    pub phases: Option<String>,

    /// Fixture name prefix root (default: lbverify)
    #[arg(long, env = "LBVERIFY_PREFIX")]
    pub prefix: Option<String>,
}

impl RunArgs {
    /// 設定の上書き値に変換する
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.base_url.clone(),
            config_path: self.config.clone(),
            service_command: self.service_cmd.clone(),
            build_command: self.build_cmd.clone(),
            port: self.port,
            health_path: self.health_path.clone(),
            ready_timeout_secs: self.ready_timeout,
            out_dir: self.out_dir.clone(),
            phases: self.phases.clone(),
            prefix_root: self.prefix.clone(),
        }
    }
}

/// run コマンドを実行し、終了コードを返す
pub async fn execute(args: &RunArgs) -> Result<i32, anyhow::Error> {
    let root = args.root.canonicalize().unwrap_or_else(|_| args.root.clone());
    let config = HarnessConfig::load(&root, args.overrides())?;
    let ids = RunIds::generate(&config.prefix_root, Utc::now());
    let artifacts = Artifacts::for_run(&config.out_dir, &config.scratch_dir, &ids.run_id);

    logging::init(Some(&artifacts.run_log))
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
    let _lock = RunLock::acquire(config.port)?;

    let client = ServiceClient::new(&config.base_url)?;
    let service = ProcessController::new(&config, client.clone(), artifacts.service_log.clone());
    let mut orchestrator = RunOrchestrator::with_ids(config.clone(), client, service, ids);
    let mut outcome = orchestrator.execute().await;

    let sha = git_short_sha(&config.root);
    report::publish(&mut outcome, &artifacts, sha.as_deref())?;

    if let Some(HarnessError::Readiness { log_tail, .. }) = &outcome.fatal {
        if !log_tail.is_empty() {
            eprintln!("--- service output (tail) ---\n{}", redact_text(log_tail));
        }
    }
    println!("Report: {}", artifacts.report.display());
    println!("Run log: {}", artifacts.run_log.display());
    println!(
        "Result: {} (pass {}, fail {})",
        if outcome.passed() { "PASS" } else { "FAIL" },
        outcome.passed_count(),
        outcome.failed_count()
    );
    Ok(outcome.exit_code())
}
