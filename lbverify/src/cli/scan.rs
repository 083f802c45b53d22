//! scan サブコマンド
//!
//! 任意の成果物に漏洩検出を実行します。

use crate::redact::scan_file;
use clap::Args;
use std::path::PathBuf;

/// scan サブコマンドの引数
#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Files to scan (reports, run logs, service logs)
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// scan コマンドを実行
///
/// 終了コードを返す（検出なしは `0`、何か見つかれば `1`）。
pub fn execute(args: &ScanArgs) -> Result<i32, anyhow::Error> {
    let mut total = 0;
    for path in &args.files {
        let findings = scan_file(path)?;
        for finding in &findings {
            println!("{}:{}: {}", path.display(), finding.line, finding.kind);
        }
        total += findings.len();
    }

    if total == 0 {
        println!("No secrets found in {} file(s)", args.files.len());
        Ok(0)
    } else {
        println!("{} finding(s) in {} file(s)", total, args.files.len());
        Ok(1)
    }
}
