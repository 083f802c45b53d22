//! Markdown レポートと成果物の自己チェック
//!
//! レポートにはマスク済みの値しか載せない。書き出し前にレポート本文と実行ログを
//! 漏洩検出にかけ、検出した場合は実行を不合格にしてレポート先頭に告知を置く。

use crate::common::types::{CheckOutcome, PhaseVerdict};
use crate::orchestrator::RunOutcome;
use crate::redact::{find_leaks, redact_text, scan_file, LeakError};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{error, info};

/// 1実行の成果物パス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    /// `<out>/<run_id>.md`
    pub report: PathBuf,
    /// `<out>/<run_id>.log`
    pub run_log: PathBuf,
    /// `<scratch>/<run_id>.server.log`（レポートには転記しない）
    pub service_log: PathBuf,
}

impl Artifacts {
    /// 実行IDから成果物パスを決める
    pub fn for_run(out_dir: &Path, scratch_dir: &Path, run_id: &str) -> Self {
        Self {
            report: out_dir.join(format!("{}.md", run_id)),
            run_log: out_dir.join(format!("{}.log", run_id)),
            service_log: scratch_dir.join(format!("{}.server.log", run_id)),
        }
    }
}

/// `git rev-parse --short HEAD`（取得できなければ `None`）
pub fn git_short_sha(root: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

fn check_line(label: &str, check: &CheckOutcome, out: &mut String) {
    match check {
        CheckOutcome::Pass => {
            let _ = writeln!(out, "- {}: PASS", label);
        }
        CheckOutcome::Skipped(reason) => {
            let _ = writeln!(out, "- {}: SKIP ({})", label, reason);
        }
        CheckOutcome::Fail(mismatches) => {
            let _ = writeln!(out, "- {}: FAIL", label);
            for m in mismatches {
                let _ = writeln!(out, "  - {}", m);
            }
        }
    }
}

fn phase_section(index: usize, verdict: &PhaseVerdict, out: &mut String) {
    let _ = writeln!(
        out,
        "## Phase {}: {} ({} requests)\n",
        index + 1,
        verdict.phase.strategy,
        verdict.phase.request_count
    );
    let _ = writeln!(
        out,
        "- Result: {}",
        if verdict.passed() { "PASS" } else { "FAIL" }
    );
    if let Some(err) = &verdict.error {
        let _ = writeln!(out, "- Error: {}", redact_text(err));
    }
    check_line("Provider check", &verdict.provider_check, out);
    check_line("Key check", &verdict.key_check, out);

    if verdict.observations.is_empty() {
        out.push('\n');
        return;
    }
    out.push_str("\n| # | HTTP | latency_ms | server_ms | provider | api_key (masked) |\n");
    out.push_str("|---|------|-----------:|----------:|----------|------------------|\n");
    for o in &verdict.observations {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} |",
            o.sequence_index + 1,
            o.http_status.map_or_else(|| "-".to_string(), |s| s.to_string()),
            o.latency_ms,
            o.server_latency_ms.map_or_else(|| "-".to_string(), |s| s.to_string()),
            match (&o.provider, &o.attribution_error) {
                (Some(p), _) => p.as_str(),
                (None, Some(_)) => "(log unreadable)",
                (None, None) => "(no log record)",
            },
            o.key_hint.as_deref().unwrap_or("-"),
        );
    }
    out.push('\n');
}

/// レポート本文を組み立てる
pub fn render(outcome: &RunOutcome, git_sha: Option<&str>, service_log: Option<&Path>) -> String {
    let mut out = String::new();
    out.push_str("# Load-balancing verification report\n\n");

    let _ = writeln!(out, "- Run ID: `{}`", outcome.ids.run_id);
    let _ = writeln!(
        out,
        "- Started (UTC): {}",
        outcome.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(out, "- Base URL: {}", outcome.base_url);
    let _ = writeln!(out, "- Git: {}", git_sha.unwrap_or("(unknown)"));
    let strategies: Vec<String> = outcome
        .phases
        .iter()
        .map(|p| format!("{} x{}", p.strategy, p.request_count))
        .collect();
    let _ = writeln!(out, "- Strategies: {}", strategies.join(", "));

    match &outcome.fixtures {
        Some(f) => {
            let _ = writeln!(
                out,
                "- Fixtures: provider A `{}` ({} key(s)), provider B `{}` (k1), client token `{}`",
                f.provider_a, f.key_count, f.provider_b, f.token_name
            );
            let _ = writeln!(out, "- API type: {}", f.api_type);
            let _ = writeln!(out, "- Upstream base URL: {}", f.upstream_base_url);
            let _ = writeln!(out, "- Model: {}", f.model);
            let _ = writeln!(
                out,
                "- Upstream keys: {} (source: {})",
                f.key_count, f.credential_source
            );
        }
        None => {
            let _ = writeln!(out, "- Fixtures: (not created)");
        }
    }
    if outcome.isolated.is_empty() {
        let _ = writeln!(out, "- Isolation: no other provider held keys");
    } else {
        let list: Vec<String> = outcome
            .isolated
            .iter()
            .map(|(name, n)| format!("{} ({})", name, n))
            .collect();
        let _ = writeln!(out, "- Isolation: keys removed from {}", list.join(", "));
    }
    let _ = writeln!(
        out,
        "- Observable signal: request log `provider` and locally masked `api_key` per dispatch"
    );
    if let Some(path) = service_log {
        let _ = writeln!(out, "- Service output: {} (not copied here)", path.display());
    }
    out.push('\n');

    for note in &outcome.notes {
        let _ = writeln!(out, "> NOTE: {}\n", note);
    }

    if let Some(fatal) = &outcome.fatal {
        out.push_str("## Run error\n\n");
        let _ = writeln!(out, "- Kind: {}", fatal.kind());
        let _ = writeln!(out, "- Detail: {}\n", redact_text(&fatal.to_string()));
    }

    for (i, verdict) in outcome.verdicts.iter().enumerate() {
        phase_section(i, verdict, &mut out);
    }

    out.push_str("## Summary\n\n");
    let _ = writeln!(
        out,
        "- Pass: {} / Fail: {}",
        outcome.passed_count(),
        outcome.failed_count()
    );
    let _ = writeln!(
        out,
        "- Conclusion: {}\n",
        if outcome.passed() { "PASS" } else { "FAIL" }
    );

    out.push_str("## Cleanup\n\n");
    if outcome.cleanup.is_empty() {
        out.push_str("- (nothing to clean up)\n");
    }
    for step in &outcome.cleanup {
        match &step.error {
            None => {
                let _ = writeln!(out, "- [ok] {}", step.description);
            }
            Some(e) => {
                let _ = writeln!(out, "- [failed] {}: {}", step.description, redact_text(e));
            }
        }
    }
    out
}

fn leak_notice(err: &LeakError) -> String {
    format!(
        "> **SECRET LEAK DETECTED: run failed.** {}\n> Matching values were redacted from this report.\n\n",
        err
    )
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LeakError {
    let path = path.to_path_buf();
    move |source| LeakError::Io { path, source }
}

/// レポートを書き出し、レポートと実行ログを自己チェックする
///
/// 漏洩を検出した場合は `outcome.leak` を設定し、本文をマスクしたうえで告知を先頭に置く。
pub fn publish(
    outcome: &mut RunOutcome,
    artifacts: &Artifacts,
    git_sha: Option<&str>,
) -> Result<(), LeakError> {
    if let Some(dir) = artifacts.report.parent() {
        std::fs::create_dir_all(dir).map_err(io_error(dir))?;
    }

    let mut text = render(outcome, git_sha, Some(&artifacts.service_log));
    let mut findings: Vec<String> = find_leaks(&text)
        .into_iter()
        .map(|f| format!("{} in report (line {})", f.kind, f.line))
        .collect();
    if artifacts.run_log.exists() {
        findings.extend(
            scan_file(&artifacts.run_log)?
                .into_iter()
                .map(|f| format!("{} in run log (line {})", f.kind, f.line)),
        );
    }

    if !findings.is_empty() {
        let err = LeakError::Found {
            artifact: artifacts.report.display().to_string(),
            summary: findings.join(", "),
        };
        error!("Artifact self-check failed: {}", err);
        let notice = leak_notice(&err);
        outcome.leak = Some(err);
        text = format!(
            "{}{}",
            notice,
            redact_text(&render(outcome, git_sha, Some(&artifacts.service_log)))
        );
    }

    std::fs::write(&artifacts.report, text).map_err(io_error(&artifacts.report))?;
    info!(report = %artifacts.report.display(), "Report written");
    Ok(())
}
