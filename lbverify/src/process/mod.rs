//! 検証対象サービスのプロセス制御
//!
//! 状態遷移: `Stopped → Starting → Ready | CrashedDuringStartup`
//!
//! - 子プロセスは環境変数を継承して起動し、stdout/stderr はスクラッチログにのみ書く
//!   （接続文字列などを含みうるため、レポートには載せない）。ログはサイズ上限付き
//! - 停止は SIGTERM → 猶予待ち → SIGKILL。既に終了したプロセスの停止は no-op
//! - 再起動前にポートを LISTEN しているプロセスを掃除する
//! - readiness はヘルスエンドポイントのポーリング（200/401 を ready とみなす）

mod scratch_log;

pub use scratch_log::{read_log_tail, rotated_path};

use crate::client::ServiceClient;
use crate::config::{HarnessConfig, POLL_INTERVAL};
use crate::lock::is_process_running;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// readiness 失敗時に返すログ末尾のバイト数
pub const LOG_TAIL_BYTES: u64 = 4000;

static SS_PID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"pid=(\d+)").expect("valid regex"));

/// プロセス制御のエラー型
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// コマンドラインが空
    #[error("Service command is empty")]
    EmptyCommand,

    /// 起動に失敗
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// 実行ファイル
        program: String,
        /// 元のエラー
        #[source]
        source: std::io::Error,
    },

    /// ビルドコマンドが失敗
    #[error("Build command failed: {0}")]
    BuildFailed(String),

    /// シグナル送信に失敗
    #[error("Failed to signal PID {pid}: {message}")]
    Signal {
        /// 対象PID
        pid: u32,
        /// 詳細
        message: String,
    },

    /// スクラッチログの操作に失敗
    #[error("Scratch log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// プロセスの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// 停止
    Stopped,
    /// 起動済み・ready 待ち
    Starting,
    /// ヘルスチェック合格
    Ready,
    /// ready になる前に終了した
    CrashedDuringStartup,
}

/// `wait_ready` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// ready
    Ready,
    /// ready になる前にプロセスが終了した
    Exited {
        /// 終了ステータス
        status: String,
        /// スクラッチログ末尾
        log_tail: String,
    },
    /// タイムアウト
    TimedOut {
        /// スクラッチログ末尾
        log_tail: String,
    },
}

impl Readiness {
    /// ready か
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// 失敗理由（ready なら `None`）
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Readiness::Ready => None,
            Readiness::Exited { status, .. } => {
                Some(format!("process exited before becoming ready ({})", status))
            }
            Readiness::TimedOut { .. } => Some("health check timed out".to_string()),
        }
    }

    /// スクラッチログ末尾
    pub fn log_tail(&self) -> &str {
        match self {
            Readiness::Ready => "",
            Readiness::Exited { log_tail, .. } | Readiness::TimedOut { log_tail } => log_tail,
        }
    }
}

/// 検証対象サービスのライフサイクル操作
///
/// オーケストレータはこのトレイト越しにプロセスを操作する。
#[async_trait]
pub trait ServiceLifecycle: Send {
    /// ビルドコマンドを1回実行する（未設定なら何もしない）
    async fn build(&mut self) -> Result<(), ProcessError>;

    /// サービスを起動する
    async fn start(&mut self) -> Result<(), ProcessError>;

    /// 自分が起動したプロセスを停止する
    async fn stop(&mut self) -> Result<(), ProcessError>;

    /// ポートを LISTEN している残存プロセスを停止する
    async fn release_port(&mut self) -> Result<(), ProcessError>;

    /// ready になるまで待つ
    async fn wait_ready(&mut self, timeout: Duration) -> Readiness;

    /// 現在の状態
    fn state(&self) -> ProcessState;

    /// 停止 → ポート解放 → 起動
    async fn restart(&mut self) -> Result<(), ProcessError> {
        self.stop().await?;
        self.release_port().await?;
        self.start().await
    }
}

/// 子プロセスとしてサービスを管理するコントローラ
pub struct ProcessController {
    command: Vec<String>,
    build_command: Option<Vec<String>>,
    cwd: PathBuf,
    port: u16,
    health: ServiceClient,
    health_path: String,
    log_path: PathBuf,
    log_max_bytes: u64,
    log_check_interval: Duration,
    log_guard: Option<JoinHandle<()>>,
    stop_grace: Duration,
    poll_interval: Duration,
    child: Option<Child>,
    state: ProcessState,
}

impl std::fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessController")
            .field("command", &self.command)
            .field("port", &self.port)
            .field("log_path", &self.log_path)
            .field("state", &self.state)
            .finish()
    }
}

impl ProcessController {
    /// 設定からコントローラを作成する
    pub fn new(config: &HarnessConfig, health: ServiceClient, log_path: PathBuf) -> Self {
        Self {
            command: config.service_command.clone(),
            build_command: config.build_command.clone(),
            cwd: config.root.clone(),
            port: config.port,
            health,
            health_path: config.health_path.clone(),
            log_path,
            log_max_bytes: scratch_log::SCRATCH_LOG_MAX_BYTES,
            log_check_interval: scratch_log::SCRATCH_LOG_CHECK_INTERVAL,
            log_guard: None,
            stop_grace: config.stop_grace,
            poll_interval: POLL_INTERVAL,
            child: None,
            state: ProcessState::Stopped,
        }
    }

    /// スクラッチログのパス
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn stop_log_guard(&mut self) {
        if let Some(guard) = self.log_guard.take() {
            guard.abort();
        }
    }

    fn child_exited(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        self.stop_log_guard();
    }
}

#[async_trait]
impl ServiceLifecycle for ProcessController {
    async fn build(&mut self) -> Result<(), ProcessError> {
        let Some(cmd) = self.build_command.clone() else {
            return Ok(());
        };
        let (program, args) = cmd.split_first().ok_or(ProcessError::EmptyCommand)?;
        info!(program = %program, "Running build command");
        let log = File::create(self.log_path.with_extension("build.log"))?;
        let status = Command::new(program)
            .args(args)
            .current_dir(&self.cwd)
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .status()
            .await
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(ProcessError::BuildFailed(status.to_string()));
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ProcessError> {
        let command = self.command.clone();
        let (program, args) = command
            .split_first()
            .ok_or(ProcessError::EmptyCommand)?;
        // 起動ごとにスクラッチログを作り直す
        self.stop_log_guard();
        let log = scratch_log::create(&self.log_path)?;
        let child = Command::new(program)
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;
        info!(pid = ?child.id(), port = self.port, "Service process started");
        self.log_guard = Some(scratch_log::spawn_guard(
            self.log_path.clone(),
            self.log_max_bytes,
            self.log_check_interval,
        ));
        self.child = Some(child);
        self.state = ProcessState::Starting;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProcessError> {
        self.stop_log_guard();
        let Some(mut child) = self.child.take() else {
            self.state = ProcessState::Stopped;
            return Ok(());
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!(%status, "Service process already exited");
            self.state = ProcessState::Stopped;
            return Ok(());
        }
        if let Some(pid) = child.id() {
            if let Err(e) = terminate_pid(pid) {
                warn!("SIGTERM failed: {}", e);
            }
        }
        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Service process stopped"),
            Ok(Err(e)) => warn!("Failed to wait for service process: {}", e),
            Err(_) => {
                warn!(
                    "Service process did not stop within {:?}, killing",
                    self.stop_grace
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill service process: {}", e);
                }
            }
        }
        self.state = ProcessState::Stopped;
        Ok(())
    }

    async fn release_port(&mut self) -> Result<(), ProcessError> {
        stop_by_port(self.port, self.stop_grace).await
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Readiness {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child_exited() {
                self.state = ProcessState::CrashedDuringStartup;
                warn!(%status, "Service exited before becoming ready");
                return Readiness::Exited {
                    status,
                    log_tail: read_log_tail(&self.log_path, LOG_TAIL_BYTES),
                };
            }
            match self.health.probe_health(&self.health_path).await {
                Ok(200) | Ok(401) => {
                    self.state = ProcessState::Ready;
                    info!("Service is ready");
                    return Readiness::Ready;
                }
                Ok(code) => debug!(code, "Health probe not ready yet"),
                Err(e) => debug!("Health probe failed: {}", e),
            }
            if Instant::now() >= deadline {
                warn!("Service did not become ready within {:?}", timeout);
                return Readiness::TimedOut {
                    log_tail: read_log_tail(&self.log_path, LOG_TAIL_BYTES),
                };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn state(&self) -> ProcessState {
        self.state
    }
}


/// 指定PIDに SIGTERM を送る
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// 指定PIDに SIGKILL を送る
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| ProcessError::Signal {
        pid,
        message: "PID out of range".to_string(),
    })?;
    match kill(Pid::from_raw(raw), signal) {
        // 既に終了している
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            message: e.to_string(),
        }),
    }
}

/// 指定PIDを停止する (Windows版)
#[cfg(windows)]
pub fn terminate_pid(pid: u32) -> Result<(), ProcessError> {
    kill_pid(pid)
}

/// 指定PIDを強制終了する (Windows版)
#[cfg(windows)]
pub fn kill_pid(pid: u32) -> Result<(), ProcessError> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ProcessError::Signal {
            pid,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// `lsof -t` の出力からPIDを取り出す
pub fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    normalize_pids(stdout.split_whitespace().filter_map(|s| s.parse().ok()))
}

/// `fuser -n tcp <port>` の stdout からPIDを取り出す
///
/// `8080/tcp:` の見出しは stderr に出るが、混在していても `:` より後だけを読む。
pub fn parse_fuser_pids(stdout: &str) -> Vec<u32> {
    normalize_pids(stdout.lines().flat_map(|line| {
        let pids = line.rsplit_once(':').map_or(line, |(_, rest)| rest);
        pids.split_whitespace()
            .filter_map(|tok| tok.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
            .collect::<Vec<u32>>()
    }))
}

/// `ss -ltnp` の出力からPIDを取り出す
pub fn parse_ss_pids(stdout: &str) -> Vec<u32> {
    normalize_pids(
        SS_PID_RE
            .captures_iter(stdout)
            .filter_map(|caps| caps[1].parse().ok()),
    )
}

fn normalize_pids(pids: impl Iterator<Item = u32>) -> Vec<u32> {
    let own = std::process::id();
    let mut out: Vec<u32> = pids.filter(|&pid| pid != 0 && pid != own).collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// 実行できなければ `None`
async fn run_probe(program: &str, args: &[String]) -> Option<std::process::Output> {
    let fut = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output();
    match tokio::time::timeout(Duration::from_secs(5), fut).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            debug!(program, "Port probe unavailable: {}", e);
            None
        }
        Err(_) => {
            warn!(program, "Port probe timed out");
            None
        }
    }
}

/// ポートを LISTEN しているPID（lsof → fuser → ss の順に、最初に使えたツールで判定）
pub async fn find_listening_pids(port: u16) -> Vec<u32> {
    let lsof_args = vec![
        "-t".to_string(),
        format!("-iTCP:{}", port),
        "-sTCP:LISTEN".to_string(),
    ];
    if let Some(out) = run_probe("lsof", &lsof_args).await {
        // lsof は該当なしで終了コード1
        return parse_lsof_pids(&String::from_utf8_lossy(&out.stdout));
    }
    let fuser_args = vec!["-n".to_string(), "tcp".to_string(), port.to_string()];
    if let Some(out) = run_probe("fuser", &fuser_args).await {
        return parse_fuser_pids(&String::from_utf8_lossy(&out.stdout));
    }
    let ss_args = vec!["-ltnp".to_string(), format!("sport = :{}", port)];
    if let Some(out) = run_probe("ss", &ss_args).await {
        return parse_ss_pids(&String::from_utf8_lossy(&out.stdout));
    }
    warn!(port, "No port inspection tool (lsof/fuser/ss) available");
    Vec::new()
}

/// ポートを LISTEN しているプロセスを停止する（SIGTERM → `grace` 待ち → SIGKILL）
pub async fn stop_by_port(port: u16, grace: Duration) -> Result<(), ProcessError> {
    let pids = find_listening_pids(port).await;
    if pids.is_empty() {
        return Ok(());
    }
    info!(port, ?pids, "Stopping processes listening on port");
    for &pid in &pids {
        terminate_pid(pid)?;
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pids.iter().any(|&pid| is_process_running(pid)) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    for &pid in pids.iter().filter(|&&pid| is_process_running(pid)) {
        warn!(pid, "Process did not exit after SIGTERM, sending SIGKILL");
        kill_pid(pid)?;
    }
    Ok(())
}
