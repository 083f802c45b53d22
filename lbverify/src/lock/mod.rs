//! 検証実行の排他制御（シングル実行制約）
//!
//! 同一サービスポートに対して2つのハーネスが同時に設定ファイル・プロセス・
//! フィクスチャを操作しないよう、ポート単位のアドバイザリロックを提供します。
//!
//! - fs2 によるクロスプラットフォームファイルロック
//! - ロックファイルに JSON で PID・開始時刻・ポートを記録
//! - 記録された PID が存在しない残留ロックは自動で解除
//! - Drop でロック解除とファイル削除

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// ロックファイルに保存される実行情報
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockInfo {
    /// ハーネスプロセスのPID
    pub pid: u32,
    /// 実行開始時刻（UTC）
    pub started_at: DateTime<Utc>,
    /// 検証対象サービスのポート
    pub port: u16,
}

/// ロック操作に関するエラー型
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// 同一ポートで既に検証が実行中
    #[error("Another verification run is active for port {port} (PID: {pid}, started: {started_at})")]
    AlreadyRunning {
        /// ポート番号
        port: u16,
        /// 実行中プロセスのPID
        pid: u32,
        /// 開始時刻
        started_at: DateTime<Utc>,
    },

    /// ロック取得に失敗
    #[error("Failed to acquire run lock: {0}")]
    AcquireFailed(#[source] std::io::Error),

    /// ロック解除に失敗
    #[error("Failed to release run lock: {0}")]
    ReleaseFailed(#[source] std::io::Error),

    /// ロックファイルが破損
    #[error("Run lock file corrupted: {0}")]
    Corrupted(String),

    /// ロックディレクトリの作成に失敗
    #[error("Failed to create lock directory: {0}")]
    DirectoryCreationFailed(#[source] std::io::Error),
}

/// 既定のロックディレクトリ（`<tmp>/lbverify`）
pub fn lock_dir() -> PathBuf {
    std::env::temp_dir().join("lbverify")
}

/// 指定ポートのロックファイルパス（例: `/tmp/lbverify/run_8080.lock`）
pub fn lock_path(dir: &Path, port: u16) -> PathBuf {
    dir.join(format!("run_{}.lock", port))
}

/// 指定PIDのプロセスが存在するか確認
pub fn is_process_running(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

/// ロックファイルからロック情報を読み取る
///
/// ファイルが存在しなければ `Ok(None)`。
pub fn read_lock_info(path: &Path) -> Result<Option<LockInfo>, LockError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| LockError::Corrupted(format!("Failed to read lock file: {}", e)))?;
    let info: LockInfo = serde_json::from_str(&content)
        .map_err(|e| LockError::Corrupted(format!("Invalid JSON in lock file: {}", e)))?;
    Ok(Some(info))
}

/// 検証実行のファイルロック
///
/// スコープを抜けるか `release()` を呼ぶとロックが解除される。
pub struct RunLock {
    lock_file: Option<File>,
    lock_path: PathBuf,
    info: LockInfo,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("lock_path", &self.lock_path)
            .field("info", &self.info)
            .finish()
    }
}

impl RunLock {
    /// 既定ディレクトリでロックを取得する
    pub fn acquire(port: u16) -> Result<Self, LockError> {
        Self::acquire_in(&lock_dir(), port)
    }

    /// 指定ディレクトリでロックを取得する
    ///
    /// 記録された PID が生存していれば `AlreadyRunning`。
    /// 生存していなければ残留ロックとして削除してから取得する。
    pub fn acquire_in(dir: &Path, port: u16) -> Result<Self, LockError> {
        std::fs::create_dir_all(dir).map_err(LockError::DirectoryCreationFailed)?;
        let path = lock_path(dir, port);

        if let Some(existing) = read_lock_info(&path)? {
            if is_process_running(existing.pid) {
                return Err(LockError::AlreadyRunning {
                    port: existing.port,
                    pid: existing.pid,
                    started_at: existing.started_at,
                });
            }
            warn!(
                "Stale run lock detected (PID {} not running), cleaning up",
                existing.pid
            );
            std::fs::remove_file(&path).map_err(LockError::AcquireFailed)?;
        }

        let mut file = File::create(&path).map_err(LockError::AcquireFailed)?;
        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                LockError::AcquireFailed(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "Run lock is held by another process",
                ))
            } else {
                LockError::AcquireFailed(e)
            }
        })?;

        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
            port,
        };
        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| LockError::AcquireFailed(std::io::Error::other(e)))?;
        file.write_all(json.as_bytes())
            .map_err(LockError::AcquireFailed)?;
        file.flush().map_err(LockError::AcquireFailed)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(LockError::AcquireFailed)?;
        }

        debug!("Run lock acquired for port {} (PID: {})", port, info.pid);
        Ok(Self {
            lock_file: Some(file),
            lock_path: path,
            info,
        })
    }

    /// ロック情報
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// ロックファイルのパス
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// ロックを明示的に解除する
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_internal()
    }

    fn release_internal(&mut self) -> Result<(), LockError> {
        if let Some(file) = self.lock_file.take() {
            FileExt::unlock(&file).map_err(LockError::ReleaseFailed)?;
            drop(file);
            if self.lock_path.exists() {
                std::fs::remove_file(&self.lock_path).map_err(LockError::ReleaseFailed)?;
            }
            debug!("Run lock released for port {}", self.info.port);
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_internal() {
            warn!("Failed to release run lock on drop: {}", e);
        }
    }
}
