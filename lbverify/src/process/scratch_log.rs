//! サイズ上限付きのスクラッチログ
//!
//! 子プロセスは追記モードで直接ファイルに書く（ハーネス終了後もサービスが出力を続けられるように）。
//! ハーネス側は定期的にサイズを確認し、上限を超えたら末尾を `<name>.1` に退避して切り詰める。
//! 追記モードなので切り詰め後の書き込みはファイル先頭から続く。

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// 1ファイルあたりの既定の上限
pub const SCRATCH_LOG_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// サイズ確認の間隔
pub const SCRATCH_LOG_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// 退避先のパス（`run.server.log` → `run.server.log.1`）
pub fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// ログを空にして、子プロセス用の追記ハンドルを返す
///
/// 前回の退避ファイルも削除する。
pub fn create(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(rotated_path(path)) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    File::create(path)?;
    OpenOptions::new().append(true).open(path)
}

fn tail_bytes(path: &Path, max_bytes: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// 上限を超えていれば末尾 `max_bytes` を退避して切り詰める
///
/// 退避した場合は `true`。ログが無ければ何もしない。
pub fn enforce_limit(path: &Path, max_bytes: u64) -> io::Result<bool> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if len <= max_bytes {
        return Ok(false);
    }
    let tail = tail_bytes(path, max_bytes)?;
    let mut rotated = File::create(rotated_path(path))?;
    rotated.write_all(&tail)?;
    rotated.flush()?;
    OpenOptions::new().write(true).open(path)?.set_len(0)?;
    debug!(path = %path.display(), dropped = len.saturating_sub(max_bytes), "Scratch log rotated");
    Ok(true)
}

/// サイズ監視タスクを起動する（`abort()` で止める）
pub fn spawn_guard(path: PathBuf, max_bytes: u64, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match enforce_limit(&path, max_bytes) {
                Ok(true) => info!(
                    path = %path.display(),
                    max_bytes,
                    "Service output exceeded the scratch log limit, older output moved aside"
                ),
                Ok(false) => {}
                Err(e) => debug!("Scratch log size check failed: {}", e),
            }
        }
    })
}

/// ファイル末尾 `max_bytes` バイトを（不正な UTF-8 を置換して）読み出す
///
/// 切り詰め直後で足りない分は退避ファイルの末尾から補う。
pub fn read_log_tail(path: &Path, max_bytes: u64) -> String {
    let mut tail = tail_bytes(path, max_bytes).unwrap_or_default();
    let missing = max_bytes.saturating_sub(tail.len() as u64);
    if missing > 0 {
        if let Ok(mut older) = tail_bytes(&rotated_path(path), missing) {
            older.extend_from_slice(&tail);
            tail = older;
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}
