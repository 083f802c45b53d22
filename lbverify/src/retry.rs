//! 有限回リトライ（read-after-write ポーリング）
//!
//! 書き込みが非同期に反映される読み出し（リクエストログ等）を、
//! 最大試行回数と固定ディレイで待つ。

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// リトライ方針
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大試行回数（0 は 1 とみなす）
    pub max_attempts: u32,
    /// 試行間の固定ディレイ
    pub delay: Duration,
}

impl RetryPolicy {
    /// 方針を作成する
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// `op` が `Some` を返すまで最大 `max_attempts` 回呼び出す
///
/// `op` には 0 始まりの試行番号が渡される。`Err` は即座に返す。
/// 全試行で `None` だった場合は `Ok(None)`（呼び出し側で「記録なし」として扱う）。
pub async fn poll_until<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        if let Some(found) = op(attempt).await? {
            return Ok(Some(found));
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }
    debug!("poll_until exhausted after {} attempts", attempts);
    Ok(None)
}
