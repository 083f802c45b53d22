//! 非フィクスチャ provider のキー隔離
//!
//! 検証中に観測されるディスパッチが、この実行のフィクスチャ以外から
//! 発生しないよう、他の provider のキーを一時的に取り外す。
//! 取り外しの途中で失敗した場合は、既に取り外した分を戻してからエラーを返す。

use crate::client::{ClientError, ServiceClient};
use crate::common::types::IsolationSnapshot;
use tracing::{info, warn};

/// 隔離のエラー型
#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    /// provider 一覧の取得に失敗
    #[error("Isolation failed: cannot list providers: {0}")]
    Enumerate(#[source] ClientError),

    /// キーのスナップショット取得に失敗（まだ何も取り外していない）
    #[error("Isolation failed: cannot read keys of provider {provider}: {source}")]
    Snapshot {
        /// provider 名
        provider: String,
        /// 元のエラー
        #[source]
        source: ClientError,
    },

    /// キーの取り外しに失敗（ロールバック試行済み）
    #[error("Isolation failed: cannot strip keys from provider {provider}: {source} (rollback: {})", rollback_summary(.rollback_failures))]
    Strip {
        /// 失敗した provider 名
        provider: String,
        /// 元のエラー
        #[source]
        source: ClientError,
        /// ロールバックに失敗した provider
        rollback_failures: Vec<String>,
    },
}

fn rollback_summary(failures: &[String]) -> String {
    if failures.is_empty() {
        "ok".to_string()
    } else {
        format!("failed for {}", failures.join(", "))
    }
}

/// provider 1件分の復元結果
#[derive(Debug)]
pub struct RestoreOutcome {
    /// provider 名
    pub provider: String,
    /// 復元したキー数
    pub key_count: usize,
    /// 結果
    pub result: Result<(), ClientError>,
}

/// キー隔離の制御
#[derive(Debug)]
pub struct IsolationController {
    prefix: String,
    snapshot: IsolationSnapshot,
}

impl IsolationController {
    /// この実行のフィクスチャ名前空間（接頭辞）を指定して作成する
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            snapshot: IsolationSnapshot::new(),
        }
    }

    /// 取り外し済みのキー
    pub fn snapshot(&self) -> &IsolationSnapshot {
        &self.snapshot
    }

    /// フィクスチャ名前空間外でキーを持つ provider から全キーを取り外す
    pub async fn isolate(&mut self, client: &ServiceClient) -> Result<(), IsolationError> {
        let providers = client
            .list_providers()
            .await
            .map_err(IsolationError::Enumerate)?;

        let mut pending = IsolationSnapshot::new();
        for provider in providers {
            if provider.name.is_empty() || provider.name.starts_with(&self.prefix) || !provider.has_keys() {
                continue;
            }
            let keys = client
                .provider_keys_raw(&provider.name)
                .await
                .map_err(|source| IsolationError::Snapshot {
                    provider: provider.name.clone(),
                    source,
                })?;
            pending.record(provider.name, keys);
        }

        for (name, keys) in pending.iter() {
            match client.delete_keys_batch(name, keys).await {
                Ok(()) => {
                    info!(provider = %name, keys = keys.len(), "Isolation: keys removed");
                    self.snapshot.record(name.clone(), keys.clone());
                }
                Err(source) => {
                    warn!(provider = %name, "Isolation: key removal failed, rolling back: {}", source);
                    // 失敗した provider も部分的に消えている可能性がある
                    self.snapshot.record(name.clone(), keys.clone());
                    let rollback_failures = self
                        .restore(client)
                        .await
                        .into_iter()
                        .filter(|o| o.result.is_err())
                        .map(|o| o.provider)
                        .collect();
                    return Err(IsolationError::Strip {
                        provider: name.clone(),
                        source,
                        rollback_failures,
                    });
                }
            }
        }
        Ok(())
    }

    /// 取り外したキーを provider ごとに独立して戻す
    ///
    /// 1件の失敗は他の provider の復元を妨げない。呼び出し後スナップショットは空になる。
    pub async fn restore(&mut self, client: &ServiceClient) -> Vec<RestoreOutcome> {
        let snapshot = std::mem::take(&mut self.snapshot);
        let mut outcomes = Vec::with_capacity(snapshot.len());
        for (name, keys) in snapshot.iter() {
            let result = client.add_keys_batch(name, keys).await;
            match &result {
                Ok(()) => info!(provider = %name, keys = keys.len(), "Isolation: keys restored"),
                Err(e) => warn!(provider = %name, "Isolation: key restore failed: {}", e),
            }
            outcomes.push(RestoreOutcome {
                provider: name.clone(),
                key_count: keys.len(),
                result,
            });
        }
        outcomes
    }
}
