//! エラー型定義
//!
//! 統一エラー型（thiserror使用）
//!
//! `HarnessError` は実行全体を止める失敗（セットアップ・隔離・readiness）を表す。
//! シーケンス検証の不一致はエラーではなく `CheckOutcome::Fail` として、
//! 成果物の漏洩は `RunOutcome::leak` として記録される。

use crate::client::ClientError;
use crate::config_switch::ConfigSwitchError;
use crate::isolation::IsolationError;
use crate::process::ProcessError;
use thiserror::Error;

/// 共通層のエラー型
#[derive(Debug, Error)]
pub enum CommonError {
    /// 未知の戦略名
    #[error("Unknown strategy: {0} (expected round_robin, random or first_available)")]
    InvalidStrategy(String),

    /// フェーズ定義の不正
    #[error("Invalid phase: {0}")]
    InvalidPhase(String),
}

/// 実行レベルのエラー型
#[derive(Debug, Error)]
pub enum HarnessError {
    /// セットアップ失敗（認証・フィクスチャ作成・上流資格情報の欠落）
    #[error("Setup failed: {0}")]
    Setup(String),

    /// 隔離失敗（ロールバック試行後）
    #[error(transparent)]
    Isolation(#[from] IsolationError),

    /// サービスが ready にならなかった
    #[error("Service not ready ({context}): {reason}")]
    Readiness {
        /// どの再起動で失敗したか
        context: String,
        /// 失敗理由
        reason: String,
        /// サービス出力の末尾
        log_tail: String,
    },
}

impl HarnessError {
    /// バイナリの終了コード
    ///
    /// 実行を止める失敗は全て `2`（フェーズ不合格の `1` とは区別する）。
    pub fn exit_code(&self) -> i32 {
        2
    }

    /// 失敗区分の表示名
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::Setup(_) => "setup",
            HarnessError::Isolation(_) => "isolation",
            HarnessError::Readiness { .. } => "readiness",
        }
    }
}

impl From<ClientError> for HarnessError {
    fn from(err: ClientError) -> Self {
        HarnessError::Setup(err.to_string())
    }
}

impl From<ConfigSwitchError> for HarnessError {
    fn from(err: ConfigSwitchError) -> Self {
        HarnessError::Setup(err.to_string())
    }
}

impl From<ProcessError> for HarnessError {
    fn from(err: ProcessError) -> Self {
        HarnessError::Setup(err.to_string())
    }
}

impl From<CommonError> for HarnessError {
    fn from(err: CommonError) -> Self {
        HarnessError::Setup(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_error_exit_code_and_kind() {
        let err = HarnessError::Setup("login failed".to_string());
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.kind(), "setup");
        assert_eq!(err.to_string(), "Setup failed: login failed");

        let err = HarnessError::Readiness {
            context: "strategy=random".to_string(),
            reason: "process exited".to_string(),
            log_tail: "boom".to_string(),
        };
        assert_eq!(err.kind(), "readiness");
        assert_eq!(
            err.to_string(),
            "Service not ready (strategy=random): process exited"
        );
    }

    #[test]
    fn test_isolation_and_client_errors_map_to_kinds() {
        let err: HarnessError = IsolationError::Enumerate(ClientError::NotAuthenticated(
            "GET /providers".to_string(),
        ))
        .into();
        assert_eq!(err.kind(), "isolation");
        assert_eq!(err.exit_code(), 2);

        // クライアント・プロセス・設定切替の失敗はセットアップ失敗として扱う
        let err: HarnessError = ClientError::InvalidBaseUrl("::".to_string()).into();
        assert_eq!(err.kind(), "setup");
        let err: HarnessError = CommonError::InvalidPhase("phase list is empty".to_string()).into();
        assert_eq!(err.kind(), "setup");
    }

    #[test]
    fn test_common_error_display() {
        let err = CommonError::InvalidStrategy("weighted".to_string());
        assert!(err.to_string().contains("weighted"));
    }
}
