//! lbverify - ロードバランシング検証ハーネス
//!
//! 稼働中のゲートウェイに実リクエストを発行し、ゲートウェイ自身の監査ログから
//! 振り分け先（provider / key）を読み戻して、ディスパッチ戦略
//! （round_robin / random / first_available）の挙動を検証する。

#![warn(missing_docs)]

/// 共通型定義・エラー型
pub mod common;

/// 実行時設定（env ファイル・環境変数）
pub mod config;

/// ロギング初期化ユーティリティ
pub mod logging;

/// 実行の排他制御（シングル実行制約）
pub mod lock;

/// CLIインターフェース
pub mod cli;

/// シークレットのマスク・リダクション・漏洩検出
pub mod redact;

/// 設定ファイルの strategy 書き換え
pub mod config_switch;

/// 検証対象サービスのプロセス制御
pub mod process;

/// 検証対象サービスのHTTPクライアント
pub mod client;

/// 非フィクスチャ provider のキー隔離
pub mod isolation;

/// 有限回リトライ（read-after-write ポーリング）
pub mod retry;

/// フェーズ実行（ディスパッチ + 帰属の読み戻し）
pub mod phase;

/// 戦略ごとのシーケンス検証
pub mod verifier;

/// 実行全体のオーケストレーションとクリーンアップ
pub mod orchestrator;

/// Markdownレポート生成
pub mod report;
