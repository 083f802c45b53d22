//! 共通型定義とエラー型

/// エラー型
pub mod error;

/// データモデル
pub mod types;
