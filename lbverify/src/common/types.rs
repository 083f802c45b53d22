//! 共通型定義
//!
//! Strategy, Phase, ObservationRecord, PhaseVerdict 等のコアデータ型

use crate::common::error::CommonError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// ディスパッチ戦略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// ラウンドロビン
    RoundRobin,
    /// ランダム
    Random,
    /// 先頭優先
    FirstAvailable,
}

impl Strategy {
    /// 全戦略（既定のフェーズ順）
    pub const ALL: [Strategy; 3] = [
        Strategy::RoundRobin,
        Strategy::Random,
        Strategy::FirstAvailable,
    ];

    /// 設定ファイルに書き込む文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::FirstAvailable => "first_available",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "first_available" => Ok(Strategy::FirstAvailable),
            other => Err(CommonError::InvalidStrategy(other.to_string())),
        }
    }
}

/// 1フェーズの定義（実行開始時に確定し、以後不変）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// 検証する戦略
    pub strategy: Strategy,
    /// 発行するディスパッチリクエスト数（1以上）
    pub request_count: usize,
}

impl Phase {
    /// フェーズを作成する（`request_count == 0` はエラー）
    pub fn new(strategy: Strategy, request_count: usize) -> Result<Self, CommonError> {
        if request_count == 0 {
            return Err(CommonError::InvalidPhase(format!(
                "{}: request count must be positive",
                strategy
            )));
        }
        Ok(Self {
            strategy,
            request_count,
        })
    }

    /// 既定のフェーズ列: round_robin x8, random x20, first_available x5
    pub fn defaults() -> Vec<Phase> {
        vec![
            Phase {
                strategy: Strategy::RoundRobin,
                request_count: 8,
            },
            Phase {
                strategy: Strategy::Random,
                request_count: 20,
            },
            Phase {
                strategy: Strategy::FirstAvailable,
                request_count: 5,
            },
        ]
    }
}

impl FromStr for Phase {
    type Err = CommonError;

    /// `strategy:count` 形式を解釈する
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, count) = s
            .split_once(':')
            .ok_or_else(|| CommonError::InvalidPhase(format!("expected strategy:count, got '{}'", s)))?;
        let strategy: Strategy = name.parse()?;
        let request_count: usize = count
            .trim()
            .parse()
            .map_err(|_| CommonError::InvalidPhase(format!("invalid request count '{}'", count)))?;
        Phase::new(strategy, request_count)
    }
}

/// カンマ区切りのフェーズ列を解釈する（例: `round_robin:8,random:20`）
pub fn parse_phases(s: &str) -> Result<Vec<Phase>, CommonError> {
    let phases = s
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<Phase>, _>>()?;
    if phases.is_empty() {
        return Err(CommonError::InvalidPhase("phase list is empty".to_string()));
    }
    Ok(phases)
}

/// ディスパッチに使うクライアントトークン
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredential {
    /// トークンID（削除・無効化に使用）
    pub id: String,
    /// トークン値（シークレット）
    pub token: String,
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("id", &self.id)
            .field("token", &"***")
            .finish()
    }
}

/// 隔離時に取り外したキーのスナップショット
///
/// フィクスチャ名前空間外の provider のみを保持する。キーを持たない provider は
/// エントリを持たない。
#[derive(Default, Clone, PartialEq, Eq)]
pub struct IsolationSnapshot {
    entries: BTreeMap<String, Vec<String>>,
}

impl IsolationSnapshot {
    /// 空のスナップショット
    pub fn new() -> Self {
        Self::default()
    }

    /// provider のキー集合を記録する（空のキー集合は記録しない）
    pub fn record(&mut self, provider: impl Into<String>, keys: Vec<String>) {
        if !keys.is_empty() {
            self.entries.insert(provider.into(), keys);
        }
    }

    /// provider のキー集合
    pub fn keys_for(&self, provider: &str) -> Option<&[String]> {
        self.entries.get(provider).map(Vec::as_slice)
    }

    /// 名前順のイテレータ
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.entries.iter()
    }

    /// エントリ数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for IsolationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

/// 1リクエスト分の観測結果（記録後は変更しない）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservationRecord {
    /// フェーズ内の0始まりの位置
    pub sequence_index: usize,
    /// ディスパッチ応答のHTTPステータス（トランスポートエラー時は `None`）
    pub http_status: Option<u16>,
    /// クライアント側で計測したレイテンシ
    pub latency_ms: u64,
    /// ログに記録されたサーバー側レイテンシ
    pub server_latency_ms: Option<u64>,
    /// ログから読み戻した provider 名（見つからなければ `None`）
    pub provider: Option<String>,
    /// ローカルで再マスクしたキーヒント
    pub key_hint: Option<String>,
    /// 帰属が読み戻せなかったときの最後のログ読み出しエラー（読めたが記録が無い場合は `None`）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribution_error: Option<String>,
}

impl ObservationRecord {
    /// ログから帰属が読み戻せたか
    pub fn is_attributed(&self) -> bool {
        self.provider.is_some()
    }
}

/// 検証ルール違反（期待値と観測値）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    /// 違反したルール名（例: `round_robin_alternation`）
    pub rule: String,
    /// 乖離したシーケンス位置（0始まり、全体ルールは `None`）
    pub position: Option<usize>,
    /// 期待値
    pub expected: String,
    /// 観測値
    pub observed: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(pos) => write!(
                f,
                "{} at #{}: expected {}, observed {}",
                self.rule,
                pos + 1,
                self.expected,
                self.observed
            ),
            None => write!(
                f,
                "{}: expected {}, observed {}",
                self.rule, self.expected, self.observed
            ),
        }
    }
}

/// サブチェックの結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// 合格
    Pass,
    /// 不合格（1件以上の違反）
    Fail(Vec<Mismatch>),
    /// 明示的にスキップ（理由付き）
    Skipped(String),
}

impl CheckOutcome {
    /// 合格またはスキップなら `true`
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, CheckOutcome::Fail(_))
    }

    /// 表示用ラベル
    pub fn label(&self) -> &'static str {
        match self {
            CheckOutcome::Pass => "PASS",
            CheckOutcome::Fail(_) => "FAIL",
            CheckOutcome::Skipped(_) => "SKIP",
        }
    }
}

/// フェーズ判定
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseVerdict {
    /// 対象フェーズ
    pub phase: Phase,
    /// provider レベルの検証結果
    pub provider_check: CheckOutcome,
    /// key レベルの検証結果
    pub key_check: CheckOutcome,
    /// 観測列
    pub observations: Vec<ObservationRecord>,
    /// フェーズを中断させたエラー（readiness 失敗・未実行など）
    pub error: Option<String>,
}

impl PhaseVerdict {
    /// 実行されなかったフェーズ
    pub fn not_run(phase: Phase, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            phase,
            provider_check: CheckOutcome::Skipped("not run".to_string()),
            key_check: CheckOutcome::Skipped("not run".to_string()),
            observations: Vec::new(),
            error: Some(reason),
        }
    }

    /// provider チェックが合格し、key チェックが合格またはスキップで、エラーがない
    pub fn passed(&self) -> bool {
        self.error.is_none()
            && self.provider_check == CheckOutcome::Pass
            && self.key_check.is_acceptable()
    }
}
