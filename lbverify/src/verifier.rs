//! 戦略ごとのシーケンス検証
//!
//! フィクスチャ provider を辞書順に (p0, p1)、provider A のキーを作成順に (k1, k2) として:
//!
//! - `first_available`: 全観測の provider が p0。2キーなら A の全ヒットが k1
//! - `round_robin`: provider 列が `[p0, p1, p0, p1, ...]`。A の部分列のキーが `[k1, k2, k1, k2, ...]`
//! - `random`: p0 と p1 がそれぞれ1回以上。A のヒットが8回以上なら k1 と k2 もそれぞれ1回以上
//!   （8回未満なら key チェックはスキップ）
//!
//! 2キーが利用可能な場合、provider B（k1 のみ保持）のヒットは常に k1 でなければならない。
//! provider と key のチェックは独立に評価する。

use crate::common::types::{CheckOutcome, Mismatch, ObservationRecord, Strategy};
use crate::redact::mask_key;

/// random で key チェックを行うのに必要な provider A のヒット数
pub const RANDOM_KEY_MIN_HITS: usize = 8;

const UNKNOWN: &str = "(unknown)";

/// key チェックの前提
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCheckMode {
    /// 2キーのマスク済みヒントで検証する
    Enabled {
        /// k1 のヒント
        k1: String,
        /// k2 のヒント
        k2: String,
    },
    /// 検証できない（理由付きでスキップ）
    Disabled(String),
}

/// フィクスチャの配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureLayout {
    /// 辞書順で先の provider
    pub p0: String,
    /// 辞書順で後の provider
    pub p1: String,
    /// provider A（1〜2キー）
    pub provider_a: String,
    /// provider B（k1 のみ）
    pub provider_b: String,
    /// key チェックの前提
    pub key_mode: KeyCheckMode,
}

impl FixtureLayout {
    /// provider 名とキーから配置を決める
    ///
    /// `k2` がない場合、または k1/k2 のローカルマスクが一致して区別できない場合は
    /// key チェックを理由付きでスキップする。
    pub fn new(provider_a: &str, provider_b: &str, k1: &str, k2: Option<&str>) -> Self {
        let (p0, p1) = if provider_a <= provider_b {
            (provider_a, provider_b)
        } else {
            (provider_b, provider_a)
        };
        let key_mode = match k2.filter(|k| !k.trim().is_empty()) {
            None => KeyCheckMode::Disabled(
                "only one upstream key available; key-level rotation not verified".to_string(),
            ),
            Some(k2) => {
                let (h1, h2) = (mask_key(k1), mask_key(k2));
                if h1 == h2 {
                    KeyCheckMode::Disabled(format!(
                        "k1 and k2 mask to the same hint {}; keys are indistinguishable in the log",
                        h1
                    ))
                } else {
                    KeyCheckMode::Enabled { k1: h1, k2: h2 }
                }
            }
        };
        Self {
            p0: p0.to_string(),
            p1: p1.to_string(),
            provider_a: provider_a.to_string(),
            provider_b: provider_b.to_string(),
            key_mode,
        }
    }

    /// 2キーで key チェックが有効か
    pub fn has_two_keys(&self) -> bool {
        matches!(self.key_mode, KeyCheckMode::Enabled { .. })
    }
}

fn mismatch(rule: &str, position: Option<usize>, expected: &str, observed: &str) -> Mismatch {
    Mismatch {
        rule: rule.to_string(),
        position,
        expected: expected.to_string(),
        observed: observed.to_string(),
    }
}

fn outcome(mismatches: Vec<Mismatch>) -> CheckOutcome {
    if mismatches.is_empty() {
        CheckOutcome::Pass
    } else {
        CheckOutcome::Fail(mismatches)
    }
}

/// provider レベルの検証
///
/// ログから帰属を読み戻せなかった観測はそれ自体が不合格。
pub fn check_providers(
    strategy: Strategy,
    observations: &[ObservationRecord],
    layout: &FixtureLayout,
) -> CheckOutcome {
    let mut mismatches: Vec<Mismatch> = observations
        .iter()
        .filter(|o| !o.is_attributed())
        .map(|o| {
            let observed = match &o.attribution_error {
                Some(err) => format!("none (request log unreadable: {})", err),
                None => "none (no new request log record)".to_string(),
            };
            mismatch("attribution_missing", Some(o.sequence_index), "request log record", &observed)
        })
        .collect();

    let seen = |o: &ObservationRecord| o.provider.as_deref().unwrap_or(UNKNOWN).to_string();

    match strategy {
        Strategy::FirstAvailable => {
            for o in observations.iter().filter(|o| o.is_attributed()) {
                let observed = seen(o);
                if observed != layout.p0 {
                    mismatches.push(mismatch(
                        "first_available_provider",
                        Some(o.sequence_index),
                        &layout.p0,
                        &observed,
                    ));
                }
            }
        }
        Strategy::RoundRobin => {
            for (i, o) in observations.iter().enumerate() {
                if !o.is_attributed() {
                    continue;
                }
                let expected = if i % 2 == 0 { &layout.p0 } else { &layout.p1 };
                let observed = seen(o);
                if &observed != expected {
                    mismatches.push(mismatch(
                        "round_robin_alternation",
                        Some(o.sequence_index),
                        expected,
                        &observed,
                    ));
                }
            }
        }
        Strategy::Random => {
            for provider in [&layout.p0, &layout.p1] {
                let hits = observations
                    .iter()
                    .filter(|o| o.provider.as_deref() == Some(provider.as_str()))
                    .count();
                if hits == 0 {
                    mismatches.push(mismatch(
                        "random_provider_presence",
                        None,
                        &format!("{} at least once", provider),
                        &format!("0 of {}", observations.len()),
                    ));
                }
            }
        }
    }
    outcome(mismatches)
}

/// key レベルの検証
pub fn check_keys(
    strategy: Strategy,
    observations: &[ObservationRecord],
    layout: &FixtureLayout,
) -> CheckOutcome {
    let (k1, k2) = match &layout.key_mode {
        KeyCheckMode::Enabled { k1, k2 } => (k1.as_str(), k2.as_str()),
        KeyCheckMode::Disabled(reason) => return CheckOutcome::Skipped(reason.clone()),
    };
    let hint = |o: &ObservationRecord| o.key_hint.clone().unwrap_or_else(|| UNKNOWN.to_string());
    let hits_of = |name: &str| -> Vec<&ObservationRecord> {
        observations
            .iter()
            .filter(|o| o.provider.as_deref() == Some(name))
            .collect()
    };

    let mut mismatches = Vec::new();

    // provider B は k1 しか持たない
    for o in hits_of(&layout.provider_b) {
        let observed = hint(o);
        if observed != k1 {
            mismatches.push(mismatch("provider_b_key", Some(o.sequence_index), k1, &observed));
        }
    }

    let a_hits = hits_of(&layout.provider_a);
    match strategy {
        Strategy::FirstAvailable => {
            for o in &a_hits {
                let observed = hint(o);
                if observed != k1 {
                    mismatches.push(mismatch(
                        "first_available_key",
                        Some(o.sequence_index),
                        k1,
                        &observed,
                    ));
                }
            }
        }
        Strategy::RoundRobin => {
            for (j, o) in a_hits.iter().enumerate() {
                let expected = if j % 2 == 0 { k1 } else { k2 };
                let observed = hint(o);
                if observed != expected {
                    mismatches.push(mismatch(
                        "round_robin_key_alternation",
                        Some(o.sequence_index),
                        expected,
                        &observed,
                    ));
                }
            }
        }
        Strategy::Random => {
            if a_hits.len() < RANDOM_KEY_MIN_HITS {
                if mismatches.is_empty() {
                    return CheckOutcome::Skipped(format!(
                        "provider A hit {} times (< {}); sample too small for key presence",
                        a_hits.len(),
                        RANDOM_KEY_MIN_HITS
                    ));
                }
            } else {
                for key in [k1, k2] {
                    if !a_hits.iter().any(|o| o.key_hint.as_deref() == Some(key)) {
                        mismatches.push(mismatch(
                            "random_key_presence",
                            None,
                            &format!("{} at least once", key),
                            &format!("0 of {} provider A hits", a_hits.len()),
                        ));
                    }
                }
            }
        }
    }
    outcome(mismatches)
}

/// provider / key の両チェックを評価する
pub fn check(
    strategy: Strategy,
    observations: &[ObservationRecord],
    layout: &FixtureLayout,
) -> (CheckOutcome, CheckOutcome) {
    (
        check_providers(strategy, observations, layout),
        check_keys(strategy, observations, layout),
    )
}
