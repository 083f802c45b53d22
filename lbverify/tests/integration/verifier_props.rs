//! 判定ロジックのプロパティテスト

use lbverify::common::types::{CheckOutcome, ObservationRecord, Strategy as LbStrategy};
use lbverify::redact::mask_key;
use lbverify::verifier::{check, check_keys, check_providers, FixtureLayout};
use proptest::prelude::*;

const A: &str = "prop_provider";
const B: &str = "prop_provider_b";
const K1: &str = "sk-prop-key-aaaa1111";
const K2: &str = "sk-prop-key-bbbb2222";

fn layout(two_keys: bool) -> FixtureLayout {
    FixtureLayout::new(A, B, K1, two_keys.then_some(K2))
}

fn records(seq: &[(&str, &str)]) -> Vec<ObservationRecord> {
    seq.iter()
        .enumerate()
        .map(|(i, (provider, key))| ObservationRecord {
            sequence_index: i,
            http_status: Some(200),
            latency_ms: 4,
            server_latency_ms: Some(2),
            provider: Some(provider.to_string()),
            key_hint: Some(mask_key(key)),
            attribution_error: None,
        })
        .collect()
}

/// 正しく動作するゲートウェイが返すはずの round_robin 列
fn ideal_round_robin(n: usize) -> Vec<(&'static str, &'static str)> {
    let mut a_hits = 0;
    (0..n)
        .map(|i| {
            if i % 2 == 0 {
                let key = if a_hits % 2 == 0 { K1 } else { K2 };
                a_hits += 1;
                (A, key)
            } else {
                (B, K1)
            }
        })
        .collect()
}

fn failure_positions(outcome: &CheckOutcome) -> Vec<usize> {
    match outcome {
        CheckOutcome::Fail(mismatches) => mismatches.iter().filter_map(|m| m.position).collect(),
        _ => Vec::new(),
    }
}

fn lb_strategy() -> impl Strategy<Value = LbStrategy> {
    prop::sample::select(LbStrategy::ALL.to_vec())
}

proptest! {
    #[test]
    fn ideal_round_robin_passes(n in 1usize..40) {
        let (providers, keys) = check(LbStrategy::RoundRobin, &records(&ideal_round_robin(n)), &layout(true));
        prop_assert_eq!(providers, CheckOutcome::Pass);
        prop_assert_eq!(keys, CheckOutcome::Pass);
    }

    #[test]
    fn swapped_round_robin_position_is_pinpointed(n in 2usize..40, pick in any::<prop::sample::Index>()) {
        let mut seq = ideal_round_robin(n);
        let i = pick.index(n);
        seq[i].0 = if seq[i].0 == A { B } else { A };

        let outcome = check_providers(LbStrategy::RoundRobin, &records(&seq), &layout(true));
        prop_assert_eq!(failure_positions(&outcome), vec![i]);
    }

    #[test]
    fn first_available_flags_every_other_provider_hit(hits in prop::collection::vec(any::<bool>(), 1..30)) {
        let seq: Vec<(&str, &str)> = hits.iter().map(|&on_b| (if on_b { B } else { A }, K1)).collect();
        let expected: Vec<usize> = hits.iter().enumerate().filter(|(_, on_b)| **on_b).map(|(i, _)| i).collect();

        let outcome = check_providers(LbStrategy::FirstAvailable, &records(&seq), &layout(true));
        prop_assert_eq!(failure_positions(&outcome), expected.clone());
        prop_assert_eq!(outcome == CheckOutcome::Pass, expected.is_empty());
    }

    #[test]
    fn random_requires_both_providers(hits in prop::collection::vec(any::<bool>(), 1..30)) {
        let seq: Vec<(&str, &str)> = hits.iter().map(|&on_b| (if on_b { B } else { A }, K1)).collect();
        let both = hits.iter().any(|&b| b) && hits.iter().any(|&b| !b);

        let outcome = check_providers(LbStrategy::Random, &records(&seq), &layout(true));
        prop_assert_eq!(outcome == CheckOutcome::Pass, both);
    }

    #[test]
    fn single_key_never_fails_key_check(
        strategy in lb_strategy(),
        hits in prop::collection::vec((any::<bool>(), any::<bool>()), 0..30),
    ) {
        let seq: Vec<(&str, &str)> = hits
            .iter()
            .map(|&(on_b, second)| (if on_b { B } else { A }, if second { K2 } else { K1 }))
            .collect();

        let outcome = check_keys(strategy, &records(&seq), &layout(false));
        prop_assert!(matches!(outcome, CheckOutcome::Skipped(_)));
    }
}
