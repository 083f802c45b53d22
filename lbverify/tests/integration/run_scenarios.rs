//! 偽ゲートウェイに対する実行シナリオのテスト

use crate::support::gateway::{FakeGateway, LEGACY_KEY};
use crate::support::lifecycle::FakeLifecycle;
use crate::support::{harness_config, KEY_1, KEY_2, ORIGINAL_CONFIG};
use lbverify::client::ServiceClient;
use lbverify::common::error::HarnessError;
use lbverify::common::types::{CheckOutcome, ObservationRecord, Strategy};
use lbverify::config::HarnessConfig;
use lbverify::orchestrator::{RunIds, RunOrchestrator, RunOutcome};
use lbverify::redact::mask_key;
use lbverify::report::{self, Artifacts};
use wiremock::MockServer;

struct Harness {
    _dir: tempfile::TempDir,
    _server: MockServer,
    gateway: FakeGateway,
    config: HarnessConfig,
}

async fn harness(phases: &str, two_keys: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (server, gateway) = FakeGateway::start().await;
    let config = harness_config(dir.path(), &server.uri(), phases, two_keys);
    Harness {
        _dir: dir,
        _server: server,
        gateway,
        config,
    }
}

async fn run(h: &Harness, service: FakeLifecycle) -> (RunIds, RunOutcome, Vec<String>) {
    let client = ServiceClient::new(&h.config.base_url).unwrap();
    let mut orchestrator = RunOrchestrator::new(h.config.clone(), client, service);
    let ids = orchestrator.ids().clone();
    let outcome = orchestrator.execute().await;
    let events = orchestrator.service().events();
    (ids, outcome, events)
}

fn providers(obs: &[ObservationRecord]) -> Vec<String> {
    obs.iter()
        .map(|o| o.provider.clone().unwrap_or_default())
        .collect()
}

/// 後片付けで元の状態に戻っていること
fn assert_torn_down(h: &Harness, ids: &RunIds) {
    assert_eq!(
        std::fs::read_to_string(&h.config.config_path).unwrap(),
        ORIGINAL_CONFIG
    );
    h.gateway.with(|g| {
        assert!(!g.providers.contains_key(&ids.provider_a));
        assert!(!g.providers.contains_key(&ids.provider_b));
        assert_eq!(g.providers["legacy"].keys, vec![LEGACY_KEY.to_string()]);
        assert!(g.providers["empty"].keys.is_empty());
        assert!(g.tokens.is_empty());
    });
}

#[tokio::test]
async fn test_round_robin_alternates_providers_and_keys() {
    let h = harness("round_robin:8", true).await;
    let service = FakeLifecycle::new(h.gateway.clone(), h.config.config_path.clone());
    let (ids, mut outcome, events) = run(&h, service).await;

    assert!(outcome.fatal.is_none(), "unexpected fatal: {:?}", outcome.fatal);
    assert_eq!(outcome.verdicts.len(), 1);
    let verdict = &outcome.verdicts[0];

    let expected: Vec<String> = (0..8)
        .map(|i| {
            if i % 2 == 0 {
                ids.provider_a.clone()
            } else {
                ids.provider_b.clone()
            }
        })
        .collect();
    assert_eq!(providers(&verdict.observations), expected);

    let a_keys: Vec<String> = verdict
        .observations
        .iter()
        .filter(|o| o.provider.as_deref() == Some(ids.provider_a.as_str()))
        .map(|o| o.key_hint.clone().unwrap())
        .collect();
    assert_eq!(
        a_keys,
        vec![mask_key(KEY_1), mask_key(KEY_2), mask_key(KEY_1), mask_key(KEY_2)]
    );
    assert_eq!(verdict.provider_check, CheckOutcome::Pass);
    assert_eq!(verdict.key_check, CheckOutcome::Pass);
    assert_eq!(outcome.exit_code(), 0);

    // フェーズ前の再起動と後片付けの再起動
    assert!(events.starts_with(&[
        "stop".to_string(),
        "release_port".to_string(),
        "start:round_robin".to_string(),
        "wait_ready:ok".to_string(),
    ]));
    assert!(events.contains(&"start:random".to_string()));
    assert_eq!(outcome.isolated, vec![("legacy".to_string(), 1)]);
    assert!(outcome.cleanup.iter().all(|s| s.ok()), "{:?}", outcome.cleanup);
    assert_torn_down(&h, &ids);

    // レポートにはマスク済みの値しか出ない
    let artifacts = Artifacts::for_run(&h.config.out_dir, &h.config.scratch_dir, &ids.run_id);
    report::publish(&mut outcome, &artifacts, None).unwrap();
    assert!(outcome.leak.is_none());
    let text = std::fs::read_to_string(&artifacts.report).unwrap();
    assert!(text.contains("- Conclusion: PASS"));
    assert!(!text.contains(KEY_1));
    assert!(!text.contains(KEY_2));
}

#[tokio::test]
async fn test_first_available_always_hits_first_provider_and_key() {
    let h = harness("first_available:5", true).await;
    let service = FakeLifecycle::new(h.gateway.clone(), h.config.config_path.clone());
    let (ids, outcome, _) = run(&h, service).await;

    assert!(outcome.fatal.is_none(), "unexpected fatal: {:?}", outcome.fatal);
    let verdict = &outcome.verdicts[0];
    assert_eq!(providers(&verdict.observations), vec![ids.provider_a.clone(); 5]);
    assert!(verdict
        .observations
        .iter()
        .all(|o| o.key_hint.as_deref() == Some(mask_key(KEY_1).as_str())));
    assert!(verdict.passed());
    assert_eq!(outcome.exit_code(), 0);
    assert_torn_down(&h, &ids);
}

#[tokio::test]
async fn test_readiness_failure_aborts_and_still_tears_down() {
    let h = harness("round_robin:4,first_available:3,random:4", true).await;
    let mut service = FakeLifecycle::new(h.gateway.clone(), h.config.config_path.clone());
    service.never_ready_with = Some(Strategy::FirstAvailable);
    let (ids, outcome, events) = run(&h, service).await;

    assert_eq!(outcome.verdicts.len(), 3);
    assert!(outcome.verdicts[0].passed());
    assert!(!outcome.verdicts[1].passed());
    assert!(outcome.verdicts[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("health check timed out")));
    assert!(outcome.verdicts[2].observations.is_empty());
    assert!(outcome.verdicts[2].error.is_some());

    match &outcome.fatal {
        Some(HarnessError::Readiness { log_tail, .. }) => {
            assert!(log_tail.contains("listener never came up"));
        }
        other => panic!("expected readiness failure, got {:?}", other),
    }
    assert!(!outcome.passed());
    assert_eq!(outcome.exit_code(), 2);
    assert!(events.contains(&"wait_ready:timeout".to_string()));
    // 後片付けで元の設定に戻して再起動している
    assert_eq!(events.last().map(String::as_str), Some("wait_ready:ok"));
    assert_torn_down(&h, &ids);
}

#[tokio::test]
async fn test_stuck_round_robin_is_reported_with_positions() {
    let h = harness("round_robin:8", true).await;
    h.gateway.with(|g| g.stuck_round_robin = true);
    let service = FakeLifecycle::new(h.gateway.clone(), h.config.config_path.clone());
    let (ids, outcome, _) = run(&h, service).await;

    assert!(outcome.fatal.is_none());
    let verdict = &outcome.verdicts[0];
    let CheckOutcome::Fail(mismatches) = &verdict.provider_check else {
        panic!("expected provider check failure: {:?}", verdict.provider_check);
    };
    let positions: Vec<usize> = mismatches.iter().filter_map(|m| m.position).collect();
    assert_eq!(positions, vec![1, 3, 5, 7]);
    assert!(mismatches.iter().all(|m| m.expected == ids.provider_b));
    assert_eq!(outcome.exit_code(), 1);
    assert_torn_down(&h, &ids);
}

#[tokio::test]
async fn test_single_key_skips_key_checks() {
    let h = harness("round_robin:4,first_available:2", false).await;
    let service = FakeLifecycle::new(h.gateway.clone(), h.config.config_path.clone());
    let (ids, outcome, _) = run(&h, service).await;

    assert!(outcome.fatal.is_none(), "unexpected fatal: {:?}", outcome.fatal);
    for verdict in &outcome.verdicts {
        assert!(matches!(verdict.key_check, CheckOutcome::Skipped(_)));
        assert!(verdict.passed());
    }
    assert_eq!(outcome.fixtures.as_ref().map(|f| f.key_count), Some(1));
    assert!(!outcome.notes.is_empty());
    assert_eq!(outcome.exit_code(), 0);
    assert_torn_down(&h, &ids);
}

#[tokio::test]
async fn test_preflight_start_that_never_gets_ready_is_stopped_in_teardown() {
    let h = harness("round_robin:2", true).await;
    h.gateway.with(|g| g.health_down = true);
    let mut service = FakeLifecycle::new(h.gateway.clone(), h.config.config_path.clone());
    // 元の設定は random
    service.never_ready_with = Some(Strategy::Random);
    let (ids, outcome, events) = run(&h, service).await;

    match &outcome.fatal {
        Some(HarnessError::Setup(msg)) => assert!(msg.contains("preflight"), "{msg}"),
        other => panic!("expected setup failure, got {:?}", other),
    }
    assert!(outcome.verdicts.is_empty());
    assert_eq!(outcome.exit_code(), 2);

    // 自分で起動したプロセスは後片付けで停止する
    assert_eq!(
        events,
        vec![
            "start:random",
            "wait_ready:timeout",
            "stop",
            "release_port",
            "start:random",
            "wait_ready:timeout",
        ]
    );
    assert!(outcome
        .cleanup
        .iter()
        .any(|s| s.description == "stop service" && s.ok()));
    assert_torn_down(&h, &ids);
}
