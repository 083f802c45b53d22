//! 統合テスト用のサポートユーティリティ

pub mod gateway;
pub mod lifecycle;

use lbverify::config::{ConfigOverrides, EnvSource, HarnessConfig};
use lbverify::retry::RetryPolicy;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// 上流キー（マスク後のヒントが区別できる長さ）
pub const KEY_1: &str = "sk-test-key-one-1111";
/// 2本目の上流キー
pub const KEY_2: &str = "sk-test-key-two-2222";

/// 検証対象の設定ファイル（strategy 以外の行も保持されることを確認する）
pub const ORIGINAL_CONFIG: &str = "# gateway config\n[server]\nport = 8080\n\n[load_balancing]\nstrategy = \"random\"  # default\nhealth_check = true\n";

/// 偽ゲートウェイ向けのハーネス設定
#[allow(dead_code)]
pub fn harness_config(root: &Path, base_url: &str, phases: &str, two_keys: bool) -> HarnessConfig {
    let config_path = root.join("custom-config.toml");
    std::fs::write(&config_path, ORIGINAL_CONFIG).unwrap();

    let mut env = HashMap::new();
    env.insert("EMAIL".to_string(), "admin@example.com".to_string());
    env.insert("PASSWORD".to_string(), "admin-password".to_string());
    env.insert("UPSTREAM_API_KEY_1".to_string(), KEY_1.to_string());
    if two_keys {
        env.insert("UPSTREAM_API_KEY_2".to_string(), KEY_2.to_string());
    }
    env.insert(
        "UPSTREAM_BASE_URL".to_string(),
        "https://upstream.example.com/v1".to_string(),
    );
    env.insert("PROVIDER_API_TYPE".to_string(), "openai".to_string());

    let overrides = ConfigOverrides {
        base_url: Some(base_url.to_string()),
        config_path: Some(config_path),
        service_command: Some("unused-service".to_string()),
        out_dir: Some(root.join("out")),
        phases: Some(phases.to_string()),
        prefix_root: Some("itest".to_string()),
        ready_timeout_secs: Some(1),
        ..Default::default()
    };
    let mut config = HarnessConfig::resolve(root, &EnvSource::from_map(env), overrides).unwrap();
    config.log_poll = RetryPolicy::new(3, Duration::from_millis(5));
    config.teardown_ready_timeout = Duration::from_secs(1);
    config
}
