//! 検証実行のオーケストレーション
//!
//! 準備（preflight・認証・上流資格情報・隔離・フィクスチャ）→ 各フェーズ → 後片付け。
//! 後片付けは独立したステップの列で、どのステップが失敗しても残りは必ず実行する。

use crate::client::types::CreateProviderRequest;
use crate::client::{normalize_provider_base_url, pick_model_id, ServiceClient};
use crate::common::error::HarnessError;
use crate::common::types::{ClientCredential, Phase, PhaseVerdict};
use crate::config::HarnessConfig;
use crate::config_switch::ConfigSwitcher;
use crate::isolation::IsolationController;
use crate::phase::PhaseRunner;
use crate::process::ServiceLifecycle;
use crate::redact::{mask_secret, register_secret, LeakError};
use crate::verifier::FixtureLayout;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, error, info, warn};

/// 実行ごとの識別子とフィクスチャ名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIds {
    /// 実行ID（成果物のファイル名に使う）
    pub run_id: String,
    /// フィクスチャ名前空間（隔離の対象外）
    pub prefix: String,
    /// provider A（1〜2キー）
    pub provider_a: String,
    /// provider B（k1 のみ）
    pub provider_b: String,
    /// クライアントトークン名
    pub token_name: String,
}

impl RunIds {
    /// 時刻とランダムな接尾辞から生成する
    pub fn generate(prefix_root: &str, now: DateTime<Utc>) -> Self {
        let stamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let suffix: [u8; 3] = rand::random();
        let hex: String = suffix.iter().map(|b| format!("{:02x}", b)).collect();
        let prefix = format!("{}_{}", prefix_root, stamp);
        Self {
            run_id: format!("lbverify_{}_{}", stamp, hex),
            provider_a: format!("{}_provider", prefix),
            provider_b: format!("{}_provider_b", prefix),
            token_name: format!("{}_clienttoken", prefix),
            prefix,
        }
    }
}

/// 後片付け1ステップの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupStep {
    /// 内容
    pub description: String,
    /// 失敗時のエラー
    pub error: Option<String>,
}

impl CleanupStep {
    /// 成功したか
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct CleanupChain {
    steps: Vec<CleanupStep>,
}

impl CleanupChain {
    fn record<E: fmt::Display>(&mut self, description: impl Into<String>, result: Result<(), E>) {
        let description = description.into();
        let error = match result {
            Ok(()) => {
                info!("Cleanup: {}", description);
                None
            }
            Err(e) => {
                warn!("Cleanup failed: {}: {}", description, e);
                Some(e.to_string())
            }
        };
        self.steps.push(CleanupStep { description, error });
    }
}

/// レポートに載せるフィクスチャ情報（シークレットは含まない）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSummary {
    /// provider A
    pub provider_a: String,
    /// provider B
    pub provider_b: String,
    /// クライアントトークン名
    pub token_name: String,
    /// ディスパッチに使うモデル
    pub model: String,
    /// 上流APIタイプ
    pub api_type: String,
    /// マスク済みの上流ベースURL
    pub upstream_base_url: String,
    /// 利用可能な上流キー数（1 または 2）
    pub key_count: usize,
    /// 上流資格情報の取得元
    pub credential_source: String,
}

/// 1実行の結果
#[derive(Debug)]
pub struct RunOutcome {
    /// 識別子
    pub ids: RunIds,
    /// 開始時刻
    pub started_at: DateTime<Utc>,
    /// 検証対象のベースURL
    pub base_url: String,
    /// 予定していたフェーズ
    pub phases: Vec<Phase>,
    /// フィクスチャ（作成前に失敗した場合は `None`）
    pub fixtures: Option<FixtureSummary>,
    /// 隔離した provider と取り外したキー数
    pub isolated: Vec<(String, usize)>,
    /// フェーズ判定
    pub verdicts: Vec<PhaseVerdict>,
    /// 実行を止めた失敗
    pub fatal: Option<HarnessError>,
    /// 後片付けの結果
    pub cleanup: Vec<CleanupStep>,
    /// 成果物の自己チェックで検出された漏洩
    pub leak: Option<LeakError>,
    /// 注記
    pub notes: Vec<String>,
}

impl RunOutcome {
    fn new(ids: RunIds, config: &HarnessConfig) -> Self {
        Self {
            ids,
            started_at: Utc::now(),
            base_url: config.base_url.clone(),
            phases: config.phases.clone(),
            fixtures: None,
            isolated: Vec::new(),
            verdicts: Vec::new(),
            fatal: None,
            cleanup: Vec::new(),
            leak: None,
            notes: Vec::new(),
        }
    }

    /// 合格したフェーズ数
    pub fn passed_count(&self) -> usize {
        self.verdicts.iter().filter(|v| v.passed()).count()
    }

    /// 不合格のフェーズ数
    pub fn failed_count(&self) -> usize {
        self.verdicts.len() - self.passed_count()
    }

    /// 全フェーズが合格し、致命的な失敗も漏洩もない
    pub fn passed(&self) -> bool {
        self.fatal.is_none()
            && self.leak.is_none()
            && !self.verdicts.is_empty()
            && self.verdicts.iter().all(PhaseVerdict::passed)
    }

    /// 終了コード（0: 合格、1: フェーズ不合格、2: 実行を止める失敗または漏洩）
    pub fn exit_code(&self) -> i32 {
        if self.leak.is_some() {
            return 2;
        }
        if let Some(fatal) = &self.fatal {
            return fatal.exit_code();
        }
        if self.passed() {
            0
        } else {
            1
        }
    }
}

struct UpstreamPlan {
    api_type: String,
    base_url: String,
    key_1: String,
    key_2: Option<String>,
    source: String,
}

struct Fixtures {
    credential: ClientCredential,
    model: String,
    layout: FixtureLayout,
}

/// 後片付けが必要な状態
#[derive(Default)]
struct Teardown {
    original_config: Option<String>,
    service_dirty: bool,
    providers: Vec<String>,
    token: Option<ClientCredential>,
}

/// 検証実行のオーケストレータ
pub struct RunOrchestrator<S: ServiceLifecycle> {
    config: HarnessConfig,
    client: ServiceClient,
    service: S,
    switcher: ConfigSwitcher,
    isolation: IsolationController,
    ids: RunIds,
}

impl<S: ServiceLifecycle> RunOrchestrator<S> {
    /// 新しい実行IDでオーケストレータを作成する
    pub fn new(config: HarnessConfig, client: ServiceClient, service: S) -> Self {
        let ids = RunIds::generate(&config.prefix_root, Utc::now());
        Self::with_ids(config, client, service, ids)
    }

    /// 識別子を指定して作成する
    pub fn with_ids(config: HarnessConfig, client: ServiceClient, service: S, ids: RunIds) -> Self {
        Self {
            switcher: ConfigSwitcher::new(config.config_path.clone()),
            isolation: IsolationController::new(ids.prefix.clone()),
            config,
            client,
            service,
            ids,
        }
    }

    /// 識別子
    pub fn ids(&self) -> &RunIds {
        &self.ids
    }

    /// サービスのライフサイクル
    pub fn service(&self) -> &S {
        &self.service
    }

    /// 1回の検証を実行する
    ///
    /// 準備やフェーズで失敗しても後片付けは必ず行い、結果は `RunOutcome` に集約する。
    pub async fn execute(&mut self) -> RunOutcome {
        let mut outcome = RunOutcome::new(self.ids.clone(), &self.config);
        let mut teardown = Teardown::default();
        info!(
            run_id = %self.ids.run_id,
            base_url = %self.config.base_url,
            phases = self.config.phases.len(),
            "Verification run started"
        );

        if let Err(e) = self.setup_and_run(&mut outcome, &mut teardown).await {
            error!(kind = e.kind(), "Run aborted: {}", e);
            outcome.fatal = Some(e);
        }
        outcome.cleanup = self.teardown(teardown).await;

        info!(
            run_id = %self.ids.run_id,
            passed = outcome.passed_count(),
            failed = outcome.failed_count(),
            "Verification run finished"
        );
        outcome
    }

    async fn setup_and_run(
        &mut self,
        outcome: &mut RunOutcome,
        teardown: &mut Teardown,
    ) -> Result<(), HarnessError> {
        self.preflight(teardown).await?;

        if self.config.email.is_empty() || self.config.password.is_empty() {
            return Err(HarnessError::Setup(
                "EMAIL and PASSWORD must be set for admin login".to_string(),
            ));
        }
        self.client
            .authenticate(
                &self.config.email,
                &self.config.password,
                self.config.bootstrap_code.as_deref(),
            )
            .await?;
        info!("Admin login succeeded");

        let upstream = self.source_upstream().await?;

        self.isolation.isolate(&self.client).await?;
        outcome.isolated = self
            .isolation
            .snapshot()
            .iter()
            .map(|(name, keys)| (name.clone(), keys.len()))
            .collect();

        teardown.original_config = Some(self.switcher.capture()?);

        let fixtures = self.create_fixtures(&upstream, teardown).await?;
        outcome.fixtures = Some(FixtureSummary {
            provider_a: self.ids.provider_a.clone(),
            provider_b: self.ids.provider_b.clone(),
            token_name: self.ids.token_name.clone(),
            model: fixtures.model.clone(),
            api_type: upstream.api_type.clone(),
            upstream_base_url: mask_secret(&upstream.base_url, 12),
            key_count: if upstream.key_2.is_some() { 2 } else { 1 },
            credential_source: upstream.source.clone(),
        });
        if !fixtures.layout.has_two_keys() {
            outcome.notes.push(
                "Key-level checks are skipped: only one distinguishable upstream key is available (set UPSTREAM_API_KEY_2 to verify key rotation)."
                    .to_string(),
            );
        }

        self.run_phases(&fixtures, outcome, teardown).await
    }

    async fn preflight(&mut self, teardown: &mut Teardown) -> Result<(), HarnessError> {
        self.service.build().await?;
        match self.client.probe_health(&self.config.health_path).await {
            Ok(status) if status == 200 || status == 401 => {
                info!(status, "Service is already running");
                return Ok(());
            }
            Ok(status) => debug!(status, "Preflight health probe not ready"),
            Err(e) => debug!("Preflight health probe failed: {}", e),
        }

        info!("Service is not reachable, starting it");
        // 起動に失敗しても後片付けで停止する
        teardown.service_dirty = true;
        self.service.start().await?;
        let readiness = self.service.wait_ready(self.config.ready_timeout).await;
        match readiness.failure_reason() {
            None => Ok(()),
            Some(reason) => Err(HarnessError::Setup(format!(
                "service did not become ready at preflight: {}",
                reason
            ))),
        }
    }

    /// 上流資格情報を決める（環境変数を優先し、不足分は既存の provider から借りる）
    async fn source_upstream(&self) -> Result<UpstreamPlan, HarnessError> {
        let env = &self.config.upstream;
        let mut source = "environment".to_string();
        let mut borrowed_keys: Vec<String> = Vec::new();
        let mut borrowed_api_type = None;
        let mut borrowed_base_url = None;

        if env.key_1.is_none() || env.api_type.is_none() || env.base_url.is_none() {
            let providers = self.client.list_providers().await?;
            if let Some(found) = providers
                .into_iter()
                .find(|p| p.has_keys() && !p.name.starts_with(&self.ids.prefix))
            {
                borrowed_keys = self.client.provider_keys_raw(&found.name).await?;
                let detail = self.client.get_provider(&found.name).await?;
                borrowed_api_type = detail.api_type;
                borrowed_base_url = detail.base_url;
                source = format!("provider {}", found.name);
            }
        }

        let (key_1, key_2) = match env.key_1.clone() {
            Some(k1) => (Some(k1), env.key_2.clone()),
            None => {
                let mut keys = borrowed_keys.into_iter();
                let k1 = keys.next();
                (k1, env.key_2.clone().or_else(|| keys.next()))
            }
        };
        let key_1 = key_1
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                HarnessError::Setup(
                    "no upstream key: set UPSTREAM_API_KEY_1 or register a keyed provider"
                        .to_string(),
                )
            })?;
        let key_2 = key_2
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && *k != key_1);

        let api_type = env
            .api_type
            .clone()
            .or(borrowed_api_type)
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "openai".to_string());
        let base_url = env
            .base_url
            .clone()
            .or(borrowed_base_url)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                HarnessError::Setup(
                    "no upstream base URL: set UPSTREAM_BASE_URL or register a provider with base_url"
                        .to_string(),
                )
            })?;
        let (base_url, note) = normalize_provider_base_url(&api_type, &base_url);
        if let Some(note) = note {
            info!("{}", note);
        }

        register_secret(&key_1);
        if let Some(k2) = &key_2 {
            register_secret(k2);
        }
        info!(
            source = %source,
            api_type = %api_type,
            base_url = %mask_secret(&base_url, 12),
            key_1 = %mask_secret(&key_1, 0),
            has_key_2 = key_2.is_some(),
            "Upstream credentials resolved"
        );
        Ok(UpstreamPlan {
            api_type,
            base_url,
            key_1,
            key_2,
            source,
        })
    }

    async fn create_fixtures(
        &self,
        upstream: &UpstreamPlan,
        teardown: &mut Teardown,
    ) -> Result<Fixtures, HarnessError> {
        let a = &self.ids.provider_a;
        let b = &self.ids.provider_b;

        for name in [a, b] {
            self.client
                .create_provider(&CreateProviderRequest {
                    name: name.clone(),
                    api_type: upstream.api_type.clone(),
                    base_url: upstream.base_url.clone(),
                    models_endpoint: None,
                })
                .await?;
            teardown.providers.push(name.clone());
            info!(provider = %name, "Fixture provider created");
        }

        self.client.add_key(a, &upstream.key_1).await?;
        self.client.add_key(b, &upstream.key_1).await?;
        if let Some(k2) = &upstream.key_2 {
            self.client.add_key(a, k2).await?;
        }

        let model_ids = self.client.refresh_models(a).await?;
        let model = pick_model_id(&model_ids, self.config.upstream.preferred_model.as_deref());
        info!(model = %model, available = model_ids.len(), "Dispatch model selected");
        for name in [a, b] {
            self.client.update_model_cache(name, &model).await?;
            self.client.upsert_model_price(name, &model).await?;
        }

        let credential = self.client.create_client_token(&self.ids.token_name).await?;
        teardown.token = Some(credential.clone());
        info!(token_id = %credential.id, "Fixture client token created");

        Ok(Fixtures {
            layout: FixtureLayout::new(a, b, &upstream.key_1, upstream.key_2.as_deref()),
            credential,
            model,
        })
    }

    async fn run_phases(
        &mut self,
        fixtures: &Fixtures,
        outcome: &mut RunOutcome,
        teardown: &mut Teardown,
    ) -> Result<(), HarnessError> {
        let runner = PhaseRunner::new(
            &self.client,
            &fixtures.credential,
            &fixtures.model,
            &fixtures.layout,
            self.config.log_poll,
        );
        let phases = self.config.phases.clone();

        for (i, phase) in phases.iter().enumerate() {
            info!(
                strategy = %phase.strategy,
                requests = phase.request_count,
                "Phase {}/{} started",
                i + 1,
                phases.len()
            );
            teardown.service_dirty = true;
            match runner
                .run(phase, &self.switcher, &mut self.service, self.config.ready_timeout)
                .await
            {
                Ok(verdict) => outcome.verdicts.push(verdict),
                Err(e) => {
                    if let HarnessError::Readiness { log_tail, .. } = &e {
                        if !log_tail.is_empty() {
                            warn!("Service output tail:\n{}", log_tail);
                        }
                    }
                    outcome.verdicts.push(PhaseVerdict::not_run(*phase, e.to_string()));
                    for rest in &phases[i + 1..] {
                        outcome.verdicts.push(PhaseVerdict::not_run(
                            *rest,
                            format!("aborted after {} phase failed", phase.strategy),
                        ));
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn teardown(&mut self, state: Teardown) -> Vec<CleanupStep> {
        let mut chain = CleanupChain::default();

        if let Some(original) = &state.original_config {
            chain.record(
                format!("restore {}", self.switcher.path().display()),
                self.switcher.restore(original),
            );
        }

        if state.service_dirty {
            chain.record("stop service", self.service.stop().await);
            chain.record("release service port", self.service.release_port().await);
            let started = self.service.start().await;
            let started_ok = started.is_ok();
            chain.record("start service with original config", started);
            if started_ok {
                let readiness = self
                    .service
                    .wait_ready(self.config.teardown_ready_timeout)
                    .await;
                chain.record(
                    "wait for service readiness",
                    readiness.failure_reason().map_or(Ok(()), Err),
                );
            }
        }

        for restored in self.isolation.restore(&self.client).await {
            chain.record(
                format!(
                    "restore {} key(s) to provider {}",
                    restored.key_count, restored.provider
                ),
                restored.result,
            );
        }

        if let Some(token) = &state.token {
            match self.client.delete_client_token(&token.id).await {
                Ok(()) => chain.record(format!("delete client token {}", token.id), Ok::<(), String>(())),
                Err(e) => {
                    warn!("Client token delete failed, disabling it instead: {}", e);
                    chain.record(
                        format!("disable client token {} (delete failed)", token.id),
                        self.client.toggle_client_token(&token.id).await,
                    );
                }
            }
        }

        for name in state.providers.iter().rev() {
            chain.record(
                format!("delete provider {}", name),
                self.client.delete_provider(name).await,
            );
        }

        chain.steps
    }
}
