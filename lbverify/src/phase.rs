//! 1フェーズ分の実行
//!
//! 戦略の書き換え → サービス再起動 → ready 待ち → 逐次ディスパッチ → ログからの帰属読み戻し。
//! ディスパッチは1件ずつ応答を待ってから次を発行する（順序そのものが検証対象のため）。

use crate::client::types::{RecordKey, RequestLogEntry};
use crate::client::{ClientError, ServiceClient};
use crate::common::error::HarnessError;
use crate::common::types::{ClientCredential, ObservationRecord, Phase, PhaseVerdict};
use crate::config_switch::ConfigSwitcher;
use crate::process::ServiceLifecycle;
use crate::redact::{mask_key, redact_text};
use crate::retry::{poll_until, RetryPolicy};
use crate::verifier::{self, FixtureLayout};
use std::convert::Infallible;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// フェーズ実行器
#[derive(Debug)]
pub struct PhaseRunner<'a> {
    client: &'a ServiceClient,
    credential: &'a ClientCredential,
    model: &'a str,
    layout: &'a FixtureLayout,
    log_poll: RetryPolicy,
}

impl<'a> PhaseRunner<'a> {
    /// 実行器を作成する
    pub fn new(
        client: &'a ServiceClient,
        credential: &'a ClientCredential,
        model: &'a str,
        layout: &'a FixtureLayout,
        log_poll: RetryPolicy,
    ) -> Self {
        Self {
            client,
            credential,
            model,
            layout,
            log_poll,
        }
    }

    /// 戦略を書き換えてサービスを再起動し、ready を待つ
    pub async fn prepare<S>(
        &self,
        phase: &Phase,
        switcher: &ConfigSwitcher,
        service: &mut S,
        ready_timeout: Duration,
    ) -> Result<(), HarnessError>
    where
        S: ServiceLifecycle + ?Sized,
    {
        let context = format!("restart for {}", phase.strategy);
        switcher.set(phase.strategy)?;
        info!(strategy = %phase.strategy, config = %switcher.path().display(), "Strategy written, restarting service");

        if let Err(e) = service.restart().await {
            return Err(HarnessError::Readiness {
                context,
                reason: e.to_string(),
                log_tail: String::new(),
            });
        }
        let readiness = service.wait_ready(ready_timeout).await;
        if let Some(reason) = readiness.failure_reason() {
            return Err(HarnessError::Readiness {
                context,
                reason,
                log_tail: readiness.log_tail().to_string(),
            });
        }
        info!(strategy = %phase.strategy, "Service ready");
        Ok(())
    }

    async fn latest_entry(&self) -> Result<Option<RequestLogEntry>, ClientError> {
        self.client.latest_request_log(self.credential, self.model).await
    }

    /// 直前と異なる記録が現れるまで待つ
    ///
    /// 見つからなかった場合は最後の読み出しエラーを返す（読めたが新しい記録が無いなら `None`）。
    async fn await_new_entry(
        &self,
        previous: Option<&RecordKey>,
    ) -> Result<RequestLogEntry, Option<String>> {
        let last_error: Mutex<Option<String>> = Mutex::new(None);
        let found = poll_until(self.log_poll, |attempt| {
            let last_error = &last_error;
            async move {
                let read = self.latest_entry().await;
                let mut slot = last_error.lock().unwrap_or_else(|p| p.into_inner());
                match read {
                    Ok(entry) => {
                        *slot = None;
                        Ok::<_, Infallible>(
                            entry.filter(|e| Some(&e.record_key()) != previous),
                        )
                    }
                    Err(e) => {
                        let message = redact_text(&e.to_string());
                        warn!(attempt = attempt + 1, "Request log read failed: {}", message);
                        *slot = Some(message);
                        Ok(None)
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|never| match never {});

        match found {
            Some(entry) => Ok(entry),
            None => Err(last_error.into_inner().unwrap_or_else(|p| p.into_inner())),
        }
    }

    /// `request_count` 件のディスパッチを逐次発行し、観測列を返す
    ///
    /// ログ記録が見つからなかったリクエストは帰属なし（`provider == None`）として残す。
    pub async fn dispatch(&self, phase: &Phase) -> Vec<ObservationRecord> {
        let mut last_key = match self.latest_entry().await {
            Ok(entry) => entry.map(|e| e.record_key()),
            Err(e) => {
                warn!(strategy = %phase.strategy, "Baseline request log read failed: {}", redact_text(&e.to_string()));
                None
            }
        };
        let mut observations = Vec::with_capacity(phase.request_count);

        for index in 0..phase.request_count {
            let started = Instant::now();
            let http_status = match self.client.chat_once(self.credential, self.model).await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(strategy = %phase.strategy, index = index + 1, "Dispatch failed: {}", e);
                    None
                }
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            let entry = self.await_new_entry(last_key.as_ref()).await;
            let record = match entry {
                Ok(entry) => {
                    last_key = Some(entry.record_key());
                    ObservationRecord {
                        sequence_index: index,
                        http_status,
                        latency_ms,
                        server_latency_ms: entry.response_time_ms,
                        provider: entry
                            .provider
                            .map(|p| p.trim().to_string())
                            .filter(|p| !p.is_empty()),
                        // サーバーの表示モードに関係なくローカルで再マスクする
                        key_hint: entry
                            .api_key
                            .filter(|k| !k.trim().is_empty())
                            .map(|k| mask_key(k.trim())),
                        attribution_error: None,
                    }
                }
                Err(read_error) => {
                    match &read_error {
                        Some(e) => warn!(
                            strategy = %phase.strategy,
                            index = index + 1,
                            "Request log unreadable after {} attempts: {}",
                            self.log_poll.max_attempts,
                            e
                        ),
                        None => warn!(
                            strategy = %phase.strategy,
                            index = index + 1,
                            "No request log record after {} attempts",
                            self.log_poll.max_attempts
                        ),
                    }
                    ObservationRecord {
                        sequence_index: index,
                        http_status,
                        latency_ms,
                        server_latency_ms: None,
                        provider: None,
                        key_hint: None,
                        attribution_error: read_error,
                    }
                }
            };
            info!(
                strategy = %phase.strategy,
                index = index + 1,
                status = ?record.http_status,
                latency_ms = record.latency_ms,
                provider = record.provider.as_deref().unwrap_or("-"),
                key = record.key_hint.as_deref().unwrap_or("-"),
                "Dispatch observed"
            );
            observations.push(record);
        }
        observations
    }

    /// 準備・ディスパッチ・検証をまとめて行う
    pub async fn run<S>(
        &self,
        phase: &Phase,
        switcher: &ConfigSwitcher,
        service: &mut S,
        ready_timeout: Duration,
    ) -> Result<PhaseVerdict, HarnessError>
    where
        S: ServiceLifecycle + ?Sized,
    {
        self.prepare(phase, switcher, service, ready_timeout).await?;
        let observations = self.dispatch(phase).await;
        let (provider_check, key_check) = verifier::check(phase.strategy, &observations, self.layout);
        let verdict = PhaseVerdict {
            phase: *phase,
            provider_check,
            key_check,
            observations,
            error: None,
        };
        info!(
            strategy = %phase.strategy,
            provider_check = verdict.provider_check.label(),
            key_check = verdict.key_check.label(),
            passed = verdict.passed(),
            "Phase finished"
        );
        Ok(verdict)
    }
}
