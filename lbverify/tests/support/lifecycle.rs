//! 偽のサービスライフサイクル
//!
//! 起動のたびにディスク上の設定ファイルから strategy を読み直し、偽ゲートウェイに反映する。

#![allow(dead_code)]

use super::gateway::FakeGateway;
use async_trait::async_trait;
use lbverify::common::types::Strategy;
use lbverify::config_switch::ConfigSwitcher;
use lbverify::process::{ProcessError, ProcessState, Readiness, ServiceLifecycle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct FakeLifecycle {
    gateway: FakeGateway,
    switcher: ConfigSwitcher,
    /// この strategy で起動した場合は ready にならない
    pub never_ready_with: Option<Strategy>,
    pub events: Arc<Mutex<Vec<String>>>,
    current: Option<Strategy>,
    state: ProcessState,
}

impl FakeLifecycle {
    pub fn new(gateway: FakeGateway, config_path: PathBuf) -> Self {
        Self {
            gateway,
            switcher: ConfigSwitcher::new(config_path),
            never_ready_with: None,
            events: Arc::new(Mutex::new(Vec::new())),
            current: None,
            state: ProcessState::Stopped,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ServiceLifecycle for FakeLifecycle {
    async fn build(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ProcessError> {
        let strategy = self
            .switcher
            .current_strategy()
            .map_err(|e| ProcessError::Io(std::io::Error::other(e.to_string())))?
            .unwrap_or(Strategy::RoundRobin);
        self.gateway.with(|g| g.restart(strategy));
        self.current = Some(strategy);
        self.state = ProcessState::Starting;
        self.push(format!("start:{}", strategy));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProcessError> {
        self.state = ProcessState::Stopped;
        self.push("stop".to_string());
        Ok(())
    }

    async fn release_port(&mut self) -> Result<(), ProcessError> {
        self.push("release_port".to_string());
        Ok(())
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> Readiness {
        if self.current.is_some() && self.current == self.never_ready_with {
            self.push("wait_ready:timeout".to_string());
            return Readiness::TimedOut {
                log_tail: "fake service: listener never came up".to_string(),
            };
        }
        self.state = ProcessState::Ready;
        self.push("wait_ready:ok".to_string());
        Readiness::Ready
    }

    fn state(&self) -> ProcessState {
        self.state
    }
}
