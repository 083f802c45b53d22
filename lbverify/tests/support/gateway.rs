//! wiremock 上の偽ゲートウェイ
//!
//! provider/key/トークン/リクエストログを内部状態として保持し、
//! `/v1/chat/completions` を現在の戦略に従って振り分ける。

#![allow(dead_code)]

use lbverify::common::types::Strategy;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// 既存（フィクスチャ外）provider のキー
pub const LEGACY_KEY: &str = "sk-legacy-key-000000001";
/// 管理者アクセストークン
pub const ADMIN_TOKEN: &str = "fake-admin-access-token";

#[derive(Debug, Clone)]
pub struct FakeProvider {
    pub api_type: String,
    pub base_url: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FakeLogEntry {
    pub id: u64,
    pub provider: String,
    pub api_key: String,
}

#[derive(Debug)]
pub struct GatewayState {
    pub providers: BTreeMap<String, FakeProvider>,
    pub tokens: BTreeMap<String, String>,
    pub logs: Vec<FakeLogEntry>,
    pub strategy: Strategy,
    /// round_robin が常に先頭を返す不具合を再現する
    pub stuck_round_robin: bool,
    /// ヘルスエンドポイントが 503 を返す（サービス停止中を再現する）
    pub health_down: bool,
    pub restarts: usize,
    next_token_id: u64,
    rr_cursor: usize,
    key_cursor: BTreeMap<String, usize>,
}

impl GatewayState {
    fn new() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "legacy".to_string(),
            FakeProvider {
                api_type: "openai".to_string(),
                base_url: "https://legacy.example.com".to_string(),
                keys: vec![LEGACY_KEY.to_string()],
            },
        );
        providers.insert(
            "empty".to_string(),
            FakeProvider {
                api_type: "openai".to_string(),
                base_url: "https://empty.example.com".to_string(),
                keys: Vec::new(),
            },
        );
        Self {
            providers,
            tokens: BTreeMap::new(),
            logs: Vec::new(),
            strategy: Strategy::RoundRobin,
            stuck_round_robin: false,
            health_down: false,
            restarts: 0,
            next_token_id: 1,
            rr_cursor: 0,
            key_cursor: BTreeMap::new(),
        }
    }

    /// 再起動（戦略の再読み込みとカーソルの初期化）
    pub fn restart(&mut self, strategy: Strategy) {
        self.strategy = strategy;
        self.restarts += 1;
        self.rr_cursor = 0;
        self.key_cursor.clear();
    }

    fn dispatch(&mut self) -> Option<(String, String)> {
        let candidates: Vec<String> = self
            .providers
            .iter()
            .filter(|(_, p)| !p.keys.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let provider = match self.strategy {
            Strategy::FirstAvailable => candidates[0].clone(),
            Strategy::RoundRobin => {
                let idx = if self.stuck_round_robin {
                    0
                } else {
                    self.rr_cursor % candidates.len()
                };
                self.rr_cursor += 1;
                candidates[idx].clone()
            }
            Strategy::Random => {
                let idx = rand::random::<usize>() % candidates.len();
                candidates[idx].clone()
            }
        };
        let keys = &self.providers[&provider].keys;
        let key = match self.strategy {
            Strategy::FirstAvailable => keys[0].clone(),
            Strategy::RoundRobin => {
                let cursor = self.key_cursor.entry(provider.clone()).or_insert(0);
                let key = keys[*cursor % keys.len()].clone();
                *cursor += 1;
                key
            }
            Strategy::Random => keys[rand::random::<usize>() % keys.len()].clone(),
        };
        Some((provider, key))
    }

    fn provider_json(name: &str, p: &FakeProvider) -> Value {
        let masked: Vec<String> = p.keys.iter().map(|k| format!("{}****", &k[..4])).collect();
        json!({
            "name": name,
            "api_type": p.api_type,
            "base_url": p.base_url,
            "api_keys": masked,
            "enabled": true
        })
    }
}

/// 偽ゲートウェイ
#[derive(Clone)]
pub struct FakeGateway {
    pub state: Arc<Mutex<GatewayState>>,
}

impl FakeGateway {
    /// wiremock サーバーを起動して全ルートを割り当てる
    pub async fn start() -> (MockServer, FakeGateway) {
        let server = MockServer::start().await;
        let gateway = FakeGateway {
            state: Arc::new(Mutex::new(GatewayState::new())),
        };
        Mock::given(any())
            .respond_with(gateway.clone())
            .mount(&server)
            .await;
        (server, gateway)
    }

    /// 状態を参照・変更する
    pub fn with<R>(&self, f: impl FnOnce(&mut GatewayState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }
}

fn body_json(req: &Request) -> Value {
    serde_json::from_slice(&req.body).unwrap_or(Value::Null)
}

fn string_list(v: &Value, field: &str) -> Vec<String> {
    v.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn admin_ok(req: &Request) -> bool {
    req.headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", ADMIN_TOKEN))
}

impl Respond for FakeGateway {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let method = req.method.as_str().to_string();
        let segments: Vec<String> = req
            .url
            .path_segments()
            .map(|s| s.filter(|x| !x.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        let segs: Vec<&str> = segments.iter().map(String::as_str).collect();
        let mut state = self.state.lock().unwrap();

        match (method.as_str(), segs.as_slice()) {
            ("GET", ["auth", "me"]) if state.health_down => ResponseTemplate::new(503),
            ("GET", ["auth", "me"]) => ResponseTemplate::new(401),
            ("POST", ["auth", "login"]) => {
                ResponseTemplate::new(200).set_body_json(json!({"accessToken": ADMIN_TOKEN}))
            }
            ("POST", ["v1", "chat", "completions"]) => {
                let token = req
                    .headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .map(str::to_string);
                if !token.is_some_and(|t| state.tokens.values().any(|v| *v == t)) {
                    return ResponseTemplate::new(401);
                }
                match state.dispatch() {
                    Some((provider, api_key)) => {
                        let id = state.logs.len() as u64 + 100;
                        state.logs.push(FakeLogEntry {
                            id,
                            provider,
                            api_key,
                        });
                        ResponseTemplate::new(200).set_body_json(json!({
                            "object": "chat.completion",
                            "choices": [{"message": {"role": "assistant", "content": "p"}}]
                        }))
                    }
                    None => ResponseTemplate::new(503),
                }
            }
            _ if !admin_ok(req) => ResponseTemplate::new(401),
            ("GET", ["providers"]) => {
                let list: Vec<Value> = state
                    .providers
                    .iter()
                    .map(|(n, p)| GatewayState::provider_json(n, p))
                    .collect();
                ResponseTemplate::new(200).set_body_json(json!(list))
            }
            ("POST", ["providers"]) => {
                let body = body_json(req);
                let name = body["name"].as_str().unwrap_or_default().to_string();
                if name.is_empty() || state.providers.contains_key(&name) {
                    return ResponseTemplate::new(409);
                }
                state.providers.insert(
                    name,
                    FakeProvider {
                        api_type: body["api_type"].as_str().unwrap_or_default().to_string(),
                        base_url: body["base_url"].as_str().unwrap_or_default().to_string(),
                        keys: Vec::new(),
                    },
                );
                ResponseTemplate::new(200)
            }
            ("GET", ["providers", name]) => match state.providers.get(*name) {
                Some(p) => ResponseTemplate::new(200).set_body_json(GatewayState::provider_json(name, p)),
                None => ResponseTemplate::new(404),
            },
            ("DELETE", ["providers", name]) => match state.providers.remove(*name) {
                Some(_) => ResponseTemplate::new(204),
                None => ResponseTemplate::new(404),
            },
            ("GET", ["providers", name, "keys", "raw"]) => match state.providers.get(*name) {
                Some(p) => {
                    let keys: Vec<Value> = p.keys.iter().map(|k| json!({"value": k})).collect();
                    ResponseTemplate::new(200).set_body_json(json!({"keys": keys}))
                }
                None => ResponseTemplate::new(404),
            },
            ("POST", ["providers", name, "keys"]) => {
                let key = body_json(req)["key"].as_str().unwrap_or_default().to_string();
                match state.providers.get_mut(*name) {
                    Some(p) => {
                        p.keys.push(key);
                        ResponseTemplate::new(201)
                    }
                    None => ResponseTemplate::new(404),
                }
            }
            ("POST", ["providers", name, "keys", "batch"]) => {
                let keys = string_list(&body_json(req), "keys");
                match state.providers.get_mut(*name) {
                    Some(p) => {
                        p.keys.extend(keys);
                        ResponseTemplate::new(200)
                    }
                    None => ResponseTemplate::new(404),
                }
            }
            ("DELETE", ["providers", name, "keys", "batch"]) => {
                let keys = string_list(&body_json(req), "keys");
                match state.providers.get_mut(*name) {
                    Some(p) => {
                        p.keys.retain(|k| !keys.contains(k));
                        ResponseTemplate::new(200)
                    }
                    None => ResponseTemplate::new(404),
                }
            }
            ("GET", ["models", name]) if state.providers.contains_key(*name) => {
                ResponseTemplate::new(200).set_body_json(json!({
                    "object": "list",
                    "data": [{"id": "gpt-4o-mini"}, {"id": "gpt-4o"}]
                }))
            }
            ("POST", ["models", _, "cache"]) | ("POST", ["admin", "model-prices"]) => {
                ResponseTemplate::new(200)
            }
            ("POST", ["admin", "tokens"]) => {
                let id = state.next_token_id;
                state.next_token_id += 1;
                let token = format!("fake-client-token-{:04}", id);
                state.tokens.insert(id.to_string(), token.clone());
                ResponseTemplate::new(201).set_body_json(json!({"id": id, "token": token}))
            }
            ("DELETE", ["admin", "tokens", id]) => match state.tokens.remove(*id) {
                Some(_) => ResponseTemplate::new(204),
                None => ResponseTemplate::new(404),
            },
            ("POST", ["admin", "tokens", _, "toggle"]) => ResponseTemplate::new(200),
            ("GET", ["admin", "logs", "requests"]) => {
                let data: Vec<Value> = state
                    .logs
                    .last()
                    .map(|e| {
                        vec![json!({
                            "id": e.id,
                            "provider": e.provider,
                            "api_key": e.api_key,
                            "status_code": 200,
                            "response_time_ms": 3,
                            "success": true
                        })]
                    })
                    .unwrap_or_default();
                ResponseTemplate::new(200)
                    .set_body_json(json!({"total": state.logs.len(), "data": data}))
            }
            _ => ResponseTemplate::new(404),
        }
    }
}
